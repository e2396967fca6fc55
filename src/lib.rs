/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of rustronomy-cellseg.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

#![doc(
  html_logo_url = "https://raw.githubusercontent.com/smups/rustronomy/main/logos/Rustronomy_ferris.png?raw=true"
)]
//! Rustronomy-cellseg turns the per-voxel class probabilities of a neural
//! network into instance label maps, using a marker-controlled watershed
//! transform (see Beucher & Meyer, 1993[^1]).
//!
//! # Features
//! The crate is organised around the stages of a post-processing run:
//! 1. *Seed construction* ([`seeds`]): thresholding the probability channels
//! into seeds, a foreground mask and a flooding surface, for seven different
//! channel layouts ([`volume::ChannelMode`]).
//! 2. *Watershed growth* ([`watershed`]): a priority flood from the seeds,
//! restricted to the foreground.
//! 3. *Threshold calibration* ([`calibrate`]): sweeping the thresholds over a set
//! of annotated samples to find the values that reproduce the annotated
//! instance count and overlap.
//! 4. *Clean-up* ([`cleanup`], [`voronoi`]): removing small and non-circular
//! instances, repairing large blobs and filling the remaining foreground by
//! nearest-seed assignment.
//! 5. *Ensemble prediction* ([`ensemble`]): averaging a model over the flips
//! and rotations of its input, eight for planar images and sixteen for
//! volumes.
//!
//! Detection-driven segmentation of ring shaped cells lives in [`detection`]
//! and [`donut`]. Extra functionality can be accessed via cargo feature gates.
//! A list of all additional features [can be found below](#cargo-feature-gates).
//!
//! # Quickstart
//! To use the latest release of Rustronomy-cellseg in a cargo project, add
//! the rustronomy-cellseg crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! rustronomy-cellseg = "0.1.0"
//! ```
//! If you want to use the latest (unstable) development version of
//! rustronomy-cellseg, you can do so by using the `git` field rather than the
//! `version` field:
//! ```toml
//! rustronomy-cellseg = {git = "https://github.com/smups/rustronomy-cellseg"}
//! ```
//!
//! ## Short example: segmenting a foreground/contour prediction
//! Like the other rustronomy crates, `rustronomy-cellseg` uses the builder
//! pattern. Configure a [`pipeline::SegmenterBuilder`], call `build()` to get a
//! (`Sync`&`Send`) segmenter and run it on as many volumes as you like.
//!
//! All volumes are three dimensional `(z, y, x)`; planar images simply have a
//! single slice. Probabilities carry their channels on the last axis.
//! ```rust
//! use rustronomy_cellseg::prelude::*;
//!
//! //Two square cells, no contour
//! let mut data = nd::Array4::<f32>::zeros((1, 32, 48, 2));
//! data.slice_mut(nd::s![0, 8..24, 6..22, 0]).fill(0.9);
//! data.slice_mut(nd::s![0, 8..24, 26..42, 0]).fill(0.9);
//!
//! let segmenter = SegmenterBuilder::new(ChannelMode::BC).build().unwrap();
//! let labels = segmenter.segment(&data).unwrap();
//! assert_eq!(labels.instance_count(), 2);
//! ```
//! [^1]: S. Beucher and F. Meyer. **The morphological approach to segmentation: the watershed transformation.** *In Mathematical Morphology in Image Processing*, 1993.
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! Jemalloc is enabled though usage of the `jemalloc` crate, which increases
//! compile times considerably. However, enabling this feature can also greatly
//! improve run-time performance of the parallel stages, especially on machines
//! with many cores. Jemalloc must be installed on the host system.
//! - `plots`: with this feature enabled, the watershed can render every water
//! level as a png, the calibrator charts its sweep curves and the detection
//! watershed plots its intensity profiles. Plotting support adds the `plotters`
//! crate as a dependency, [see the `plotters` documentation for details](https://docs.rs/plotters/).
//! - `progress`: this feature enables progress bars for the flood and the
//! calibration sweep. Enabling this feature adds the `indicatif` crate as a
//! dependency.
//! - `debug`: this feature enables debug and performance monitoring output. This
//! can negatively impact performance. Enabling this feature does not add additional
//! dependencies.
//!
//! All stages log through the [`log`](https://docs.rs/log) facade; attach any
//! logger implementation to see their output.

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

pub mod calibrate;
pub mod cleanup;
pub mod detection;
pub mod diagnostics;
pub mod donut;
pub mod ensemble;
pub mod error;
pub mod measure;
pub mod morphology;
pub mod pipeline;
pub mod seeds;
pub mod spatial;
pub mod volume;
pub mod voronoi;
pub mod watershed;

#[cfg(feature = "plots")]
pub mod plotting;

//Utility prelude for batch import
pub mod prelude {
  pub use ndarray as nd;

  pub use crate::calibrate::{Calibration, CalibrationImage, CalibrationSample, Calibrator, CalibratorBuilder};
  pub use crate::cleanup::{filter_by_circularity, remove_small_objects, repair_large_blobs, InstanceReport, Verdict};
  pub use crate::detection::{remove_close_points, DetectionBuilder, DetectionWatershed};
  pub use crate::ensemble::{EnsembleBuilder, EnsemblePredictor, ModelOutput, Predictor};
  pub use crate::error::{SegError, SegResult};
  pub use crate::measure::Connectivity;
  pub use crate::pipeline::{watershed_by_channels, Segmenter, SegmenterBuilder};
  pub use crate::seeds::{ForegroundMorph, MorphOp, MorphOrder, SeedBuilder, SeedConstructor, Seeds};
  pub use crate::volume::{ChannelMode, LabelMap, Labels, ProbabilityVolume, Resolution, ThresholdSet};
  pub use crate::voronoi::{VoronoiBuilder, VoronoiFiller, VoronoiLabels};
  pub use crate::watershed::{MarkerWatershed, Watershed, WatershedBuilder, WatershedUtils};
}

#[inline]
pub(crate) fn neighbours_4con(index: &(usize, usize)) -> Vec<(usize, usize)> {
  let (y, x): (isize, isize) = (index.0 as isize, index.1 as isize);
  [(y + 1, x), (y, x + 1), (y, x - 1), (y - 1, x)]
    .iter()
    .filter_map(|&(y, x)| if y < 0 || x < 0 { None } else { Some((y as usize, x as usize)) })
    .collect()
}
