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

//! Top-level inference flow: probability volume in, instance label map out.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use ndarray as nd;
use rayon::prelude::*;

use crate::diagnostics::Diagnostics;
use crate::error::{SegError, SegResult};
use crate::measure::{label_mask, Connectivity};
use crate::morphology::{self as morph, Footprint};
use crate::seeds::{ForegroundMorph, MorphOp, SeedBuilder, SeedConstructor, Seeds};
use crate::volume::{ChannelMode, LabelMap, ProbabilityVolume, ThresholdSet, BACKGROUND};
use crate::watershed::{water_levels, MarkerWatershed, Watershed, WatershedBuilder};

#[derive(Debug, Clone)]
/// Builder for a complete seed → flood → clean-up run. Nothing but the channel
/// mode is required; everything else has a working default.
pub struct SegmenterBuilder {
  seeds: SeedBuilder,
  watershed: WatershedBuilder,
  z_filter: Option<usize>,
  diagnostics: Option<PathBuf>,
}

impl SegmenterBuilder {
  pub fn new(mode: ChannelMode) -> Self {
    SegmenterBuilder {
      seeds: SeedBuilder::new(mode),
      watershed: WatershedBuilder::new(),
      z_filter: None,
      diagnostics: None,
    }
  }

  pub fn set_thresholds(mut self, thresholds: ThresholdSet) -> Self {
    self.seeds = self.seeds.set_thresholds(thresholds);
    self
  }

  pub fn set_seed_morph(mut self, ops: &[MorphOp]) -> Self {
    self.seeds = self.seeds.set_seed_morph(ops);
    self
  }

  pub fn set_foreground_morph(mut self, fg_morph: ForegroundMorph) -> Self {
    self.seeds = self.seeds.set_foreground_morph(fg_morph);
    self
  }

  /// Remove seeds smaller than `min_size` voxels before growth.
  pub fn set_remove_before(mut self, min_size: usize) -> Self {
    self.watershed = self.watershed.set_remove_before(min_size);
    self
  }

  /// Remove instances smaller than `min_size` voxels after growth.
  pub fn set_remove_after(mut self, min_size: usize) -> Self {
    self.watershed = self.watershed.set_remove_after(min_size);
    self
  }

  /// Median filter every slice of every channel with a `size`x`size` window
  /// before building seeds.
  pub fn set_z_filter(mut self, size: usize) -> Self {
    self.z_filter = Some(size);
    self
  }

  /// Write the seed map and foreground mask into `dir`.
  pub fn set_diagnostics_dir(mut self, dir: &Path) -> Self {
    self.diagnostics = Some(dir.to_path_buf());
    self
  }

  pub fn build(self) -> SegResult<Segmenter> {
    if self.z_filter == Some(0) {
      return Err(SegError::InvalidConfig("median filter size has to be at least 1".into()));
    }
    Ok(Segmenter {
      seeds: self.seeds.build()?,
      watershed: self.watershed.build()?,
      z_filter: self.z_filter,
      diagnostics: self.diagnostics.map(Diagnostics::new),
    })
  }
}

#[derive(Debug, Clone)]
pub struct Segmenter {
  seeds: SeedConstructor,
  watershed: MarkerWatershed,
  z_filter: Option<usize>,
  diagnostics: Option<Diagnostics>,
}

impl Segmenter {
  pub fn mode(&self) -> ChannelMode {
    self.seeds.mode()
  }

  /// Segment a probability volume into instances.
  pub fn segment(&self, data: &ProbabilityVolume) -> SegResult<LabelMap> {
    self.segment_with_seeds(data).map(|(map, _)| map)
  }

  /// Like [`Segmenter::segment`], but also hands back the intermediate seeds.
  pub fn segment_with_seeds(&self, data: &ProbabilityVolume) -> SegResult<(LabelMap, Seeds)> {
    //(1) optional median filtering
    let data = match self.z_filter {
      Some(size) => Cow::Owned(z_filter(data, size)),
      None => Cow::Borrowed(data),
    };

    //(2) seeds, foreground and flooding surface
    let seeds = self.seeds.build(&data)?;

    //(3) flood
    let mask = seeds.foreground.as_ref().map(|fg| fg.view());
    let mut labels = self.watershed.grow_labels(seeds.semantic.view(), &seeds.seed_map, mask)?;

    //(4) the synthetic background basin is not an instance
    if let Some(bg) = seeds.background_label {
      labels.par_mapv_inplace(|l| if l == bg { BACKGROUND } else { l });
    }
    let map = LabelMap::from_labels(&labels);
    log::info!(
      "{} segmentation: {} instances, stored as {}",
      self.mode(),
      map.instance_count(),
      map.dtype_name()
    );

    //(5) diagnostics
    if let Some(ref diag) = self.diagnostics {
      diag.save_labels_like("seed_map", &seeds.seed_map, &map);
      if let Some(ref fg) = seeds.foreground {
        diag.save_mask("foreground", fg.view());
      }
    }

    Ok((map, seeds))
  }
}

/// One-shot segmentation with default settings apart from the thresholds.
pub fn watershed_by_channels(
  data: &ProbabilityVolume,
  mode: ChannelMode,
  thresholds: ThresholdSet,
) -> SegResult<LabelMap> {
  SegmenterBuilder::new(mode).set_thresholds(thresholds).build()?.segment(data)
}

/// Median filter every z-slice of every channel in-plane. Even sizes are
/// bumped to the next odd size.
pub fn z_filter(data: &ProbabilityVolume, size: usize) -> ProbabilityVolume {
  let mut out = data.clone();
  for c in 0..data.shape()[3] {
    let filtered = morph::median_filter_slices(data.index_axis(nd::Axis(3), c), size);
    out.index_axis_mut(nd::Axis(3), c).assign(&filtered);
  }
  out
}

/// Refine the boundaries of a semantic prediction with a per-slice watershed
/// guided by the raw image.
///
/// Markers are the connected flat regions of the prediction (rank gradient
/// over a radius 12 disk below 10 grey levels). They are grown over the rank
/// gradient (radius 2 disk) of the image. The basin labelled 1 is taken as
/// background; every other basin becomes foreground. Both inputs are expected
/// in `[0, 1]`.
pub fn refine_boundaries(
  image: nd::ArrayView3<f32>,
  prediction: nd::ArrayView3<f32>,
  diagnostics: Option<&Diagnostics>,
) -> SegResult<nd::Array3<u8>> {
  if image.shape() != prediction.shape() {
    return Err(SegError::shape("prediction", prediction.shape(), image.shape()));
  }
  let to_u8 = |v: f32| (v * 255.0).clamp(0.0, 255.0) as u8;
  let engine = MarkerWatershed::default();
  let mut out = nd::Array3::<u8>::zeros(image.raw_dim());
  let mut all_markers = nd::Array3::<usize>::zeros(image.raw_dim());

  out
    .axis_iter_mut(nd::Axis(0))
    .into_par_iter()
    .zip(all_markers.axis_iter_mut(nd::Axis(0)))
    .zip(image.axis_iter(nd::Axis(0)).into_par_iter().zip(prediction.axis_iter(nd::Axis(0))))
    .for_each(|((mut dst, mut marker_dst), (img, pred))| {
      let img = img.mapv(to_u8).insert_axis(nd::Axis(0));
      let pred = pred.mapv(to_u8).insert_axis(nd::Axis(0));

      //(1) flat regions of the prediction are markers
      let flat = morph::rank_gradient(pred.view(), &Footprint::disk(12)).mapv(|g| g < 10);
      let (markers, _) = label_mask(flat.view(), Connectivity::Face);

      //(2) flood the image gradient
      let gradient = water_levels(morph::rank_gradient(img.view(), &Footprint::disk(2)));
      let labels = engine.flood(gradient.view(), &markers, None);

      dst.assign(&labels.index_axis(nd::Axis(0), 0).mapv(|l| (l > 1) as u8));
      marker_dst.assign(&markers.index_axis(nd::Axis(0), 0));
    });

  if let Some(diag) = diagnostics {
    diag.save_labels_like("markers", &all_markers, &LabelMap::from_labels(&all_markers));
  }
  Ok(out)
}
