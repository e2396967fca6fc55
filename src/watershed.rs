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

//! Marker-controlled watershed.
//!
//! The elevation surface is quantised to `u8` water levels (see
//! [`WatershedUtils::pre_processor`]). Flooding then proceeds level by level
//! from the labelled seeds: every voxel that touches a coloured voxel takes its
//! colour and is queued at the water level where it gets submerged. Within a
//! level voxels are handled first in, first out, so a voxel that is reachable
//! from several basins goes to the basin that reached it first.

use std::collections::VecDeque;

use ndarray as nd;
use num_traits::{Num, ToPrimitive};
use rayon::prelude::*;

use crate::error::{SegError, SegResult};
use crate::measure::{remove_small_objects, shifted, Connectivity};
use crate::volume::{is_planar, LabelMap, Labels, BACKGROUND};

#[cfg(feature = "plots")]
use crate::plotting;

//Special water levels
pub(crate) const NORMAL_MAX: u8 = u8::MAX - 1;
pub(crate) const ALWAYS_FILL: u8 = u8::MIN;
pub(crate) const NEVER_FILL: u8 = u8::MAX;

/// Use an 8-bit image directly as water levels. Only the top grey value is
/// shifted down by one, so that no voxel is excluded from flooding.
pub fn water_levels(img: nd::Array3<u8>) -> nd::Array3<u8> {
  let mut img = img;
  img.par_mapv_inplace(|v| v.min(NORMAL_MAX));
  img
}

#[cfg(feature = "progress")]
fn set_up_bar(water_max: u8) -> indicatif::ProgressBar {
  const TEMPLATE: &str = "{spinner}[{elapsed}/{duration}] water level {pos}/{len}{bar:60}";
  let bar = indicatif::ProgressBar::new(water_max as u64 + 1);
  if let Ok(style) = indicatif::ProgressStyle::with_template(TEMPLATE) {
    bar.set_style(style);
  }
  bar
}

#[cfg(feature = "debug")]
mod performance_monitoring {

  #[derive(Clone, Debug, Default)]
  pub struct PerfReport {
    pub seeds: usize,
    pub flooded: usize,
    pub levels: usize,
    pub level_mus: Vec<usize>,
    pub total_ms: usize,
  }

  impl PerfReport {
    pub fn level_avg(&self) -> f64 {
      let num = self.level_mus.len().max(1) as f64;
      self.level_total() / num
    }
    pub fn level_total(&self) -> f64 {
      self.level_mus.iter().map(|&x| x as f64).sum()
    }
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">---------[Performance Summary]---------")?;
      writeln!(f, ">  {} seed voxels, {} voxels flooded", self.seeds, self.flooded)?;
      writeln!(f, ">  {} non-empty water levels", self.levels)?;
      writeln!(f, ">  Level Average: {:.1}µs; Σ {:.0}µs", self.level_avg(), self.level_total())?;
      writeln!(f, ">--------------------------------+ total")?;
      write!(
        f,
        ">  {}ms with {:.1}ms overhead (Δt)",
        self.total_ms,
        self.total_ms as f64 - self.level_total() / 1000.0
      )
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                 BUILDER                                    //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
/// Builder for configuring a marker-controlled watershed.
///
/// By default flooding uses face connectivity, keeps every seed and every grown
/// object, and floods up to the highest regular water level (`u8::MAX - 1`).
///
/// Enabling the `plots` feature gate adds `set_plot_folder`. When a folder is
/// set, the central z-slice of the partially flooded volume is written as a png
/// after every water level.
pub struct WatershedBuilder {
  #[cfg(feature = "plots")]
  plot_path: Option<std::path::PathBuf>,
  connectivity: Connectivity,
  remove_before: Option<usize>,
  remove_after: Option<usize>,
  max_water_level: u8,
}

impl Default for WatershedBuilder {
  fn default() -> Self {
    WatershedBuilder {
      #[cfg(feature = "plots")]
      plot_path: None,
      connectivity: Connectivity::Face,
      remove_before: None,
      remove_after: None,
      max_water_level: NORMAL_MAX,
    }
  }
}

impl WatershedBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Neighbourhood through which basins grow.
  pub fn set_connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = connectivity;
    self
  }

  /// Drop seeds with fewer than `min_size` voxels before flooding.
  pub fn set_remove_before(mut self, min_size: usize) -> Self {
    self.remove_before = Some(min_size);
    self
  }

  /// Drop grown objects with fewer than `min_size` voxels after flooding.
  pub fn set_remove_after(mut self, min_size: usize) -> Self {
    self.remove_after = Some(min_size);
    self
  }

  /// Set the maximum water level the flood will reach. Voxels that are only
  /// submerged above this level stay unlabelled. May not exceed `u8::MAX - 1`.
  pub fn set_max_water_lvl(mut self, max_water_lvl: u8) -> Self {
    self.max_water_level = max_water_lvl;
    self
  }

  #[cfg(feature = "plots")]
  /// Set output folder for the images generated during flooding.
  pub fn set_plot_folder(mut self, path: &std::path::Path) -> Self {
    self.plot_path = Some(path.to_path_buf());
    self
  }

  pub fn build(self) -> SegResult<MarkerWatershed> {
    if self.max_water_level > NORMAL_MAX {
      return Err(SegError::InvalidConfig(format!(
        "max water level was set at {}, which is higher than the allowed maximum ({NORMAL_MAX})",
        self.max_water_level
      )));
    }
    if self.remove_before == Some(0) || self.remove_after == Some(0) {
      log::warn!("small-object removal with a size of 0 removes nothing");
    }
    Ok(MarkerWatershed {
      #[cfg(feature = "plots")]
      plot_path: self.plot_path,
      connectivity: self.connectivity,
      remove_before: self.remove_before,
      remove_after: self.remove_after,
      max_water_level: self.max_water_level,
    })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                  TRAITS                                    //
////////////////////////////////////////////////////////////////////////////////

/// Helpers for preparing elevation surfaces.
pub trait WatershedUtils {
  /// Convert an array of any numeric type `T` into `u8` water levels.
  ///
  /// Finite values are rescaled linearly onto `0..=u8::MAX - 1`. `NaN` and
  /// positive infinity map to `u8::MAX` (never flooded), negative infinity to
  /// `0` (flooded immediately). A constant array maps to level 0.
  fn pre_processor<T, D>(&self, img: nd::ArrayView<T, D>) -> nd::Array<u8, D>
  where
    T: Num + Copy + ToPrimitive + PartialOrd + Send + Sync,
    D: nd::Dimension,
  {
    //Calculate max and min of the finite values
    let (min, max) = img
      .iter()
      .filter_map(|x| x.to_f64().filter(|f| f.is_finite()))
      .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), f| (lo.min(f), hi.max(f)));
    let range = if max > min { max - min } else { 1.0 };

    //Map image to u8 range, taking care of NaN and infty
    let mut out = nd::Array::<u8, D>::zeros(img.raw_dim());
    nd::Zip::from(&mut out).and(&img).par_for_each(|o, x| {
      let float = x.to_f64().unwrap_or(f64::NAN);
      *o = if float.is_finite() {
        let normal = ((float - min) / range).clamp(0.0, 1.0);
        (normal * NORMAL_MAX as f64).round() as u8
      } else if float == f64::NEG_INFINITY {
        ALWAYS_FILL
      } else {
        NEVER_FILL
      };
    });
    out
  }
}

/// Flooding of a quantised elevation surface from labelled seeds.
pub trait Watershed {
  /// Flood `elevation` from `seeds`. Seed labels are kept as they are. When a
  /// mask is given, seeds outside it are dropped and no voxel outside it is
  /// ever labelled. Voxels that cannot be reached from any seed stay 0.
  fn flood(
    &self,
    elevation: nd::ArrayView3<u8>,
    seeds: &Labels,
    mask: Option<nd::ArrayView3<bool>>,
  ) -> Labels;
}

impl<W: Watershed + ?Sized> WatershedUtils for W {}

////////////////////////////////////////////////////////////////////////////////
//                                 ENGINE                                     //
////////////////////////////////////////////////////////////////////////////////

/// Configured marker-controlled watershed, see [`WatershedBuilder`].
#[derive(Debug, Clone)]
pub struct MarkerWatershed {
  #[cfg(feature = "plots")]
  plot_path: Option<std::path::PathBuf>,
  connectivity: Connectivity,
  remove_before: Option<usize>,
  remove_after: Option<usize>,
  max_water_level: u8,
}

impl Default for MarkerWatershed {
  fn default() -> Self {
    MarkerWatershed {
      #[cfg(feature = "plots")]
      plot_path: None,
      connectivity: Connectivity::Face,
      remove_before: None,
      remove_after: None,
      max_water_level: NORMAL_MAX,
    }
  }
}

impl MarkerWatershed {
  /// Grow `seeds` over the negated `semantic` surface, so that basins sit at
  /// the maxima of the surface, and pack the result into the narrowest label
  /// type.
  pub fn grow(
    &self,
    semantic: nd::ArrayView3<f32>,
    seeds: &Labels,
    mask: Option<nd::ArrayView3<bool>>,
  ) -> SegResult<LabelMap> {
    let labels = self.grow_labels(semantic, seeds, mask)?;
    let map = LabelMap::from_labels(&labels);
    log::debug!("watershed produced labels up to {} ({})", map.max_label(), map.dtype_name());
    Ok(map)
  }

  /// Like [`MarkerWatershed::grow`], but keeps the internal label type.
  pub fn grow_labels(
    &self,
    semantic: nd::ArrayView3<f32>,
    seeds: &Labels,
    mask: Option<nd::ArrayView3<bool>>,
  ) -> SegResult<Labels> {
    if semantic.shape() != seeds.shape() {
      return Err(SegError::shape("seed map", seeds.shape(), semantic.shape()));
    }
    if let Some(m) = mask {
      if m.shape() != semantic.shape() {
        return Err(SegError::shape("foreground mask", m.shape(), semantic.shape()));
      }
    }

    //(1) optionally get rid of tiny seeds
    let pruned;
    let seeds = match self.remove_before {
      Some(min_size) => {
        pruned = remove_small_objects(seeds, min_size);
        &pruned
      }
      None => seeds,
    };

    //(2) flood the negated surface
    let elevation = self.pre_processor(semantic.mapv(|v| -v).view());
    let mut segm = self.flood(elevation.view(), seeds, mask);

    //(3) optionally get rid of tiny objects
    if let Some(min_size) = self.remove_after {
      segm = remove_small_objects(&segm, min_size);
    }
    Ok(segm)
  }

  #[cfg(feature = "plots")]
  fn plot_level(&self, output: &Labels, water_level: usize) {
    if let Some(ref path) = self.plot_path {
      let central = output.index_axis(nd::Axis(0), output.shape()[0] / 2);
      let file = path.join(format!("ws_lvl{water_level}.png"));
      if let Err(err) = plotting::plot_slice(central, &file, plotting::label_colours) {
        log::warn!("could not make watershed plot: {err}");
      }
    }
  }
}

impl Watershed for MarkerWatershed {
  fn flood(
    &self,
    elevation: nd::ArrayView3<u8>,
    seeds: &Labels,
    mask: Option<nd::ArrayView3<bool>>,
  ) -> Labels {
    #[cfg(feature = "debug")]
    let mut perf = performance_monitoring::PerfReport::default();
    #[cfg(feature = "debug")]
    let flood_start = std::time::Instant::now();

    let shape = {
      let s = elevation.shape();
      [s[0], s[1], s[2]]
    };
    let offsets = self.connectivity.offsets(is_planar(&shape));
    let inside = |idx: [usize; 3]| mask.map_or(true, |m| m[idx]);
    let max_level = self.max_water_level as usize;

    //(1) start from the seeds, minus those outside the mask
    let mut output = seeds.clone();
    if let Some(m) = mask {
      nd::Zip::from(&mut output).and(&m).par_for_each(|o, &m| {
        if !m {
          *o = BACKGROUND
        }
      });
    }

    //(2) queue every seed voxel at its own water level
    let mut queues: Vec<VecDeque<[usize; 3]>> = vec![VecDeque::new(); max_level + 1];
    for ((z, y, x), &label) in output.indexed_iter() {
      if label != BACKGROUND {
        let lvl = (elevation[[z, y, x]] as usize).min(max_level);
        queues[lvl].push_back([z, y, x]);
      }
    }

    #[cfg(feature = "debug")]
    {
      perf.seeds = queues.iter().map(|q| q.len()).sum();
    }
    log::debug!("flooding {shape:?} volume from {} seed voxels", queues.iter().map(|q| q.len()).sum::<usize>());

    #[cfg(feature = "progress")]
    let bar = set_up_bar(self.max_water_level);

    //(3) raise the water level step by step
    for water_level in 0..=max_level {
      #[cfg(feature = "debug")]
      let level_start = std::time::Instant::now();
      #[cfg(feature = "debug")]
      let mut level_used = false;

      while let Some(cur) = queues[water_level].pop_front() {
        #[cfg(feature = "debug")]
        {
          level_used = true;
        }
        let colour = output[cur];
        for &off in &offsets {
          let Some(next) = shifted(cur, off, shape) else { continue };
          if output[next] != BACKGROUND || !inside(next) {
            continue;
          }
          //A voxel can never be submerged below the current water level
          let lvl = (elevation[next] as usize).max(water_level);
          if lvl > max_level {
            continue;
          }
          output[next] = colour;
          queues[lvl].push_back(next);

          #[cfg(feature = "debug")]
          {
            perf.flooded += 1;
          }
        }
      }

      #[cfg(feature = "debug")]
      if level_used {
        perf.levels += 1;
        perf.level_mus.push(level_start.elapsed().as_micros() as usize);
      }

      #[cfg(feature = "plots")]
      self.plot_level(&output, water_level);

      #[cfg(feature = "progress")]
      bar.inc(1);
    }

    #[cfg(feature = "progress")]
    bar.finish_and_clear();

    #[cfg(feature = "debug")]
    {
      perf.total_ms = flood_start.elapsed().as_millis() as usize;
      log::debug!("\n{perf}");
    }

    output
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn planar_labels(rows: &[&[usize]]) -> Labels {
    Labels::from_shape_fn((1, rows.len(), rows[0].len()), |(_, y, x)| rows[y][x])
  }

  #[test]
  fn quantiser_handles_special_values() {
    let ws = WatershedBuilder::new().build().unwrap();
    let img = nd::arr1(&[-1.0f32, 0.0, 1.0, f32::NAN, f32::INFINITY, f32::NEG_INFINITY]);
    let q = ws.pre_processor(img.view());
    assert_eq!(q.to_vec(), vec![0, 127, NORMAL_MAX, NEVER_FILL, NEVER_FILL, ALWAYS_FILL]);
  }

  #[test]
  fn builder_rejects_special_water_level() {
    assert!(WatershedBuilder::new().set_max_water_lvl(u8::MAX).build().is_err());
  }

  #[test]
  fn every_voxel_reachable_gets_a_seed_label() {
    let seeds = planar_labels(&[&[1, 1, 0], &[0, 0, 2]]);
    //Surface peaks around label 1
    let semantic = nd::Array3::from_shape_vec((1, 2, 3), vec![1.0f32, 0.9, 0.5, 0.6, 0.4, 0.3]).unwrap();
    let mask = nd::Array3::from_elem((1, 2, 3), true);
    let ws = WatershedBuilder::new().build().unwrap();
    let out = ws.grow_labels(semantic.view(), &seeds, Some(mask.view())).unwrap();
    assert!(out.iter().all(|&l| l == 1 || l == 2));
    assert_eq!(out[[0, 0, 0]], 1);
    assert_eq!(out[[0, 1, 2]], 2);
  }

  #[test]
  fn mask_is_never_crossed() {
    let seeds = planar_labels(&[&[1, 0, 0, 0, 2]]);
    let semantic = nd::Array3::<f32>::zeros((1, 1, 5));
    let mut mask = nd::Array3::from_elem((1, 1, 5), true);
    mask[[0, 0, 2]] = false;
    let ws = WatershedBuilder::new().build().unwrap();
    let out = ws.grow_labels(semantic.view(), &seeds, Some(mask.view())).unwrap();
    assert_eq!(out.as_slice().unwrap(), &[1, 1, 0, 2, 2]);
  }

  #[test]
  fn ridge_separates_basins() {
    let seeds = planar_labels(&[&[1, 0, 0, 0, 0, 0, 2]]);
    let elevation = nd::Array3::from_shape_vec((1, 1, 7), vec![0u8, 10, 20, 90, 30, 10, 0]).unwrap();
    let ws = MarkerWatershed::default();
    let out = ws.flood(elevation.view(), &seeds, None);
    //The ridge voxel goes to the basin whose water reaches it first
    assert_eq!(out.as_slice().unwrap(), &[1, 1, 1, 1, 2, 2, 2]);
  }

  #[test]
  fn small_objects_removed_after_growth() {
    let seeds = planar_labels(&[&[1, 0, 0, 0, 0], &[0, 0, 0, 0, 0], &[0, 0, 0, 0, 2]]);
    let semantic = nd::Array3::<f32>::zeros((1, 3, 5));
    let mut mask = nd::Array3::from_elem((1, 3, 5), true);
    mask.slice_mut(nd::s![.., .., 1..4]).fill(false);
    mask[[0, 1, 4]] = false;
    let ws = WatershedBuilder::new().set_remove_after(2).build().unwrap();
    let out = ws.grow(semantic.view(), &seeds, Some(mask.view())).unwrap();
    assert_eq!(out.dtype_name(), "uint8");
    assert_eq!(out.get([0, 0, 0]), Some(1));
    assert_eq!(out.get([0, 2, 4]), Some(0));
  }

  #[test]
  fn seed_shape_is_checked() {
    let ws = MarkerWatershed::default();
    let err = ws.grow(nd::Array3::<f32>::zeros((1, 2, 2)).view(), &Labels::zeros((1, 2, 3)), None);
    assert!(matches!(err, Err(SegError::ShapeMismatch { .. })));
  }
}
