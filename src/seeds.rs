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

//! Seed construction: turns a probability volume into a labelled seed map, an
//! optional foreground mask and the surface that the watershed floods.
//!
//! | mode       | seed                                   | foreground             | surface            |
//! |------------|----------------------------------------|------------------------|--------------------|
//! | `BC`,`BCM` | `c0 > th1 ∧ c1 < th2`                  | `c0 > th3`             | EDT of foreground  |
//! | `BP`       | `c1 > th_points`                       | `c0 > th3`             | EDT of foreground  |
//! | `BCD`      | `c0 > th1 ∧ c1 < th2 ∧ c2 > th4`       | `c0 > th3 ∧ c2 > th5`  | `c0`               |
//! | `BCDv2`    | `c0 > th1 ∧ c1 < th2 ∧ cL < th4` + bg  | none                   | last channel       |
//! | `BDv2`     | `c0 > th1 ∧ c1 < th4` + bg components  | none                   | last channel       |
//! | `Dv2`      | `c0 < th4`                             | none                   | last channel       |

use ndarray as nd;

use crate::error::{SegError, SegResult};
use crate::measure::{self, label_mask, label_values, Connectivity};
use crate::morphology::{self as morph, Border, Footprint};
use crate::volume::{
  channel, is_planar, spatial_shape, threshold_channel, ChannelMode, Labels, ProbabilityVolume,
  ThresholdSet, BACKGROUND,
};

/// A single per-slice morphological operation on the seed mask, with the
/// radius of its disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphOp {
  Erode(usize),
  Dilate(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MorphOrder {
  #[default]
  DilateThenErode,
  ErodeThenDilate,
}

/// Clean-up of the foreground mask before growth. Dilating first closes small
/// interior holes, eroding first removes thin spurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForegroundMorph {
  pub order: MorphOrder,
  pub erode_radius: usize,
  pub dilate_radius: usize,
}

impl Default for ForegroundMorph {
  fn default() -> Self {
    ForegroundMorph { order: MorphOrder::DilateThenErode, erode_radius: 5, dilate_radius: 5 }
  }
}

/// Output of [`SeedConstructor::build`].
#[derive(Debug, Clone)]
pub struct Seeds {
  pub seed_map: Labels,
  /// `None` for modes that flood the whole volume (`BCDv2`, `BDv2`, `Dv2`)
  pub foreground: Option<nd::Array3<bool>>,
  pub semantic: nd::Array3<f32>,
  /// Label of the synthetic background seed (`BCDv2` only)
  pub background_label: Option<usize>,
}

////////////////////////////////////////////////////////////////////////////////
//                                 BUILDER                                    //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct SeedBuilder {
  mode: ChannelMode,
  thresholds: ThresholdSet,
  seed_morph: Vec<MorphOp>,
  foreground_morph: Option<ForegroundMorph>,
}

impl SeedBuilder {
  pub fn new(mode: ChannelMode) -> Self {
    SeedBuilder {
      mode,
      thresholds: ThresholdSet::default(),
      seed_morph: Vec::new(),
      foreground_morph: None,
    }
  }

  pub fn set_thresholds(mut self, thresholds: ThresholdSet) -> Self {
    self.thresholds = thresholds;
    self
  }

  /// Morphological operations applied to the seed mask, in order.
  pub fn set_seed_morph(mut self, ops: &[MorphOp]) -> Self {
    self.seed_morph = ops.to_vec();
    self
  }

  pub fn set_foreground_morph(mut self, fg_morph: ForegroundMorph) -> Self {
    self.foreground_morph = Some(fg_morph);
    self
  }

  pub fn build(self) -> SegResult<SeedConstructor> {
    let ThresholdSet { th1, th2, th3, th4, th5, th_points } = self.thresholds;
    if [th1, th2, th3, th4, th5, th_points].iter().any(|t| !t.is_finite()) {
      return Err(SegError::InvalidConfig(format!(
        "all thresholds have to be finite, got {:?}",
        self.thresholds
      )));
    }
    if self.foreground_morph.is_some() && !self.mode.has_foreground() {
      log::warn!("channel mode {} has no foreground mask; foreground morphology is ignored", self.mode);
    }
    Ok(SeedConstructor {
      mode: self.mode,
      thresholds: self.thresholds,
      seed_morph: self.seed_morph,
      foreground_morph: self.foreground_morph,
    })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                               CONSTRUCTOR                                  //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct SeedConstructor {
  mode: ChannelMode,
  thresholds: ThresholdSet,
  seed_morph: Vec<MorphOp>,
  foreground_morph: Option<ForegroundMorph>,
}

/// Apply the seed operations and the foreground clean-up. Every operation
/// works slice by slice with an in-plane disk, and erosion treats the volume
/// edge as background.
pub fn apply_morph(
  seed: nd::Array3<bool>,
  foreground: Option<nd::Array3<bool>>,
  seed_ops: &[MorphOp],
  fg_morph: Option<&ForegroundMorph>,
) -> (nd::Array3<bool>, Option<nd::Array3<bool>>) {
  let seed = seed_ops.iter().fold(seed, |acc, op| match *op {
    MorphOp::Erode(r) => morph::binary_erosion_border(acc.view(), &Footprint::disk(r), Border::Background),
    MorphOp::Dilate(r) => morph::binary_dilation(acc.view(), &Footprint::disk(r)),
  });

  let foreground = match (foreground, fg_morph) {
    (Some(fg), Some(fm)) => {
      let erode = Footprint::disk(fm.erode_radius);
      let dilate = Footprint::disk(fm.dilate_radius);
      Some(match fm.order {
        MorphOrder::DilateThenErode => {
          let closed = morph::binary_dilation(fg.view(), &dilate);
          morph::binary_erosion_border(closed.view(), &erode, Border::Background)
        }
        MorphOrder::ErodeThenDilate => {
          let opened = morph::binary_erosion_border(fg.view(), &erode, Border::Background);
          morph::binary_dilation(opened.view(), &dilate)
        }
      })
    }
    (fg, _) => fg,
  };

  (seed, foreground)
}

impl SeedConstructor {
  pub fn mode(&self) -> ChannelMode {
    self.mode
  }

  pub fn thresholds(&self) -> &ThresholdSet {
    &self.thresholds
  }

  /// Build seeds, foreground and flooding surface from `data` `(z, y, x, C)`.
  pub fn build(&self, data: &ProbabilityVolume) -> SegResult<Seeds> {
    let n_channels = data.shape()[3];
    self.mode.check_channels(n_channels)?;
    let th = &self.thresholds;
    let c = |i: usize| channel(data, i);
    let last = n_channels - 1;
    let planar = is_planar(&spatial_shape(data));

    log::debug!("building {} seeds for volume {:?}", self.mode, data.shape());

    match self.mode {
      ChannelMode::BC | ChannelMode::BCM | ChannelMode::BP | ChannelMode::BCD => {
        //(1) threshold seeds and foreground
        let (seed, foreground) = match self.mode {
          ChannelMode::BP => (
            threshold_channel(c(1), |v| v > th.th_points),
            threshold_channel(c(0), |v| v > th.th3),
          ),
          ChannelMode::BCD => {
            let mut seed = threshold_channel(c(0), |v| v > th.th1);
            nd::Zip::from(&mut seed).and(&c(1)).and(&c(2)).par_for_each(|s, &cont, &dist| {
              *s = *s && cont < th.th2 && dist > th.th4
            });
            let mut fg = threshold_channel(c(0), |v| v > th.th3);
            nd::Zip::from(&mut fg).and(&c(2)).par_for_each(|f, &dist| *f = *f && dist > th.th5);
            (seed, fg)
          }
          _ => {
            let mut seed = threshold_channel(c(0), |v| v > th.th1);
            nd::Zip::from(&mut seed).and(&c(1)).par_for_each(|s, &cont| *s = *s && cont < th.th2);
            (seed, threshold_channel(c(0), |v| v > th.th3))
          }
        };

        //(2) morphology, then keep seeds inside the foreground
        let (mut seed, foreground) =
          apply_morph(seed, Some(foreground), &self.seed_morph, self.foreground_morph.as_ref());
        let foreground = foreground.unwrap_or_else(|| nd::Array3::from_elem(seed.raw_dim(), true));
        nd::Zip::from(&mut seed).and(&foreground).par_for_each(|s, &f| *s = *s && f);

        //(3) flooding surface
        let semantic = if self.mode == ChannelMode::BCD {
          c(0).to_owned()
        } else {
          measure::distance_transform_edt(foreground.view()).mapv(|d| d as f32)
        };

        let (seed_map, n) = label_mask(seed.view(), Connectivity::Face);
        log::debug!("{n} seeds found");
        Ok(Seeds { seed_map, foreground: Some(foreground), semantic, background_label: None })
      }

      ChannelMode::BCDv2 => {
        let mut seed = threshold_channel(c(0), |v| v > th.th1);
        nd::Zip::from(&mut seed).and(&c(1)).and(&c(last)).par_for_each(|s, &cont, &dist| {
          *s = *s && cont < th.th2 && dist < th.th4
        });
        let mut occupied = threshold_channel(c(0), |v| v > th.th1);
        nd::Zip::from(&mut occupied).and(&c(1)).par_for_each(|o, &cont| *o = *o || cont > th.th2);
        let occupied = morph::binary_dilation_iter(occupied.view(), &Footprint::cross(planar), 2);

        let (seed, _) = apply_morph(seed, None, &self.seed_morph, None);
        let (mut seed_map, n) = label_mask(seed.view(), Connectivity::Face);

        //Everything far away from any object is one big background seed
        let bg_label = n + 1;
        nd::Zip::from(&mut seed_map).and(&occupied).par_for_each(|s, &occ| {
          if !occ && *s == BACKGROUND {
            *s = bg_label
          }
        });
        log::debug!("{n} seeds found, background seed has label {bg_label}");
        Ok(Seeds {
          seed_map,
          foreground: None,
          semantic: c(last).to_owned(),
          background_label: Some(bg_label),
        })
      }

      ChannelMode::BDv2 => {
        let mut seed = threshold_channel(c(0), |v| v > th.th1);
        nd::Zip::from(&mut seed).and(&c(1)).par_for_each(|s, &dist| *s = *s && dist < th.th4);
        let low = threshold_channel(c(1), |v| v < th.th4);
        let low = morph::binary_dilation_iter(low.view(), &Footprint::cross(planar), 2);

        let (seed, _) = apply_morph(seed, None, &self.seed_morph, None);
        let (seed_map, n) = label_mask(seed.view(), Connectivity::Face);
        let (mut bg, _) = label_mask(low.view(), Connectivity::Face);

        //(1) drop background components that hold a seed centroid
        let mut drop = std::collections::BTreeSet::new();
        for region in measure::regionprops(seed_map.view()) {
          let idx = region.centroid.map(|v| v.round() as usize);
          if let Some(&l) = bg.get(idx) {
            if l != BACKGROUND {
              drop.insert(l);
            }
          }
        }
        bg.par_mapv_inplace(|l| if drop.contains(&l) { BACKGROUND } else { l });

        //(2) overlay seeds on the remaining background and relabel
        let mut combined = seed_map;
        nd::Zip::from(&mut combined).and(&bg).par_for_each(|s, &b| {
          if *s == BACKGROUND && b != BACKGROUND {
            *s = b + n
          }
        });
        let (seed_map, total) = label_values(combined.view(), Connectivity::Face);
        log::debug!("{n} seeds found, {} background components dropped, {total} seeds in total", drop.len());
        Ok(Seeds { seed_map, foreground: None, semantic: c(last).to_owned(), background_label: None })
      }

      ChannelMode::Dv2 => {
        let seed = threshold_channel(c(0), |v| v < th.th4);
        let (seed, _) = apply_morph(seed, None, &self.seed_morph, None);
        let (seed_map, n) = label_mask(seed.view(), Connectivity::Face);
        log::debug!("{n} seeds found");
        Ok(Seeds { seed_map, foreground: None, semantic: c(last).to_owned(), background_label: None })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn two_blobs(channels: usize) -> ProbabilityVolume {
    //Two 5x5 foreground squares separated by a contour column
    let mut data = ProbabilityVolume::zeros((1, 7, 13, channels));
    for y in 1..6 {
      for x in 1..12 {
        data[[0, y, x, 0]] = 0.9;
        if channels > 2 {
          data[[0, y, x, 2]] = 2.0;
        }
      }
      data[[0, y, 6, 1]] = 0.9;
    }
    data
  }

  #[test]
  fn bc_seeds_lie_inside_foreground() {
    let ctor = SeedBuilder::new(ChannelMode::BC).build().unwrap();
    let seeds = ctor.build(&two_blobs(2)).unwrap();
    let fg = seeds.foreground.as_ref().unwrap();
    assert_eq!(measure::unique_labels(seeds.seed_map.view()), vec![1, 2]);
    nd::Zip::from(&seeds.seed_map).and(fg).for_each(|&s, &f| assert!(s == 0 || f));
    //EDT surface peaks inside the foreground
    assert!(seeds.semantic[[0, 3, 3]] > seeds.semantic[[0, 1, 3]]);
  }

  #[test]
  fn bcd_needs_three_channels() {
    let ctor = SeedBuilder::new(ChannelMode::BCD).build().unwrap();
    assert!(matches!(ctor.build(&two_blobs(2)), Err(SegError::ChannelCount { .. })));
    let seeds = ctor.build(&two_blobs(3)).unwrap();
    assert_eq!(measure::unique_labels(seeds.seed_map.view()).len(), 2);
    assert_eq!(seeds.semantic[[0, 3, 3]], 0.9);
  }

  #[test]
  fn bcdv2_adds_background_seed() {
    let mut data = ProbabilityVolume::zeros((1, 11, 11, 3));
    data.index_axis_mut(nd::Axis(3), 2).fill(1.0);
    data.slice_mut(nd::s![0, 4..7, 4..7, 0]).fill(0.9);
    //Low inverted distance in the object centre
    data[[0, 5, 5, 2]] = 0.1;
    let ctor = SeedBuilder::new(ChannelMode::BCDv2)
      .set_thresholds(ThresholdSet { th4: 0.5, ..Default::default() })
      .build()
      .unwrap();
    let seeds = ctor.build(&data).unwrap();
    assert_eq!(seeds.background_label, Some(2));
    assert!(seeds.foreground.is_none());
    assert_eq!(seeds.seed_map[[0, 5, 5]], 1);
    //Next to the object is neither seed nor background
    assert_eq!(seeds.seed_map[[0, 4, 4]], 0);
    assert_eq!(seeds.seed_map[[0, 0, 0]], 2);
  }

  #[test]
  fn bdv2_drops_background_holding_a_seed() {
    let mut data = ProbabilityVolume::zeros((1, 9, 9, 2));
    data.index_axis_mut(nd::Axis(3), 1).fill(1.0);
    //A seed in the middle of a low-distance region
    data.slice_mut(nd::s![0, 3..6, 3..6, 1]).fill(0.0);
    data.slice_mut(nd::s![0, 3..6, 3..6, 0]).fill(1.0);
    let ctor = SeedBuilder::new(ChannelMode::BDv2)
      .set_thresholds(ThresholdSet { th1: 0.5, th4: 0.5, ..Default::default() })
      .build()
      .unwrap();
    let seeds = ctor.build(&data).unwrap();
    //Only the seed survives, the surrounding dilated region is dropped
    assert_eq!(measure::unique_labels(seeds.seed_map.view()), vec![1]);
    assert_eq!(seeds.seed_map[[0, 4, 4]], 1);
    assert_eq!(seeds.seed_map[[0, 2, 4]], 0);
  }

  #[test]
  fn dv2_thresholds_first_channel() {
    let mut data = ProbabilityVolume::from_elem((1, 3, 3, 1), 1.0);
    data[[0, 1, 1, 0]] = 0.0;
    let seeds = SeedBuilder::new(ChannelMode::Dv2)
      .set_thresholds(ThresholdSet { th4: 0.5, ..Default::default() })
      .build()
      .unwrap()
      .build(&data)
      .unwrap();
    assert_eq!(seeds.seed_map.iter().filter(|&&l| l != 0).count(), 1);
    assert_eq!(seeds.seed_map[[0, 1, 1]], 1);
    assert_eq!(seeds.semantic, data.index_axis(nd::Axis(3), 0));
  }

  #[test]
  fn seed_erosion_removes_thin_seeds() {
    let ctor = SeedBuilder::new(ChannelMode::BC)
      .set_seed_morph(&[MorphOp::Erode(2)])
      .build()
      .unwrap();
    let seeds = ctor.build(&two_blobs(2)).unwrap();
    //5x5 squares touching the contour only keep a small core
    assert!(seeds.seed_map.iter().filter(|&&l| l != 0).count() < 10);
  }

  #[test]
  fn foreground_closing_fills_pinholes() {
    let mut data = two_blobs(2);
    data[[0, 3, 3, 0]] = 0.0;
    let ctor = SeedBuilder::new(ChannelMode::BC)
      .set_foreground_morph(ForegroundMorph { erode_radius: 1, dilate_radius: 1, ..Default::default() })
      .build()
      .unwrap();
    let seeds = ctor.build(&data).unwrap();
    assert!(seeds.foreground.unwrap()[[0, 3, 3]]);
  }

  #[test]
  fn non_finite_thresholds_are_rejected() {
    let th = ThresholdSet { th1: f32::NAN, ..Default::default() };
    assert!(SeedBuilder::new(ChannelMode::BC).set_thresholds(th).build().is_err());
  }
}
