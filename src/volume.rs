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

//! Data model shared by all pipeline stages.
//!
//! All spatial arrays are three dimensional `(z, y, x)`. Planar images are
//! carried as volumes with a depth of one. Probability volumes carry their
//! channels on the last axis: `(z, y, x, C)`.

use ndarray as nd;
use rayon::prelude::*;

use crate::error::{SegError, SegResult};

/// Integer label array used internally by every stage. `0` is background.
pub type Labels = nd::Array3<usize>;

/// Multi-channel network output, `(z, y, x, C)`.
pub type ProbabilityVolume = nd::Array4<f32>;

/// Label value reserved for background / uncoloured voxels.
pub const BACKGROUND: usize = 0;

////////////////////////////////////////////////////////////////////////////////
//                               CHANNEL MODES                                //
////////////////////////////////////////////////////////////////////////////////

/// Channel layout of a probability volume. The layout decides how seeds, the
/// foreground mask and the flooding surface are derived, and is fixed for a
/// whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
  /// foreground + contour
  BC,
  /// foreground + contour + (unused) mask channel
  BCM,
  /// foreground + contour + centroid distance
  BCD,
  /// foreground + contour + inverted distance
  BCDv2,
  /// inverted distance only
  Dv2,
  /// foreground + inverted distance
  BDv2,
  /// foreground + point probability
  BP,
}

impl ChannelMode {
  pub const ALL: [ChannelMode; 7] = [
    ChannelMode::BC,
    ChannelMode::BCM,
    ChannelMode::BCD,
    ChannelMode::BCDv2,
    ChannelMode::Dv2,
    ChannelMode::BDv2,
    ChannelMode::BP,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      ChannelMode::BC => "BC",
      ChannelMode::BCM => "BCM",
      ChannelMode::BCD => "BCD",
      ChannelMode::BCDv2 => "BCDv2",
      ChannelMode::Dv2 => "Dv2",
      ChannelMode::BDv2 => "BDv2",
      ChannelMode::BP => "BP",
    }
  }

  /// Minimum number of channels the mode reads from.
  pub fn min_channels(&self) -> usize {
    match self {
      ChannelMode::Dv2 => 1,
      ChannelMode::BC | ChannelMode::BCM | ChannelMode::BDv2 | ChannelMode::BP => 2,
      ChannelMode::BCD | ChannelMode::BCDv2 => 3,
    }
  }

  /// Whether the mode produces an explicit foreground mask. The `v2` modes
  /// flood the whole volume and rely on a background seed instead.
  pub fn has_foreground(&self) -> bool {
    matches!(self, ChannelMode::BC | ChannelMode::BCM | ChannelMode::BCD | ChannelMode::BP)
  }

  pub(crate) fn check_channels(&self, found: usize) -> SegResult<()> {
    if found < self.min_channels() {
      Err(SegError::ChannelCount { mode: self.name(), needed: self.min_channels(), found })
    } else {
      Ok(())
    }
  }
}

impl std::fmt::Display for ChannelMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

impl std::str::FromStr for ChannelMode {
  type Err = SegError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ChannelMode::ALL
      .into_iter()
      .find(|mode| mode.name() == s)
      .ok_or_else(|| SegError::InvalidConfig(format!("unknown channel mode \"{s}\"")))
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                THRESHOLDS                                  //
////////////////////////////////////////////////////////////////////////////////

/// Scalar cut points used to turn soft predictions into seeds and masks.
///
/// - `th1`: foreground channel, seed creation
/// - `th2`: contour channel, seed creation (and background seed for `BCDv2`)
/// - `th3`: foreground channel, foreground mask
/// - `th4`: distance channel, seed creation
/// - `th5`: distance channel, foreground mask
/// - `th_points`: point channel, seed creation (`BP` only)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdSet {
  pub th1: f32,
  pub th2: f32,
  pub th3: f32,
  pub th4: f32,
  pub th5: f32,
  pub th_points: f32,
}

impl Default for ThresholdSet {
  fn default() -> Self {
    ThresholdSet { th1: 0.2, th2: 0.1, th3: 0.3, th4: 1.2, th5: 1.5, th_points: 0.5 }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                LABEL MAPS                                  //
////////////////////////////////////////////////////////////////////////////////

/// Final instance label map, stored in the narrowest unsigned type that can
/// hold its largest label. Large 3D volumes make this worthwhile.
///
/// The width is picked by [`LabelMap::from_labels`]: a maximum label below
/// 255 gives `u8`, below 65535 gives `u16`, anything else `u32`.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelMap {
  U8(nd::Array3<u8>),
  U16(nd::Array3<u16>),
  U32(nd::Array3<u32>),
}

impl LabelMap {
  pub fn from_labels(labels: &Labels) -> Self {
    let max = labels.iter().copied().max().unwrap_or(BACKGROUND);
    if max < u8::MAX as usize {
      LabelMap::U8(labels.mapv(|l| l as u8))
    } else if max < u16::MAX as usize {
      LabelMap::U16(labels.mapv(|l| l as u16))
    } else {
      //Labels past u32::MAX do not fit any variant; saturate them
      LabelMap::U32(labels.mapv(|l| l.min(u32::MAX as usize) as u32))
    }
  }

  pub fn shape(&self) -> &[usize] {
    match self {
      LabelMap::U8(arr) => arr.shape(),
      LabelMap::U16(arr) => arr.shape(),
      LabelMap::U32(arr) => arr.shape(),
    }
  }

  pub fn dtype_name(&self) -> &'static str {
    match self {
      LabelMap::U8(_) => "uint8",
      LabelMap::U16(_) => "uint16",
      LabelMap::U32(_) => "uint32",
    }
  }

  pub fn max_label(&self) -> usize {
    match self {
      LabelMap::U8(arr) => arr.iter().copied().max().unwrap_or(0) as usize,
      LabelMap::U16(arr) => arr.iter().copied().max().unwrap_or(0) as usize,
      LabelMap::U32(arr) => arr.iter().copied().max().unwrap_or(0) as usize,
    }
  }

  pub fn get(&self, idx: [usize; 3]) -> Option<usize> {
    match self {
      LabelMap::U8(arr) => arr.get(idx).map(|&l| l as usize),
      LabelMap::U16(arr) => arr.get(idx).map(|&l| l as usize),
      LabelMap::U32(arr) => arr.get(idx).map(|&l| l as usize),
    }
  }

  /// Widen back into the internal `usize` representation.
  pub fn to_labels(&self) -> Labels {
    match self {
      LabelMap::U8(arr) => arr.mapv(|l| l as usize),
      LabelMap::U16(arr) => arr.mapv(|l| l as usize),
      LabelMap::U32(arr) => arr.mapv(|l| l as usize),
    }
  }

  /// Number of distinct non-background labels.
  pub fn instance_count(&self) -> usize {
    crate::measure::unique_labels(self.to_labels().view()).len()
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                 GEOMETRY                                   //
////////////////////////////////////////////////////////////////////////////////

/// Physical voxel size in `(z, y, x)` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution(pub [f64; 3]);

impl Default for Resolution {
  fn default() -> Self {
    Resolution([1.0, 1.0, 1.0])
  }
}

impl Resolution {
  /// Physical size of a single voxel. For planar data the z spacing is
  /// ignored and this is the pixel area.
  pub fn voxel_size(&self, planar: bool) -> f64 {
    let [z, y, x] = self.0;
    if planar {
      y * x
    } else {
      z * y * x
    }
  }
}

/// A volume of depth one is treated as a planar image.
#[inline]
pub fn is_planar(shape: &[usize]) -> bool {
  shape[0] == 1
}

/// View a single channel of a probability volume.
pub fn channel(data: &ProbabilityVolume, c: usize) -> nd::ArrayView3<'_, f32> {
  data.index_axis(nd::Axis(3), c)
}

/// Spatial shape of a probability volume.
pub(crate) fn spatial_shape(data: &ProbabilityVolume) -> [usize; 3] {
  let s = data.shape();
  [s[0], s[1], s[2]]
}

/// Threshold a channel into a boolean mask, in parallel.
pub(crate) fn threshold_channel<F>(data: nd::ArrayView3<f32>, pred: F) -> nd::Array3<bool>
where
  F: Fn(f32) -> bool + Sync,
{
  let mut out = nd::Array3::<bool>::from_elem(data.raw_dim(), false);
  nd::Zip::from(&mut out).and(&data).par_for_each(|o, &v| *o = pred(v));
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn label_map_picks_narrowest_width() {
    let mut labels = Labels::zeros((1, 2, 2));
    labels[[0, 0, 0]] = 254;
    assert_eq!(LabelMap::from_labels(&labels).dtype_name(), "uint8");
    labels[[0, 0, 1]] = 255;
    assert_eq!(LabelMap::from_labels(&labels).dtype_name(), "uint16");
    labels[[0, 1, 0]] = 65_535;
    let map = LabelMap::from_labels(&labels);
    assert_eq!(map.dtype_name(), "uint32");
    assert_eq!(map.max_label(), 65_535);
    assert_eq!(map.to_labels(), labels);
  }

  #[test]
  fn channel_modes_parse_from_names() {
    for mode in ChannelMode::ALL {
      assert_eq!(mode.name().parse::<ChannelMode>().unwrap(), mode);
    }
    assert!("BXD".parse::<ChannelMode>().is_err());
  }

  #[test]
  fn channel_count_is_checked() {
    assert!(ChannelMode::BCD.check_channels(2).is_err());
    assert!(ChannelMode::Dv2.check_channels(1).is_ok());
  }
}
