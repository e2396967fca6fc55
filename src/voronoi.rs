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

//! Gap filling: give foreground voxels that the watershed left unlabelled the
//! label of the closest instance.
//!
//! Two flavours are available. [`VoronoiMethod::Centroid`] assigns every
//! voxel on which the labels and a cleaned foreground mask disagree to the
//! nearest instance centroid. [`VoronoiMethod::Perimeter`] assigns every
//! unlabelled voxel of a closed mask to the nearest voxel on the outer shell of
//! an instance.

use ndarray as nd;
use rayon::prelude::*;

use crate::diagnostics::Diagnostics;
use crate::error::{SegError, SegResult};
use crate::measure::{label_mask, otsu_threshold, regionprops, remove_small_objects, Connectivity};
use crate::morphology::{self as morph, Border, Footprint};
use crate::spatial::PointIndex;
use crate::volume::{channel, is_planar, spatial_shape, Labels, LabelMap, ProbabilityVolume, BACKGROUND};

/// What the centroid flavour writes into a filled voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoronoiLabels {
  /// The position of the nearest centroid in the sorted list of all label
  /// values, background included. Equal to the instance label only when the
  /// labels are consecutive.
  #[default]
  QueryIndex,
  /// The label of the instance with the nearest centroid. The background has
  /// no centroid in this mode.
  PreserveLabels,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoronoiMethod {
  Centroid { threshold: f32, min_size: usize, labelling: VoronoiLabels },
  /// `threshold: None` picks Otsu's threshold.
  Perimeter { threshold: Option<f32> },
}

fn check_inputs(labels: &Labels, mask: &ProbabilityVolume) -> SegResult<()> {
  let found = mask.shape()[3];
  if found < 2 {
    return Err(SegError::ChannelCount { mode: "voronoi", needed: 2, found });
  }
  let shape = spatial_shape(mask);
  if labels.shape() != shape {
    return Err(SegError::shape("voronoi mask", &shape, labels.shape()));
  }
  Ok(())
}

////////////////////////////////////////////////////////////////////////////////
//                             CENTROID VORONOI                               //
////////////////////////////////////////////////////////////////////////////////

/// Centroid flavour, see [`VoronoiMethod::Centroid`]. The foreground is the
/// first mask channel above `threshold`, without components smaller than
/// `min_size`, dilated and then eroded twice.
pub fn fill_by_centroid(
  labels: &Labels,
  mask: &ProbabilityVolume,
  threshold: f32,
  min_size: usize,
  labelling: VoronoiLabels,
) -> SegResult<Labels> {
  check_inputs(labels, mask)?;
  let planar = is_planar(labels.shape());

  //(1) centroids
  let mut regions = regionprops(labels.view());
  let mut values: Vec<usize> = regions.iter().map(|r| r.label).collect();
  let mut centroids: Vec<[f64; 3]> = regions.drain(..).map(|r| r.centroid).collect();
  if labelling == VoronoiLabels::QueryIndex {
    let (sum, count) = labels
      .indexed_iter()
      .filter(|&(_, &l)| l == BACKGROUND)
      .fold(([0.0; 3], 0usize), |(s, n), ((z, y, x), _)| {
        ([s[0] + z as f64, s[1] + y as f64, s[2] + x as f64], n + 1)
      });
    if count > 0 {
      values.insert(0, BACKGROUND);
      centroids.insert(0, [sum[0] / count as f64, sum[1] / count as f64, sum[2] / count as f64]);
    }
  }
  let tree = PointIndex::new(centroids);

  //(2) cleaned foreground
  let (fg, _) = label_mask(channel(mask, 0).mapv(|v| v > threshold).view(), Connectivity::Full);
  let fg = remove_small_objects(&fg, min_size).mapv(|l| l != BACKGROUND);
  let cross = Footprint::cross(planar);
  let closed = morph::binary_dilation_iter(fg.view(), &cross, 2);
  let fg = morph::binary_erosion_iter(closed.view(), &cross, 2, Border::Background);

  //(3) re-assign every voxel where labels and foreground disagree
  let mut out = labels.clone();
  nd::Zip::indexed(&mut out).and(&fg).par_for_each(|(z, y, x), l, &f| {
    if (*l != BACKGROUND) != f {
      if let Some((idx, _)) = tree.nearest(&[z as f64, y as f64, x as f64]) {
        *l = match labelling {
          VoronoiLabels::QueryIndex => idx,
          VoronoiLabels::PreserveLabels => values[idx],
        };
      }
    }
  });
  Ok(out)
}

////////////////////////////////////////////////////////////////////////////////
//                            PERIMETER VORONOI                               //
////////////////////////////////////////////////////////////////////////////////

/// Perimeter flavour, see [`VoronoiMethod::Perimeter`]. The mask is the third
/// channel if there are exactly three, otherwise the sum of the first two.
/// Labels outside the closed mask are dropped.
pub fn fill_by_perimeter(labels: &Labels, mask: &ProbabilityVolume, threshold: Option<f32>) -> SegResult<Labels> {
  check_inputs(labels, mask)?;
  let planar = is_planar(labels.shape());

  //(1) binarise and close the mask
  let signal = if mask.shape()[3] == 3 {
    channel(mask, 2).to_owned()
  } else {
    &channel(mask, 0) + &channel(mask, 1)
  };
  let th = threshold.unwrap_or_else(|| otsu_threshold(signal.iter()));
  let closed = morph::binary_closing(signal.mapv(|v| v > th).view(), &Footprint::round(5, planar));

  //(2) labelled part of the mask and its outer shell
  let mut cyst = labels.clone();
  nd::Zip::from(&mut cyst).and(&closed).par_for_each(|l, &m| {
    if !m {
      *l = BACKGROUND
    }
  });
  let inside = cyst.mapv(|l| l != BACKGROUND);
  let eroded = morph::binary_erosion(inside.view(), &Footprint::round(2, planar));
  let (shell_pts, shell_labels): (Vec<[f64; 3]>, Vec<usize>) = nd::Zip::indexed(&inside)
    .and(&eroded)
    .and(&cyst)
    .fold(Vec::new(), |mut acc, (z, y, x), &i, &e, &l| {
      if i && !e {
        acc.push(([z as f64, y as f64, x as f64], l));
      }
      acc
    })
    .into_iter()
    .unzip();
  if shell_pts.is_empty() {
    log::debug!("no labelled instances inside the mask, nothing to fill");
    return Ok(cyst);
  }
  let tree = PointIndex::new(shell_pts);

  //(3) closest shell voxel for every unlabelled voxel of the mask
  nd::Zip::indexed(&mut cyst).and(&closed).par_for_each(|(z, y, x), l, &m| {
    if m && *l == BACKGROUND {
      if let Some((idx, _)) = tree.nearest(&[z as f64, y as f64, x as f64]) {
        *l = shell_labels[idx];
      }
    }
  });
  Ok(cyst)
}

////////////////////////////////////////////////////////////////////////////////
//                                 FILLER                                     //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct VoronoiBuilder {
  method: VoronoiMethod,
  diagnostics: Option<Diagnostics>,
}

impl VoronoiBuilder {
  /// Centroid flavour with threshold 0.3 and minimum object size 128.
  pub fn centroid() -> Self {
    VoronoiBuilder {
      method: VoronoiMethod::Centroid { threshold: 0.3, min_size: 128, labelling: VoronoiLabels::default() },
      diagnostics: None,
    }
  }

  /// Perimeter flavour with Otsu's threshold.
  pub fn perimeter() -> Self {
    VoronoiBuilder { method: VoronoiMethod::Perimeter { threshold: None }, diagnostics: None }
  }

  pub fn set_threshold(mut self, th: f32) -> Self {
    match self.method {
      VoronoiMethod::Centroid { ref mut threshold, .. } => *threshold = th,
      VoronoiMethod::Perimeter { ref mut threshold } => *threshold = Some(th),
    }
    self
  }

  /// Only used by the centroid flavour.
  pub fn set_min_size(mut self, size: usize) -> Self {
    if let VoronoiMethod::Centroid { ref mut min_size, .. } = self.method {
      *min_size = size;
    }
    self
  }

  /// Only used by the centroid flavour.
  pub fn set_labelling(mut self, mode: VoronoiLabels) -> Self {
    if let VoronoiMethod::Centroid { ref mut labelling, .. } = self.method {
      *labelling = mode;
    }
    self
  }

  /// Write every filled sample into `dir`.
  pub fn set_save_dir(mut self, dir: &std::path::Path) -> Self {
    self.diagnostics = Some(Diagnostics::new(dir));
    self
  }

  pub fn build(self) -> SegResult<VoronoiFiller> {
    let th = match self.method {
      VoronoiMethod::Centroid { threshold, .. } => Some(threshold),
      VoronoiMethod::Perimeter { threshold } => threshold,
    };
    if th.map_or(false, |t| !t.is_finite()) {
      return Err(SegError::InvalidConfig("voronoi threshold has to be finite".into()));
    }
    Ok(VoronoiFiller { method: self.method, diagnostics: self.diagnostics })
  }
}

#[derive(Debug, Clone)]
pub struct VoronoiFiller {
  method: VoronoiMethod,
  diagnostics: Option<Diagnostics>,
}

impl VoronoiFiller {
  pub fn method(&self) -> VoronoiMethod {
    self.method
  }

  pub fn fill(&self, labels: &Labels, mask: &ProbabilityVolume) -> SegResult<Labels> {
    match self.method {
      VoronoiMethod::Centroid { threshold, min_size, labelling } => {
        fill_by_centroid(labels, mask, threshold, min_size, labelling)
      }
      VoronoiMethod::Perimeter { threshold } => fill_by_perimeter(labels, mask, threshold),
    }
  }

  /// Fill a batch of samples. Saved samples are named after `filenames`
  /// (extension replaced) or after their zero padded index.
  pub fn fill_batch(
    &self,
    labels: &[Labels],
    masks: &[ProbabilityVolume],
    filenames: Option<&[String]>,
  ) -> SegResult<Vec<Labels>> {
    if masks.len() != labels.len() {
      return Err(SegError::InvalidConfig(format!(
        "{} label volumes but {} masks",
        labels.len(),
        masks.len()
      )));
    }
    if let Some(names) = filenames {
      if names.len() != labels.len() {
        return Err(SegError::InvalidConfig(format!(
          "{} filenames for {} label volumes",
          names.len(),
          labels.len()
        )));
      }
    }
    log::info!("applying voronoi to {} samples", labels.len());

    let width = labels.len().to_string().len();
    labels
      .iter()
      .zip(masks)
      .enumerate()
      .map(|(i, (l, m))| {
        let filled = self.fill(l, m)?;
        if let Some(ref diag) = self.diagnostics {
          let name = match filenames {
            Some(names) => std::path::Path::new(&names[i])
              .file_stem()
              .map_or_else(|| names[i].clone(), |s| s.to_string_lossy().into_owned()),
            None => format!("{i:0width$}"),
          };
          diag.save_label_map(&name, &LabelMap::from_labels(&filled));
        }
        Ok(filled)
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Two instances with a one pixel unlabelled seam, foreground everywhere
  /// in between.
  fn seam() -> (Labels, ProbabilityVolume) {
    let mut labels = Labels::zeros((1, 12, 23));
    labels.slice_mut(nd::s![0, 2..10, 3..11]).fill(1);
    labels.slice_mut(nd::s![0, 2..10, 12..20]).fill(2);
    let mut mask = ProbabilityVolume::zeros((1, 12, 23, 2));
    mask.slice_mut(nd::s![0, 2..10, 3..20, 0]).fill(1.0);
    (labels, mask)
  }

  #[test]
  fn centroid_fill_closes_seam() {
    let (labels, mask) = seam();
    let out = fill_by_centroid(&labels, &mask, 0.5, 10, VoronoiLabels::PreserveLabels).unwrap();
    assert_eq!(out[[0, 5, 11]], 1);
    assert_eq!(out[[0, 5, 4]], 1);
    assert_eq!(out[[0, 5, 16]], 2);
    assert_eq!(out[[0, 0, 0]], 0);
  }

  #[test]
  fn query_index_counts_background() {
    let (mut labels, mut mask) = seam();
    //Non consecutive labels expose the index semantics
    labels.mapv_inplace(|l| l * 10);
    mask.slice_mut(nd::s![0, 2..10, 20, 0]).fill(1.0);
    let out = fill_by_centroid(&labels, &mask, 0.5, 10, VoronoiLabels::QueryIndex).unwrap();
    assert_eq!(out[[0, 5, 20]], 2);
    //The background centroid lies on the seam
    assert_eq!(out[[0, 5, 11]], 0);
    let out = fill_by_centroid(&labels, &mask, 0.5, 10, VoronoiLabels::PreserveLabels).unwrap();
    assert_eq!(out[[0, 5, 20]], 20);
    assert_eq!(out[[0, 5, 11]], 10);
  }

  #[test]
  fn diagonal_foreground_chain_is_filled() {
    let mut labels = Labels::zeros((1, 16, 16));
    labels.slice_mut(nd::s![0, 0..3, 0..3]).fill(1);
    let mut mask = ProbabilityVolume::zeros((1, 16, 16, 2));
    for i in 0..5 {
      mask[[0, 8 + i, 8 + i, 0]] = 1.0;
    }
    //Five corner-touching voxels form one object larger than the minimum size
    let out = fill_by_centroid(&labels, &mask, 0.5, 3, VoronoiLabels::PreserveLabels).unwrap();
    assert_eq!(out[[0, 10, 10]], 1);
    assert_eq!(out[[0, 8, 8]], 1);
    assert_eq!(out[[0, 1, 1]], 1);
  }

  #[test]
  fn foreground_touching_the_edge_is_eroded_there() {
    let labels = Labels::zeros((1, 12, 12));
    let mut mask = ProbabilityVolume::zeros((1, 12, 12, 2));
    mask.slice_mut(nd::s![0, 4..8, 0..8, 0]).fill(1.0);
    let mut seeded = labels.clone();
    seeded[[0, 5, 5]] = 3;
    let out = fill_by_centroid(&seeded, &mask, 0.5, 1, VoronoiLabels::PreserveLabels).unwrap();
    assert_eq!(out[[0, 5, 3]], 3);
    //The edge column erodes away and keeps its original label
    assert_eq!(out[[0, 5, 0]], 0);
  }

  #[test]
  fn perimeter_fill_uses_nearest_shell() {
    let (labels, mut mask) = seam();
    mask.slice_mut(nd::s![0, 2..10, 3..20, 1]).fill(1.0);
    let out = fill_by_perimeter(&labels, &mask, Some(0.5)).unwrap();
    assert_eq!(out[[0, 5, 11]], 1);
    assert_eq!(out[[0, 5, 13]], 2);
    assert!(out.iter().all(|&l| l <= 2));
  }

  #[test]
  fn bad_inputs_are_rejected() {
    let (labels, _) = seam();
    let one_channel = ProbabilityVolume::zeros((1, 12, 23, 1));
    assert!(matches!(
      fill_by_perimeter(&labels, &one_channel, None),
      Err(SegError::ChannelCount { found: 1, .. })
    ));
    let wrong = ProbabilityVolume::zeros((1, 10, 23, 2));
    assert!(fill_by_centroid(&labels, &wrong, 0.3, 1, VoronoiLabels::QueryIndex).is_err());

    let filler = VoronoiBuilder::centroid().build().unwrap();
    let names = vec!["a.tif".to_string()];
    let (l, m) = seam();
    assert!(filler.fill_batch(&[l.clone(), l], &[m.clone(), m], Some(&names)).is_err());
  }

  #[test]
  fn batch_is_saved_by_name() {
    let dir = std::env::temp_dir().join(format!("cellseg-voronoi-{}", std::process::id()));
    let filler = VoronoiBuilder::perimeter().set_threshold(0.5).set_save_dir(&dir).build().unwrap();
    let (l, m) = seam();
    let names = vec!["sample.tif".to_string()];
    let out = filler.fill_batch(&[l], &[m], Some(&names)).unwrap();
    assert_eq!(out.len(), 1);
    assert!(dir.join("sample.npy").exists());
    let _ = std::fs::remove_dir_all(&dir);
  }
}
