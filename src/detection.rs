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

//! Instance growth from sparse point detections.
//!
//! Point detections come in as a class map (`0` is background, `1..=n` are
//! classes). They are optionally dilated per class, labelled and flooded over
//! the rank gradient of the contrast enhanced image. A synthetic background
//! seed sits in the first corner of the first slice.

use std::path::{Path, PathBuf};

use ndarray as nd;
use rayon::prelude::*;

use crate::diagnostics::Diagnostics;
use crate::donut::{self, DonutShape};
use crate::error::{SegError, SegResult};
use crate::measure::{label_values, Connectivity};
use crate::morphology::{self as morph, Footprint};
use crate::spatial::PointIndex;
use crate::volume::{is_planar, Labels, Resolution, BACKGROUND};
use crate::watershed::{water_levels, MarkerWatershed, Watershed};

/// Side of the square background seed.
const BACKGROUND_SEED: usize = 4;
/// Clip limit of the contrast equalisation, as a fraction of the tile pixels.
const CLIP_LIMIT: f64 = 0.01;
/// Tiles per side of the contrast equalisation grid.
const TILES: usize = 8;

////////////////////////////////////////////////////////////////////////////////
//                             PREPROCESSING                                  //
////////////////////////////////////////////////////////////////////////////////

/// Lookup table that equalises the clipped histogram of `values`. Counts
/// above the clip limit are spread evenly over all grey levels.
fn clipped_lut<'a>(values: impl Iterator<Item = &'a u8>, clip_limit: f64) -> [u8; 256] {
  let mut hist = [0usize; 256];
  let mut n = 0usize;
  values.for_each(|&v| {
    hist[v as usize] += 1;
    n += 1;
  });
  let mut lut = [0u8; 256];
  if n == 0 {
    return lut;
  }

  //(1) clip and redistribute
  let clip = ((clip_limit * n as f64) as usize).max(1);
  let excess: usize = hist.iter().map(|&h| h.saturating_sub(clip)).sum();
  let (incr, mut residual) = (excess / 256, excess % 256);
  for h in hist.iter_mut() {
    *h = (*h).min(clip) + incr;
    if residual > 0 {
      *h += 1;
      residual -= 1;
    }
  }

  //(2) cumulative histogram
  let mut cdf = 0usize;
  for (v, &h) in hist.iter().enumerate() {
    cdf += h;
    lut[v] = ((cdf as f64 * 255.0 / n as f64).round()).min(255.0) as u8;
  }
  lut
}

/// Contrast limited adaptive histogram equalisation. The slice is cut into
/// an 8x8 grid of tiles, every tile gets its own clipped-histogram lookup
/// table and pixels blend the tables of the four nearest tile centres.
pub fn equalize_slice(slice: nd::ArrayView2<u8>, clip_limit: f64) -> nd::Array2<u8> {
  let (ny, nx) = slice.dim();
  if ny * nx == 0 {
    return slice.to_owned();
  }

  //(1) one table per tile
  let (ty, tx) = ((ny / TILES).max(1), (nx / TILES).max(1));
  let (gy, gx) = ((ny + ty - 1) / ty, (nx + tx - 1) / tx);
  let luts: Vec<[u8; 256]> = (0..gy * gx)
    .into_par_iter()
    .map(|t| {
      let (i, j) = (t / gx, t % gx);
      let tile = slice.slice(nd::s![i * ty..((i + 1) * ty).min(ny), j * tx..((j + 1) * tx).min(nx)]);
      clipped_lut(tile.iter(), clip_limit)
    })
    .collect();

  //(2) bilinear blend between neighbouring tiles
  let neighbours = |pos: usize, size: usize, grid: usize| -> (usize, usize, f64) {
    let f = ((pos as f64 + 0.5) / size as f64 - 0.5).clamp(0.0, (grid - 1) as f64);
    let lo = f.floor() as usize;
    (lo, (lo + 1).min(grid - 1), f - lo as f64)
  };
  nd::Array2::from_shape_fn((ny, nx), |(y, x)| {
    let v = slice[[y, x]] as usize;
    let (y0, y1, wy) = neighbours(y, ty, gy);
    let (x0, x1, wx) = neighbours(x, tx, gx);
    let at = |i: usize, j: usize| luts[i * gx + j][v] as f64;
    let top = at(y0, x0) * (1.0 - wx) + at(y0, x1) * wx;
    let bottom = at(y1, x0) * (1.0 - wx) + at(y1, x1) * wx;
    (top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8
  })
}

/// Rescale an intensity volume to the full `u8` range and equalise every
/// slice.
pub fn preprocess_intensity(img: nd::ArrayView3<f32>) -> nd::Array3<u8> {
  let (lo, hi) = img.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
  let scale = if hi > lo { 255.0 / (hi - lo) } else { 0.0 };
  let mut out = img.mapv(|v| ((v - lo) * scale).round().clamp(0.0, 255.0) as u8);
  out.axis_iter_mut(nd::Axis(0)).into_par_iter().for_each(|mut slice| {
    let eq = equalize_slice(slice.view(), CLIP_LIMIT);
    slice.assign(&eq);
  });
  out
}

////////////////////////////////////////////////////////////////////////////////
//                              CLOSE POINTS                                  //
////////////////////////////////////////////////////////////////////////////////

/// Thin out a point list so that no two kept points lie within `radius` of
/// each other (physical units). Points are visited in order; a kept point
/// discards all its neighbours. `classes`, when given, is filtered in
/// lock-step.
pub fn remove_close_points<T: Clone>(
  points: &[[f64; 3]],
  radius: f64,
  resolution: &Resolution,
  classes: Option<&[T]>,
) -> SegResult<(Vec<[f64; 3]>, Option<Vec<T>>)> {
  if let Some(cls) = classes {
    if cls.len() != points.len() {
      return Err(SegError::shape("class list", &[cls.len()], &[points.len()]));
    }
  }
  log::info!("removing close points, {} to start with", points.len());

  let [rz, ry, rx] = resolution.0;
  let scaled: Vec<[f64; 3]> = points.iter().map(|p| [p[0] * rz, p[1] * ry, p[2] * rx]).collect();
  let tree = PointIndex::new(scaled);

  let mut neighbours: Vec<Vec<usize>> = vec![Vec::new(); points.len()];
  for (i, j) in tree.query_pairs(radius) {
    neighbours[i].push(j);
    neighbours[j].push(i);
  }

  let mut discard = vec![false; points.len()];
  let mut keep = Vec::new();
  for node in 0..points.len() {
    if !discard[node] {
      keep.push(node);
      neighbours[node].iter().for_each(|&n| discard[n] = true);
    }
  }
  log::info!("{} points left", keep.len());

  let kept_points = keep.iter().map(|&i| points[i]).collect();
  let kept_classes = classes.map(|cls| keep.iter().map(|&i| cls[i].clone()).collect());
  Ok((kept_points, kept_classes))
}

////////////////////////////////////////////////////////////////////////////////
//                                BUILDER                                     //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct DetectionBuilder {
  n_classes: usize,
  first_dilation: Vec<[usize; 3]>,
  donut_classes: Vec<usize>,
  donut_patch: [usize; 3],
  nucleus_diameter: usize,
  diagnostics: Option<PathBuf>,
}

impl DetectionBuilder {
  pub fn new(n_classes: usize) -> Self {
    DetectionBuilder {
      n_classes,
      first_dilation: vec![[0; 3]; n_classes],
      donut_classes: Vec::new(),
      donut_patch: [13, 120, 120],
      nucleus_diameter: 30,
      diagnostics: None,
    }
  }

  /// Dilate the seeds of `class` (1-based) with a `(z, y, x)` box before
  /// growth. A box with a zero side disables the dilation; for planar data the
  /// z side is ignored.
  pub fn set_first_dilation(mut self, class: usize, size: [usize; 3]) -> Self {
    if let Some(slot) = class.checked_sub(1).and_then(|c| self.first_dilation.get_mut(c)) {
      *slot = size;
    } else {
      //Caught by build()
      self.first_dilation.push(size);
    }
    self
  }

  /// Classes (1-based) whose detections are checked for donut shapes.
  pub fn set_donut_classes(mut self, classes: &[usize]) -> Self {
    self.donut_classes = classes.to_vec();
    self
  }

  /// Window `(z, y, x)` analysed around every donut candidate.
  pub fn set_donut_patch(mut self, patch: [usize; 3]) -> Self {
    self.donut_patch = patch;
    self
  }

  pub fn set_nucleus_diameter(mut self, diameter: usize) -> Self {
    self.nucleus_diameter = diameter;
    self
  }

  pub fn set_diagnostics_dir(mut self, dir: &Path) -> Self {
    self.diagnostics = Some(dir.to_path_buf());
    self
  }

  pub fn build(self) -> SegResult<DetectionWatershed> {
    if self.n_classes == 0 {
      return Err(SegError::InvalidConfig("need at least one detection class".into()));
    }
    if self.first_dilation.len() != self.n_classes {
      return Err(SegError::InvalidConfig(format!(
        "seed dilation set for a class outside 1..={}",
        self.n_classes
      )));
    }
    if let Some(c) = self.donut_classes.iter().find(|&&c| c == 0 || c > self.n_classes) {
      return Err(SegError::InvalidConfig(format!("donut class {c} outside 1..={}", self.n_classes)));
    }
    if self.donut_patch[1] == 0 || self.donut_patch[2] == 0 {
      return Err(SegError::InvalidConfig("donut patch has to be at least one pixel wide".into()));
    }
    Ok(DetectionWatershed {
      n_classes: self.n_classes,
      first_dilation: self.first_dilation,
      donut_classes: self.donut_classes,
      donut_patch: self.donut_patch,
      nucleus_diameter: self.nucleus_diameter,
      diagnostics: self.diagnostics.map(Diagnostics::new),
    })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                               WATERSHED                                    //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct DetectionWatershed {
  n_classes: usize,
  first_dilation: Vec<[usize; 3]>,
  donut_classes: Vec<usize>,
  donut_patch: [usize; 3],
  nucleus_diameter: usize,
  diagnostics: Option<Diagnostics>,
}

impl DetectionWatershed {
  fn dilation_box(&self, class: usize, planar: bool) -> Option<Footprint> {
    let [z, y, x] = self.first_dilation[class - 1];
    let z = if planar { 1 } else { z };
    (z != 0 && y != 0 && x != 0).then(|| Footprint::cuboid([z, y, x]))
  }

  /// Per-class dilation, clipped to the class count.
  fn dilate_classes(&self, classes: &Labels) -> Labels {
    let planar = is_planar(classes.shape());
    let mut out = Labels::zeros(classes.raw_dim());
    for class in 1..=self.n_classes {
      let mask = classes.mapv(|v| v == class);
      let mask = match self.dilation_box(class, planar) {
        Some(fp) => morph::binary_dilation(mask.view(), &fp),
        None => mask,
      };
      nd::Zip::from(&mut out).and(&mask).par_for_each(|o, &m| {
        if m {
          *o += class
        }
      });
    }
    out.mapv_inplace(|v| v.min(self.n_classes));
    out
  }

  /// Grow the seed of every donut shaped detection into its ring.
  fn grow_donuts(&self, img: &nd::Array3<u8>, seeds: &mut Labels, background: usize, coords: &[Vec<[usize; 3]>]) {
    let planar = is_planar(seeds.shape());
    let shape = [seeds.shape()[0], seeds.shape()[1], seeds.shape()[2]];
    let intensity = img.mapv(|v| v as f64 / 255.0);
    let (wy, wx) = (donut::smoothing_window(self.donut_patch[1]), donut::smoothing_window(self.donut_patch[2]));

    for &class in &self.donut_classes {
      let diag = self.diagnostics.as_ref().map(|d| d.child(&format!("class_{class}_check")));
      for &point in coords.get(class - 1).map(Vec::as_slice).unwrap_or(&[]) {
        let l = match seeds.get(point) {
          Some(&l) if l != BACKGROUND && l != background => l,
          _ => {
            log::debug!("class {class} detection {point:?} has no seed");
            continue;
          }
        };

        //(1) smoothed profiles through the detection
        let bbox = donut::patch_box(point, self.donut_patch, shape);
        let (line_y, line_x) = donut::profiles(intensity.view(), point, &bbox);
        if let Some(ref d) = diag {
          d.save_u8(&format!("{l}_patch"), img.slice(bbox.slice()));
          #[cfg(feature = "plots")]
          {
            crate::plotting::plot_profile(&line_y, &d.dir().join(format!("{l}_line_y.png")));
            crate::plotting::plot_profile(&line_x, &d.dir().join(format!("{l}_line_x.png")));
          }
        }
        let line_y = donut::savgol_filter(&line_y, wy, 2);
        let line_x = donut::savgol_filter(&line_x, wx, 2);

        //(2) classify and grow
        let centre = donut::profile_centre(point, &bbox);
        let verdict = donut::classify(&line_y, &line_x, centre, self.nucleus_diameter);
        let size = match verdict {
          DonutShape::Donut { y_width, x_width } => {
            donut::donut_dilation(y_width, x_width, self.first_dilation[class - 1], planar)
          }
          DonutShape::Small => {
            log::info!("instance {l} has a donut shape but is not very large");
            None
          }
          DonutShape::FlatTails => {
            log::info!("instance {l} has a donut shape with low gradient flanks, not dilating it");
            None
          }
          DonutShape::Solid => None,
        };
        let Some(size) = size else { continue };
        log::info!("instance {l} has a donut shape, growing its seed by {size:?}");

        let mut patch = seeds.slice_mut(bbox.slice());
        let own = patch.mapv(|v| if v == l { l } else { 0 });
        let grown = morph::grey_dilation(own.view(), &Footprint::cuboid(size));
        nd::Zip::from(&mut patch).and(&grown).for_each(|s, &g| {
          if *s == BACKGROUND {
            *s = g
          }
        });
      }
    }
  }

  /// Grow instances from point detections.
  ///
  /// `image` is the raw intensity volume and `classes` the detection class
  /// map, both `(z, y, x)`. `coords` holds the detection coordinates per class
  /// and is only used for donut checks.
  pub fn grow(&self, image: nd::ArrayView3<f32>, classes: &Labels, coords: &[Vec<[usize; 3]>]) -> SegResult<Labels> {
    if image.shape() != classes.shape() {
      return Err(SegError::shape("detection image", image.shape(), classes.shape()));
    }
    let planar = is_planar(classes.shape());
    let img = preprocess_intensity(image);

    //(1) seeds with a background corner
    let dilated = self.dilate_classes(classes);
    let (mut seeds, n) = label_values(dilated.view(), Connectivity::Full);
    let background = n + 1;
    let (ny, nx) = (seeds.shape()[1], seeds.shape()[2]);
    seeds.slice_mut(nd::s![0, ..BACKGROUND_SEED.min(ny), ..BACKGROUND_SEED.min(nx)]).fill(background);

    //(2) donuts
    if !self.donut_classes.is_empty() {
      self.grow_donuts(&img, &mut seeds, background, coords);
    }

    //(3) flood the image gradient
    let gradient = water_levels(morph::rank_gradient(img.view(), &Footprint::round(3, planar)));
    let mut segm = MarkerWatershed::default().flood(gradient.view(), &seeds, None);
    segm.par_mapv_inplace(|l| if l == background { BACKGROUND } else { l });

    //(4) close small gaps, then restore the outline
    let grown = morph::grey_dilation(segm.view(), &Footprint::disk(5));
    nd::Zip::from(&mut segm).and(&grown).par_for_each(|s, &g| {
      if *s == BACKGROUND {
        *s = g
      }
    });
    let segm = morph::grey_erosion(segm.view(), &Footprint::disk(if planar { 3 } else { 2 }));
    log::info!("detection watershed grew {} seeds", n);

    if let Some(ref diag) = self.diagnostics {
      diag.save_u8("img", img.view());
      diag.save_u8("gradient", gradient.view());
      diag.save_labels_like("seed_map", &seeds, &crate::volume::LabelMap::from_labels(&seeds));
      diag.save_label_map("watershed", &crate::volume::LabelMap::from_labels(&segm));
    }
    Ok(segm)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn close_points_keep_first_of_pair() {
    let points = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [10.0, 0.0, 0.0]];
    let classes = ["a", "b", "c"];
    let (kept, cls) = remove_close_points(&points, 2.0, &Resolution::default(), Some(&classes[..])).unwrap();
    assert_eq!(kept, vec![[0.0, 0.0, 0.0], [10.0, 0.0, 0.0]]);
    assert_eq!(cls, Some(vec!["a", "c"]));

    //Resolution stretches the distances
    let (kept, _) = remove_close_points::<u8>(&points, 2.0, &Resolution([5.0, 1.0, 1.0]), None).unwrap();
    assert_eq!(kept.len(), 3);
    assert!(remove_close_points(&points, 2.0, &Resolution::default(), Some(&[1u8][..])).is_err());
    assert!(remove_close_points::<u8>(&[], 2.0, &Resolution::default(), None).unwrap().0.is_empty());
  }

  #[test]
  fn equalisation_spreads_levels() {
    let slice = nd::Array2::from_shape_fn((16, 16), |(y, _)| (y * 2) as u8);
    let eq = equalize_slice(slice.view(), 1.0);
    assert_eq!(eq[[15, 0]], 255);
    assert!(eq[[0, 0]] < eq[[8, 0]]);
    let flat = preprocess_intensity(nd::Array3::<f32>::from_elem((1, 4, 4), 3.0).view());
    assert!(flat.iter().all(|&v| v == flat[[0, 0, 0]]));
  }

  #[test]
  fn equalisation_is_local() {
    //Faint stripes on the left, a bright block on the right
    let slice = nd::Array2::from_shape_fn((32, 32), |(_, x)| match (x < 16, x % 2) {
      (true, 0) => 10u8,
      (true, _) => 12,
      (false, 0) => 200,
      (false, _) => 202,
    });
    let eq = equalize_slice(slice.view(), 1.0);
    //A single histogram would only stretch the stripes to 64 and 128
    assert_eq!((eq[[16, 0]], eq[[16, 1]]), (128, 255));
    assert!(eq[[16, 1]] - eq[[16, 0]] > 100);
  }

  #[test]
  fn grows_two_detections() {
    //Two bright squares on a dark background with one detection each
    let mut image = nd::Array3::<f32>::zeros((1, 40, 40));
    image.slice_mut(nd::s![.., 8..18, 8..18]).fill(1.0);
    image.slice_mut(nd::s![.., 22..34, 22..34]).fill(1.0);
    let mut classes = Labels::zeros((1, 40, 40));
    classes[[0, 12, 12]] = 1;
    classes[[0, 28, 28]] = 1;

    let det = DetectionBuilder::new(1).set_first_dilation(1, [1, 3, 3]).build().unwrap();
    let out = det.grow(image.view(), &classes, &[]).unwrap();
    let (a, b) = (out[[0, 12, 12]], out[[0, 28, 28]]);
    assert!(a != 0 && b != 0 && a != b);
    assert_eq!(out[[0, 15, 15]], a);
    assert_eq!(out[[0, 30, 30]], b);
    assert_eq!(out[[0, 2, 2]], 0);
    assert_eq!(out[[0, 38, 2]], 0);
  }

  #[test]
  fn invalid_classes_are_rejected() {
    assert!(DetectionBuilder::new(0).build().is_err());
    assert!(DetectionBuilder::new(2).set_donut_classes(&[3]).build().is_err());
    assert!(DetectionBuilder::new(2).set_first_dilation(4, [1, 1, 1]).build().is_err());
  }
}
