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

//! Labelling and measurement of instances.

use std::collections::{BTreeMap, VecDeque};

use ndarray as nd;
use rayon::prelude::*;

use crate::morphology::Footprint;
use crate::volume::{is_planar, Labels, BACKGROUND};

/// Which voxels count as touching when labelling connected components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
  /// Face neighbours only: 4-connectivity in 2D, 6 in 3D.
  #[default]
  Face,
  /// Face, edge and corner neighbours: 8-connectivity in 2D, 26 in 3D.
  Full,
}

impl Connectivity {
  pub(crate) fn offsets(&self, planar: bool) -> Vec<[isize; 3]> {
    let fp = match self {
      Connectivity::Face => Footprint::cross(planar),
      Connectivity::Full => Footprint::full(planar),
    };
    fp.offsets().iter().copied().filter(|&o| o != [0, 0, 0]).collect()
  }
}

#[inline]
pub(crate) fn shifted(idx: [usize; 3], off: [isize; 3], shape: [usize; 3]) -> Option<[usize; 3]> {
  let mut out = [0usize; 3];
  for ax in 0..3 {
    let v = idx[ax] as isize + off[ax];
    if v < 0 || v >= shape[ax] as isize {
      return None;
    }
    out[ax] = v as usize;
  }
  Some(out)
}

////////////////////////////////////////////////////////////////////////////////
//                                LABELLING                                   //
////////////////////////////////////////////////////////////////////////////////

/// Label the connected components of a boolean mask. Labels are handed out in
/// raster order starting at 1. Returns the label volume and the number of
/// components.
pub fn label_mask(mask: nd::ArrayView3<bool>, conn: Connectivity) -> (Labels, usize) {
  let values = mask.mapv(|m| m as usize);
  label_values(values.view(), conn)
}

/// Label connected regions of equal, non-zero value. Two touching regions with
/// different values become different components.
pub fn label_values(values: nd::ArrayView3<usize>, conn: Connectivity) -> (Labels, usize) {
  let shape = {
    let s = values.shape();
    [s[0], s[1], s[2]]
  };
  let offsets = conn.offsets(is_planar(&shape));
  let mut out = Labels::zeros(shape);
  let mut next = 0usize;
  let mut queue = VecDeque::new();

  for (idx, &val) in values.indexed_iter() {
    let idx = [idx.0, idx.1, idx.2];
    if val == BACKGROUND || out[idx] != BACKGROUND {
      continue;
    }

    //New component: flood everything of the same value that is connected
    next += 1;
    out[idx] = next;
    queue.push_back(idx);
    while let Some(cur) = queue.pop_front() {
      for &off in &offsets {
        if let Some(n) = shifted(cur, off, shape) {
          if values[n] == val && out[n] == BACKGROUND {
            out[n] = next;
            queue.push_back(n);
          }
        }
      }
    }
  }

  (out, next)
}

/// Voxel count per label value, including background.
pub fn label_counts(labels: nd::ArrayView3<usize>) -> BTreeMap<usize, usize> {
  let mut counts = BTreeMap::new();
  labels.iter().for_each(|&l| *counts.entry(l).or_insert(0) += 1);
  counts
}

/// Sorted, non-background labels present in the volume.
pub fn unique_labels(labels: nd::ArrayView3<usize>) -> Vec<usize> {
  label_counts(labels).into_keys().filter(|&l| l != BACKGROUND).collect()
}

/// Number of distinct values, background included.
pub fn distinct_values(labels: nd::ArrayView3<usize>) -> usize {
  label_counts(labels).len()
}

/// Set every label with fewer than `min_size` voxels to background. Objects
/// are identified by label value, so the operation is idempotent.
pub fn remove_small_objects(labels: &Labels, min_size: usize) -> Labels {
  let counts = label_counts(labels.view());
  let mut out = labels.clone();
  out.par_mapv_inplace(|l| {
    if l != BACKGROUND && counts.get(&l).copied().unwrap_or(0) < min_size {
      BACKGROUND
    } else {
      l
    }
  });
  out
}

////////////////////////////////////////////////////////////////////////////////
//                            REGION PROPERTIES                               //
////////////////////////////////////////////////////////////////////////////////

/// Axis-aligned bounding box, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
  pub start: [usize; 3],
  pub end: [usize; 3],
}

impl BBox {
  /// Whether `other` lies completely inside `self`.
  pub fn contains(&self, other: &BBox) -> bool {
    (0..3).all(|ax| other.start[ax] >= self.start[ax] && other.end[ax] <= self.end[ax])
  }

  pub fn extent(&self) -> [usize; 3] {
    [self.end[0] - self.start[0], self.end[1] - self.start[1], self.end[2] - self.start[2]]
  }

  /// Largest extent over the axes that are actually used.
  pub fn diameter(&self, planar: bool) -> usize {
    let [dz, dy, dx] = self.extent();
    if planar {
      dy.max(dx)
    } else {
      dz.max(dy).max(dx)
    }
  }

  pub fn slice(&self) -> nd::SliceInfo<[nd::SliceInfoElem; 3], nd::Ix3, nd::Ix3> {
    nd::s![
      self.start[0]..self.end[0],
      self.start[1]..self.end[1],
      self.start[2]..self.end[2]
    ]
  }
}

/// Properties of a single labelled instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
  pub label: usize,
  /// voxel count
  pub area: usize,
  pub bbox: BBox,
  pub centroid: [f64; 3],
}

/// Measure all non-background labels, sorted by label.
pub fn regionprops(labels: nd::ArrayView3<usize>) -> Vec<Region> {
  struct Acc {
    area: usize,
    start: [usize; 3],
    end: [usize; 3],
    sum: [f64; 3],
  }

  let mut acc: BTreeMap<usize, Acc> = BTreeMap::new();
  for ((z, y, x), &l) in labels.indexed_iter() {
    if l == BACKGROUND {
      continue;
    }
    let p = [z, y, x];
    let entry = acc.entry(l).or_insert(Acc { area: 0, start: p, end: p, sum: [0.0; 3] });
    entry.area += 1;
    for ax in 0..3 {
      entry.start[ax] = entry.start[ax].min(p[ax]);
      entry.end[ax] = entry.end[ax].max(p[ax]);
      entry.sum[ax] += p[ax] as f64;
    }
  }

  acc
    .into_iter()
    .map(|(label, a)| Region {
      label,
      area: a.area,
      bbox: BBox { start: a.start, end: [a.end[0] + 1, a.end[1] + 1, a.end[2] + 1] },
      centroid: [
        a.sum[0] / a.area as f64,
        a.sum[1] / a.area as f64,
        a.sum[2] / a.area as f64,
      ],
    })
    .collect()
}

/// Perimeter estimate of a planar object, weighting border pixels by the
/// local configuration of their 4-connected border neighbours (straight runs
/// count 1, diagonal steps √2, corners (1+√2)/2).
pub fn perimeter_2d(mask: nd::ArrayView2<bool>) -> f64 {
  const KERNEL: [[usize; 3]; 3] = [[10, 2, 10], [2, 1, 2], [10, 2, 10]];
  let (ny, nx) = mask.dim();
  let at = |y: isize, x: isize| -> bool {
    y >= 0 && x >= 0 && (y as usize) < ny && (x as usize) < nx && mask[[y as usize, x as usize]]
  };

  //(1) Border pixels: object pixels that disappear under a cross erosion
  //    where the outside of the image counts as background
  let border = nd::Array2::from_shape_fn((ny, nx), |(y, x)| {
    let (y, x) = (y as isize, x as isize);
    at(y, x) && !(at(y - 1, x) && at(y + 1, x) && at(y, x - 1) && at(y, x + 1))
  });

  //(2) Encode the neighbourhood of every pixel and look up its weight
  let weight = |code: usize| -> f64 {
    match code {
      5 | 7 | 15 | 17 | 25 | 27 => 1.0,
      21 | 33 => std::f64::consts::SQRT_2,
      13 | 23 => (1.0 + std::f64::consts::SQRT_2) / 2.0,
      _ => 0.0,
    }
  };

  let mut total = 0.0;
  for y in 0..ny as isize {
    for x in 0..nx as isize {
      let mut code = 0;
      for (ky, row) in KERNEL.iter().enumerate() {
        for (kx, &k) in row.iter().enumerate() {
          let (yy, xx) = (y + ky as isize - 1, x + kx as isize - 1);
          if yy >= 0 && xx >= 0 && (yy as usize) < ny && (xx as usize) < nx {
            if border[[yy as usize, xx as usize]] {
              code += k;
            }
          }
        }
      }
      total += weight(code);
    }
  }
  total
}

/// `4π·area / perimeter²`; zero when the perimeter is zero.
pub fn circularity(area: f64, perimeter: f64) -> f64 {
  if perimeter == 0.0 {
    0.0
  } else {
    (4.0 * std::f64::consts::PI * area) / (perimeter * perimeter)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                           DISTANCE TRANSFORM                               //
////////////////////////////////////////////////////////////////////////////////

/// One dimensional squared distance transform (Felzenszwalb & Huttenlocher).
fn edt_1d(f: &[f64], out: &mut [f64]) {
  let n = f.len();
  let mut v = vec![0usize; n];
  let mut z = vec![0f64; n + 1];
  let mut k = 0usize;
  z[0] = f64::NEG_INFINITY;
  z[1] = f64::INFINITY;

  //Skip leading infinities so the lower envelope starts at a finite parabola
  let first = match f.iter().position(|v| v.is_finite()) {
    Some(p) => p,
    None => {
      out.iter_mut().for_each(|o| *o = f64::INFINITY);
      return;
    }
  };
  v[0] = first;

  for q in first + 1..n {
    if !f[q].is_finite() {
      continue;
    }
    loop {
      let p = v[k];
      let s = ((f[q] + (q * q) as f64) - (f[p] + (p * p) as f64)) / (2.0 * q as f64 - 2.0 * p as f64);
      if s <= z[k] && k > 0 {
        k -= 1;
        continue;
      }
      if s <= z[k] {
        //k == 0 and the new parabola dominates everywhere
        v[0] = q;
        z[1] = f64::INFINITY;
        break;
      }
      k += 1;
      v[k] = q;
      z[k] = s;
      z[k + 1] = f64::INFINITY;
      break;
    }
  }

  k = 0;
  for (q, o) in out.iter_mut().enumerate() {
    while z[k + 1] < q as f64 {
      k += 1;
    }
    let p = v[k];
    let d = q as f64 - p as f64;
    *o = d * d + f[p];
  }
}

/// Exact Euclidean distance from every foreground voxel to the nearest
/// background voxel (background voxels get 0). If the volume holds no
/// background at all, every voxel is set to 0, which gives a flat surface.
pub fn distance_transform_edt(mask: nd::ArrayView3<bool>) -> nd::Array3<f64> {
  let mut dist = mask.mapv(|m| if m { f64::INFINITY } else { 0.0 });

  for axis in 0..3 {
    let len = dist.len_of(nd::Axis(axis));
    if len <= 1 {
      continue;
    }
    nd::Zip::from(dist.lanes_mut(nd::Axis(axis))).par_for_each(|mut lane| {
      let f: Vec<f64> = lane.iter().copied().collect();
      let mut out = vec![0f64; f.len()];
      edt_1d(&f, &mut out);
      lane.iter_mut().zip(out).for_each(|(l, o)| *l = o);
    });
  }

  if dist.iter().any(|d| !d.is_finite()) {
    dist.fill(0.0);
    return dist;
  }
  dist.mapv_inplace(f64::sqrt);
  dist
}

////////////////////////////////////////////////////////////////////////////////
//                             THRESHOLDING                                   //
////////////////////////////////////////////////////////////////////////////////

/// Otsu's threshold over a 256-bin histogram. Values strictly greater than the
/// returned threshold belong to the upper class.
pub fn otsu_threshold<'a, I>(values: I) -> f32
where
  I: IntoIterator<Item = &'a f32>,
{
  const BINS: usize = 256;
  let data: Vec<f32> = values.into_iter().copied().filter(|v| v.is_finite()).collect();
  if data.is_empty() {
    return 0.0;
  }
  let min = data.iter().copied().fold(f32::INFINITY, f32::min);
  let max = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  if max - min <= f32::EPSILON {
    return min;
  }

  let width = (max - min) as f64 / BINS as f64;
  let centre = |b: usize| min as f64 + (b as f64 + 0.5) * width;
  let mut hist = vec![0f64; BINS];
  for &v in &data {
    let b = (((v - min) as f64 / width) as usize).min(BINS - 1);
    hist[b] += 1.0;
  }

  let total: f64 = hist.iter().sum();
  let sum_total: f64 = hist.iter().enumerate().map(|(b, &c)| centre(b) * c).sum();
  let (mut w_lo, mut sum_lo) = (0.0, 0.0);
  let (mut best, mut best_var) = (0usize, f64::NEG_INFINITY);
  for b in 0..BINS - 1 {
    w_lo += hist[b];
    sum_lo += centre(b) * hist[b];
    let w_hi = total - w_lo;
    if w_lo == 0.0 || w_hi == 0.0 {
      continue;
    }
    let mean_lo = sum_lo / w_lo;
    let mean_hi = (sum_total - sum_lo) / w_hi;
    let var = w_lo * w_hi * (mean_lo - mean_hi).powi(2);
    if var > best_var {
      best_var = var;
      best = b;
    }
  }
  centre(best) as f32
}

/// Intersection over union of two boolean masks. Two empty masks agree
/// perfectly and score 1.
pub fn jaccard_index(a: nd::ArrayView3<bool>, b: nd::ArrayView3<bool>) -> f64 {
  let (inter, union) = nd::Zip::from(&a)
    .and(&b)
    .fold((0usize, 0usize), |(i, u), &x, &y| (i + (x && y) as usize, u + (x || y) as usize));
  if union == 0 {
    1.0
  } else {
    inter as f64 / union as f64
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn planar(rows: &[&[usize]]) -> Labels {
    let ny = rows.len();
    let nx = rows[0].len();
    Labels::from_shape_fn((1, ny, nx), |(_, y, x)| rows[y][x])
  }

  #[test]
  fn face_connectivity_splits_diagonals() {
    let mask = planar(&[&[1, 0], &[0, 1]]).mapv(|v| v > 0);
    let (_, n) = label_mask(mask.view(), Connectivity::Face);
    assert_eq!(n, 2);
    let (_, n) = label_mask(mask.view(), Connectivity::Full);
    assert_eq!(n, 1);
  }

  #[test]
  fn touching_values_stay_apart() {
    let vals = planar(&[&[1, 1, 2], &[0, 0, 2]]);
    let (labels, n) = label_values(vals.view(), Connectivity::Face);
    assert_eq!(n, 2);
    assert_ne!(labels[[0, 0, 0]], labels[[0, 0, 2]]);
  }

  #[test]
  fn small_object_removal_is_idempotent() {
    let labels = planar(&[&[1, 1, 0, 2], &[1, 0, 0, 0], &[0, 3, 3, 0]]);
    let once = remove_small_objects(&labels, 2);
    assert_eq!(unique_labels(once.view()), vec![1, 3]);
    assert_eq!(remove_small_objects(&once, 2), once);
  }

  #[test]
  fn regionprops_bbox_and_centroid() {
    let labels = planar(&[&[0, 4, 4], &[0, 4, 4]]);
    let props = regionprops(labels.view());
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].area, 4);
    assert_eq!(props[0].bbox, BBox { start: [0, 0, 1], end: [1, 2, 3] });
    assert_eq!(props[0].centroid, [0.0, 0.5, 1.5]);
    assert!(props[0].bbox.contains(&BBox { start: [0, 1, 1], end: [1, 2, 2] }));
  }

  #[test]
  fn circularity_of_ideal_circle_is_one() {
    let r: f64 = 7.5;
    let c = circularity(std::f64::consts::PI * r * r, 2.0 * std::f64::consts::PI * r);
    assert!((c - 1.0).abs() < 1e-12);
    assert_eq!(circularity(10.0, 0.0), 0.0);
  }

  #[test]
  fn perimeter_of_square() {
    let mut mask = nd::Array2::<bool>::from_elem((10, 10), false);
    mask.slice_mut(nd::s![2..7, 2..7]).fill(true);
    //Border pixel centres trace a 4x4 square
    assert!((perimeter_2d(mask.view()) - 16.0).abs() < 1e-9);
  }

  #[test]
  fn edt_of_line() {
    let mut mask = nd::Array3::<bool>::from_elem((1, 1, 7), true);
    mask[[0, 0, 0]] = false;
    mask[[0, 0, 6]] = false;
    let d = distance_transform_edt(mask.view());
    assert_eq!(d.as_slice().unwrap(), &[0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0]);
  }

  #[test]
  fn edt_is_euclidean_in_plane() {
    let mut mask = nd::Array3::<bool>::from_elem((1, 5, 5), true);
    mask[[0, 0, 0]] = false;
    let d = distance_transform_edt(mask.view());
    assert!((d[[0, 3, 4]] - 5.0).abs() < 1e-12);
    assert!((d[[0, 1, 1]] - std::f64::consts::SQRT_2).abs() < 1e-12);
  }

  #[test]
  fn otsu_splits_bimodal_data() {
    let mut data: Vec<f32> = (0..100).map(|i| 0.1 + 0.2 * i as f32 / 100.0).collect();
    data.extend((0..100).map(|i| 0.7 + 0.2 * i as f32 / 100.0));
    let th = otsu_threshold(&data);
    assert!(th > 0.3 && th < 0.7, "threshold {th}");
  }

  #[test]
  fn jaccard_of_half_overlap() {
    let a = nd::Array3::from_shape_vec((1, 1, 4), vec![true, true, false, false]).unwrap();
    let b = nd::Array3::from_shape_vec((1, 1, 4), vec![false, true, true, false]).unwrap();
    assert!((jaccard_index(a.view(), b.view()) - 1.0 / 3.0).abs() < 1e-12);
  }
}
