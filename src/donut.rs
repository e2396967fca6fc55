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

//! Detection of ring shaped ("donut") cells from two intensity profiles.
//!
//! A cell with a dark centre and a bright rim shows up in a vertical and a
//! horizontal line through its centre as a U: a peak on either side of a low
//! valley. Plain gradient watersheds tend to stop at the inner rim of such a
//! cell, so its seed is grown up front when the U is wide enough.

use ndarray as nd;

use crate::measure::BBox;

/// Peaks must reach this multiple of the valley nearest to the centre.
const PEAK_OVER_VALLEY: f64 = 1.5;
/// Outside each peak the profile has to drop below this fraction of the peak.
const TAIL_DROP: f64 = 0.7;
/// Fraction of the ring width that is not used for seed growth.
const SAFETY_SHRINK: f64 = 0.4;

////////////////////////////////////////////////////////////////////////////////
//                              1D SIGNALS                                    //
////////////////////////////////////////////////////////////////////////////////

/// Least squares polynomial through `(xs, ys)`, evaluated at `at`.
fn fit_eval(xs: &[f64], ys: &[f64], order: usize, at: &[f64]) -> Vec<f64> {
  let n = order + 1;

  //(1) normal equations
  let mut a = vec![vec![0.0; n + 1]; n];
  for (&x, &y) in xs.iter().zip(ys) {
    let pows: Vec<f64> = (0..n).map(|k| x.powi(k as i32)).collect();
    for r in 0..n {
      for c in 0..n {
        a[r][c] += pows[r] * pows[c];
      }
      a[r][n] += pows[r] * y;
    }
  }

  //(2) gaussian elimination with partial pivoting
  for col in 0..n {
    let pivot = (col..n)
      .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
      .unwrap_or(col);
    a.swap(col, pivot);
    if a[col][col].abs() < f64::EPSILON {
      continue;
    }
    for r in 0..n {
      if r != col {
        let f = a[r][col] / a[col][col];
        for c in col..=n {
          a[r][c] -= f * a[col][c];
        }
      }
    }
  }
  let coef: Vec<f64> =
    (0..n).map(|k| if a[k][k].abs() < f64::EPSILON { 0.0 } else { a[k][n] / a[k][k] }).collect();

  at.iter().map(|&x| coef.iter().rev().fold(0.0, |acc, &c| acc * x + c)).collect()
}

/// Savitzky-Golay smoothing. Edges are handled by evaluating the polynomial
/// fitted to the first and last window. A window longer than the signal is
/// shrunk to the longest odd window that fits; when that no longer exceeds
/// `polyorder` the signal is returned as is.
pub fn savgol_filter(line: &[f64], window: usize, polyorder: usize) -> Vec<f64> {
  let n = line.len();
  let mut window = window.min(n);
  if window % 2 == 0 {
    window = window.saturating_sub(1);
  }
  if window <= polyorder {
    return line.to_vec();
  }
  let half = window / 2;
  let mut out = line.to_vec();

  //(1) interior: centred windows
  let centred: Vec<f64> = (0..window).map(|k| k as f64 - half as f64).collect();
  for i in half..n - half {
    out[i] = fit_eval(&centred, &line[i - half..=i + half], polyorder, &[0.0])[0];
  }

  //(2) edges: polynomial of the outermost windows
  let xs: Vec<f64> = (0..window).map(|k| k as f64).collect();
  let head = fit_eval(&xs, &line[..window], polyorder, &xs[..half]);
  out[..half].copy_from_slice(&head);
  let tail = fit_eval(&xs, &line[n - window..], polyorder, &xs[window - half..]);
  out[n - half..].copy_from_slice(&tail);
  out
}

/// Positions of the local maxima of `line`. A flat top counts as a single
/// peak at its (lower) middle.
pub fn find_peaks(line: &[f64]) -> Vec<usize> {
  let mut peaks = Vec::new();
  if line.len() < 3 {
    return peaks;
  }
  let i_max = line.len() - 1;
  let mut i = 1;
  while i < i_max {
    if line[i - 1] < line[i] {
      let mut ahead = i + 1;
      while ahead < i_max && line[ahead] == line[i] {
        ahead += 1;
      }
      if line[ahead] < line[i] {
        peaks.push((i + ahead - 1) / 2);
        i = ahead;
      }
    }
    i += 1;
  }
  peaks
}

////////////////////////////////////////////////////////////////////////////////
//                            PROFILE ANALYSIS                                //
////////////////////////////////////////////////////////////////////////////////

/// A profile with a high peak on both sides of its central valley.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UShape {
  pub left: usize,
  pub right: usize,
  /// both outer flanks drop well below their peak
  pub steep_tails: bool,
}

impl UShape {
  pub fn width(&self) -> usize {
    self.right - self.left
  }
}

/// Look for a U in a smoothed profile around index `mid`, the position of the
/// detection on the line. `None` without a valley or without a high enough
/// peak on either side of `mid`.
pub fn analyse_profile(line: &[f64], mid: usize) -> Option<UShape> {
  let minima = find_peaks(&line.iter().map(|v| -v).collect::<Vec<_>>());
  let valley = minima.iter().copied().min_by_key(|&m| m.abs_diff(mid))?;
  let floor = line[valley] * PEAK_OVER_VALLEY;

  let (mut left, mut right): (Option<(usize, f64)>, Option<(usize, f64)>) = (None, None);
  for p in find_peaks(line) {
    let v = line[p];
    if v < floor {
      continue;
    }
    let side = if p <= mid { &mut left } else { &mut right };
    if side.map_or(v > 0.0, |(_, best)| v > best) {
      *side = Some((p, v));
    }
  }
  let ((lp, lv), (rp, rv)) = (left?, right?);

  let lowest = |s: &[f64]| s.iter().copied().fold(f64::INFINITY, f64::min);
  let steep_left = lp > 0 && lowest(&line[..lp]) < lv * TAIL_DROP;
  let steep_right = lowest(&line[rp..]) < rv * TAIL_DROP;
  Some(UShape { left: lp, right: rp, steep_tails: steep_left && steep_right })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DonutShape {
  /// no U in at least one of the profiles
  Solid,
  /// a U, but narrower than a nucleus
  Small,
  /// a wide U whose flanks do not fall off, likely touching neighbours
  FlatTails,
  Donut { y_width: usize, x_width: usize },
}

/// Classify a cell from its smoothed vertical and horizontal profiles.
/// `centre` holds the detection's index on each line, see [`profile_centre`].
pub fn classify(line_y: &[f64], line_x: &[f64], centre: [usize; 2], nucleus_diameter: usize) -> DonutShape {
  let (uy, ux) = match (analyse_profile(line_y, centre[0]), analyse_profile(line_x, centre[1])) {
    (Some(uy), Some(ux)) => (uy, ux),
    _ => return DonutShape::Solid,
  };
  if uy.width() + ux.width() < 2 * nucleus_diameter {
    DonutShape::Small
  } else if !(uy.steep_tails && ux.steep_tails) {
    DonutShape::FlatTails
  } else {
    DonutShape::Donut { y_width: uy.width(), x_width: ux.width() }
  }
}

/// Size of the box used to grow a donut seed: the ring width minus the seed
/// dilation already applied, shrunk by 40%. Planar data keeps a depth of one,
/// volumes keep the applied z dilation. `None` when any side would be empty.
pub fn donut_dilation(y_width: usize, x_width: usize, first_dilation: [usize; 3], planar: bool) -> Option<[usize; 3]> {
  let shrink = |width: usize, applied: usize| -> Option<usize> {
    let d = width.checked_sub(applied)?;
    let d = d - (d as f64 * SAFETY_SHRINK) as usize;
    (d > 0).then_some(d)
  };
  let z = if planar { 1 } else { first_dilation[0] };
  let size = [z, shrink(y_width, first_dilation[1])?, shrink(x_width, first_dilation[2])?];
  (size[0] > 0).then_some(size)
}

////////////////////////////////////////////////////////////////////////////////
//                                PATCHES                                     //
////////////////////////////////////////////////////////////////////////////////

/// Analysis window around `point`, clipped to `shape`.
pub fn patch_box(point: [usize; 3], patch: [usize; 3], shape: [usize; 3]) -> BBox {
  let mut bbox = BBox { start: [0; 3], end: [1; 3] };
  for ax in 0..3 {
    if ax == 0 && shape[0] == 1 {
      continue;
    }
    let half = patch[ax] / 2;
    bbox.start[ax] = point[ax].saturating_sub(half);
    bbox.end[ax] = (point[ax] + half).min(shape[ax]).max(point[ax] + 1);
  }
  bbox
}

/// Vertical and horizontal intensity profiles through `point`, restricted to
/// `bbox`.
pub fn profiles(img: nd::ArrayView3<f64>, point: [usize; 3], bbox: &BBox) -> (Vec<f64>, Vec<f64>) {
  let [z, y, x] = point;
  let line_y = img.slice(nd::s![z, bbox.start[1]..bbox.end[1], x]).to_vec();
  let line_x = img.slice(nd::s![z, y, bbox.start[2]..bbox.end[2]]).to_vec();
  (line_y, line_x)
}

/// Index of `point` on the lines returned by [`profiles`]. Off the middle when
/// the window was clipped by the volume edge.
pub fn profile_centre(point: [usize; 3], bbox: &BBox) -> [usize; 2] {
  [point[1] - bbox.start[1], point[2] - bbox.start[2]]
}

/// Smoothing window for a patch side: an eighth of it, forced odd.
pub fn smoothing_window(side: usize) -> usize {
  let w = side / 8;
  w + (1 - w % 2)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ring_profile(n: usize, centre: usize, radius: f64) -> Vec<f64> {
    (0..n)
      .map(|i| {
        let d = (i as f64 - centre as f64).abs();
        10.0 + 100.0 * (-(d - radius).powi(2) / 8.0).exp()
      })
      .collect()
  }

  #[test]
  fn savgol_keeps_quadratics() {
    let line: Vec<f64> = (0..30).map(|i| 0.5 * (i as f64).powi(2) - 3.0 * i as f64 + 1.0).collect();
    let smooth = savgol_filter(&line, 7, 2);
    for (a, b) in line.iter().zip(&smooth) {
      assert!((a - b).abs() < 1e-6);
    }
    //Window longer than the signal
    assert_eq!(savgol_filter(&[1.0, 2.0], 15, 2), vec![1.0, 2.0]);
  }

  #[test]
  fn peaks_and_plateaus() {
    assert_eq!(find_peaks(&[0.0, 2.0, 0.0, 1.0, 1.0, 1.0, 0.0, 3.0]), vec![1, 4]);
    assert!(find_peaks(&[1.0, 1.0]).is_empty());
  }

  #[test]
  fn ring_is_a_donut() {
    let line = ring_profile(121, 60, 25.0);
    let u = analyse_profile(&line, 60).unwrap();
    assert_eq!((u.left, u.right), (35, 85));
    assert!(u.steep_tails);
    assert_eq!(classify(&line, &line, [60, 60], 20), DonutShape::Donut { y_width: 50, x_width: 50 });
    assert_eq!(classify(&line, &line, [60, 60], 60), DonutShape::Small);
  }

  #[test]
  fn clipped_ring_is_split_at_the_detection() {
    //The window was cut by the volume edge: the detection sits at 20 of 70
    let line = ring_profile(70, 20, 12.0);
    assert_eq!(analyse_profile(&line, line.len() / 2), None);
    let u = analyse_profile(&line, 20).unwrap();
    assert_eq!((u.left, u.right), (8, 32));
    assert!(u.steep_tails);

    let bbox = patch_box([0, 20, 50], [1, 100, 40], [1, 120, 120]);
    assert_eq!(profile_centre([0, 20, 50], &bbox), [20, 20]);
  }

  #[test]
  fn blob_is_solid() {
    let line: Vec<f64> = (0..121).map(|i| 100.0 * (-((i as f64 - 60.0).powi(2)) / 200.0).exp()).collect();
    assert_eq!(analyse_profile(&line, 60), None);
    assert_eq!(classify(&line, &line, [60, 60], 10), DonutShape::Solid);
  }

  #[test]
  fn dilation_shrinks_ring_width() {
    assert_eq!(donut_dilation(50, 40, [0, 5, 5], true), Some([1, 27, 21]));
    assert_eq!(donut_dilation(50, 40, [3, 5, 5], false), Some([3, 27, 21]));
    assert_eq!(donut_dilation(4, 40, [3, 5, 5], false), None);
  }

  #[test]
  fn windows_and_boxes() {
    assert_eq!(smoothing_window(120), 15);
    assert_eq!(smoothing_window(13), 1);
    assert_eq!(smoothing_window(64), 9);
    let b = patch_box([0, 5, 95], [13, 120, 120], [1, 100, 100]);
    assert_eq!(b.start, [0, 0, 35]);
    assert_eq!(b.end, [1, 65, 100]);
  }
}
