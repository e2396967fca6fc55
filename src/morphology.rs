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

//! Morphological operators on `(z, y, x)` volumes.
//!
//! All operators ignore neighbours that fall outside the volume. For erosion
//! this means the volume border does not eat into objects that touch it.

use std::collections::VecDeque;

use ndarray as nd;
use rayon::prelude::*;

/// Structuring element, stored as a list of `(dz, dy, dx)` offsets relative to
/// the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint {
  offsets: Vec<[isize; 3]>,
}

impl Footprint {
  /// In-plane disk: all `(0, dy, dx)` with `dy² + dx² <= r²`.
  pub fn disk(radius: usize) -> Self {
    let r = radius as isize;
    let offsets = (-r..=r)
      .flat_map(|dy| (-r..=r).map(move |dx| [0, dy, dx]))
      .filter(|&[_, dy, dx]| dy * dy + dx * dx <= r * r)
      .collect();
    Footprint { offsets }
  }

  /// Solid ball: all offsets with `dz² + dy² + dx² <= r²`.
  pub fn ball(radius: usize) -> Self {
    let r = radius as isize;
    let offsets = (-r..=r)
      .flat_map(|dz| (-r..=r).flat_map(move |dy| (-r..=r).map(move |dx| [dz, dy, dx])))
      .filter(|&[dz, dy, dx]| dz * dz + dy * dy + dx * dx <= r * r)
      .collect();
    Footprint { offsets }
  }

  /// A disk for planar data, a ball otherwise.
  pub fn round(radius: usize, planar: bool) -> Self {
    if planar {
      Footprint::disk(radius)
    } else {
      Footprint::ball(radius)
    }
  }

  /// Origin plus its face neighbours (4- or 6-connectivity).
  pub fn cross(planar: bool) -> Self {
    let mut offsets = vec![[0, 0, 0], [0, 1, 0], [0, -1, 0], [0, 0, 1], [0, 0, -1]];
    if !planar {
      offsets.extend([[1, 0, 0], [-1, 0, 0]]);
    }
    Footprint { offsets }
  }

  /// Full 3x3 (or 3x3x3) neighbourhood (8- or 26-connectivity).
  pub fn full(planar: bool) -> Self {
    let zr: isize = if planar { 0 } else { 1 };
    let offsets = (-zr..=zr)
      .flat_map(|dz| (-1..=1).flat_map(move |dy| (-1..=1).map(move |dx| [dz, dy, dx])))
      .collect();
    Footprint { offsets }
  }

  /// Box of `(sz, sy, sx)` voxels. Even sizes put the extra voxel on the
  /// negative side of the origin. A zero size along an axis collapses it.
  pub fn cuboid(size: [usize; 3]) -> Self {
    let range = |n: usize| -> std::ops::Range<isize> {
      if n == 0 {
        0..1
      } else {
        let lo = -((n / 2) as isize);
        lo..lo + n as isize
      }
    };
    let (rz, ry, rx) = (range(size[0]), range(size[1]), range(size[2]));
    let offsets = rz
      .flat_map(|dz| {
        let rx = rx.clone();
        ry.clone().flat_map(move |dy| rx.clone().map(move |dx| [dz, dy, dx]))
      })
      .collect();
    Footprint { offsets }
  }

  pub fn offsets(&self) -> &[[isize; 3]] {
    &self.offsets
  }

  pub fn len(&self) -> usize {
    self.offsets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.offsets.is_empty()
  }

  /// Point-reflected footprint, needed for dilation with asymmetric elements.
  pub fn reflect(&self) -> Self {
    Footprint { offsets: self.offsets.iter().map(|&[z, y, x]| [-z, -y, -x]).collect() }
  }
}

/// Core neighbourhood fold. For every voxel, `step` is folded over the values
/// of all voxels covered by the footprint. Voxels outside the volume take the
/// value `outside`, or are skipped when it is `None`.
fn fold_footprint<T, U, F>(
  input: nd::ArrayView3<T>,
  fp: &Footprint,
  init: U,
  outside: Option<T>,
  step: F,
) -> nd::Array3<U>
where
  T: Copy + Send + Sync,
  U: Copy + Send + Sync,
  F: Fn(U, T) -> U + Sync,
{
  let (nz, ny, nx) = input.dim();
  let (nz, ny, nx) = (nz as isize, ny as isize, nx as isize);
  let mut out = nd::Array3::from_elem(input.raw_dim(), init);

  out.axis_iter_mut(nd::Axis(0)).into_par_iter().enumerate().for_each(|(z, mut slice)| {
    for ((y, x), px) in slice.indexed_iter_mut() {
      let mut acc = init;
      for &[dz, dy, dx] in fp.offsets() {
        let (zz, yy, xx) = (z as isize + dz, y as isize + dy, x as isize + dx);
        if zz < 0 || yy < 0 || xx < 0 || zz >= nz || yy >= ny || xx >= nx {
          if let Some(v) = outside {
            acc = step(acc, v);
          }
          continue;
        }
        acc = step(acc, input[[zz as usize, yy as usize, xx as usize]]);
      }
      *px = acc;
    }
  });

  out
}

/// What lies beyond the edge of the volume during binary erosion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Border {
  /// Outside voxels are ignored, so objects are never eaten away at the edge.
  #[default]
  Ignore,
  /// Outside voxels are background, so objects touching the edge erode there.
  Background,
}

pub fn binary_dilation(mask: nd::ArrayView3<bool>, fp: &Footprint) -> nd::Array3<bool> {
  fold_footprint(mask, &fp.reflect(), false, None, |acc, v| acc || v)
}

pub fn binary_erosion(mask: nd::ArrayView3<bool>, fp: &Footprint) -> nd::Array3<bool> {
  binary_erosion_border(mask, fp, Border::Ignore)
}

pub fn binary_erosion_border(mask: nd::ArrayView3<bool>, fp: &Footprint, border: Border) -> nd::Array3<bool> {
  let outside = match border {
    Border::Ignore => None,
    Border::Background => Some(false),
  };
  fold_footprint(mask, fp, true, outside, |acc, v| acc && v)
}

/// Repeated dilation, like `iterations=n` in most image libraries.
pub fn binary_dilation_iter(
  mask: nd::ArrayView3<bool>,
  fp: &Footprint,
  iterations: usize,
) -> nd::Array3<bool> {
  let mut out = mask.to_owned();
  for _ in 0..iterations {
    out = binary_dilation(out.view(), fp);
  }
  out
}

pub fn binary_erosion_iter(
  mask: nd::ArrayView3<bool>,
  fp: &Footprint,
  iterations: usize,
  border: Border,
) -> nd::Array3<bool> {
  let mut out = mask.to_owned();
  for _ in 0..iterations {
    out = binary_erosion_border(out.view(), fp, border);
  }
  out
}

/// Dilation followed by erosion with the same footprint.
pub fn binary_closing(mask: nd::ArrayView3<bool>, fp: &Footprint) -> nd::Array3<bool> {
  binary_erosion(binary_dilation(mask, fp).view(), fp)
}

/// Grey-value dilation (local maximum) of a label volume.
pub fn grey_dilation(labels: nd::ArrayView3<usize>, fp: &Footprint) -> nd::Array3<usize> {
  fold_footprint(labels, &fp.reflect(), 0usize, None, |acc, v| acc.max(v))
}

/// Grey-value erosion (local minimum) of a label volume.
pub fn grey_erosion(labels: nd::ArrayView3<usize>, fp: &Footprint) -> nd::Array3<usize> {
  fold_footprint(labels, fp, usize::MAX, None, |acc, v| acc.min(v))
}

/// Morphological rank gradient: local maximum minus local minimum.
pub fn rank_gradient(img: nd::ArrayView3<u8>, fp: &Footprint) -> nd::Array3<u8> {
  fold_footprint(img, fp, (u8::MAX, u8::MIN), None, |(lo, hi), v| (lo.min(v), hi.max(v)))
    .mapv(|(lo, hi)| hi.saturating_sub(lo))
}

/// Fill the holes of a planar mask: background regions that cannot be reached
/// from the image border through 4-connected background pixels.
pub fn fill_holes_2d(mask: nd::ArrayView2<bool>) -> nd::Array2<bool> {
  let (ny, nx) = mask.dim();
  let mut outside = nd::Array2::<bool>::from_elem((ny, nx), false);
  let mut queue = VecDeque::new();

  //(1) Seed the flood with every background pixel on the border
  for y in 0..ny {
    for x in 0..nx {
      let border = y == 0 || x == 0 || y + 1 == ny || x + 1 == nx;
      if border && !mask[[y, x]] && !outside[[y, x]] {
        outside[[y, x]] = true;
        queue.push_back((y, x));
      }
    }
  }

  //(2) Flood the background that is connected to the border
  while let Some((y, x)) = queue.pop_front() {
    for (yy, xx) in crate::neighbours_4con(&(y, x)) {
      if yy < ny && xx < nx && !mask[[yy, xx]] && !outside[[yy, xx]] {
        outside[[yy, xx]] = true;
        queue.push_back((yy, xx));
      }
    }
  }

  //(3) Everything that is not outside is object or hole
  outside.mapv(|o| !o)
}

/// Median filter applied to every z-slice independently, with a square window
/// of `size` pixels (forced odd). Edges are handled by clamping coordinates.
pub fn median_filter_slices(vol: nd::ArrayView3<f32>, size: usize) -> nd::Array3<f32> {
  let size = if size % 2 == 0 { size + 1 } else { size };
  let half = (size / 2) as isize;
  let (_, ny, nx) = vol.dim();
  let mut out = nd::Array3::<f32>::zeros(vol.raw_dim());

  out
    .axis_iter_mut(nd::Axis(0))
    .into_par_iter()
    .zip(vol.axis_iter(nd::Axis(0)))
    .for_each(|(mut dst, src)| {
      let mut window = Vec::with_capacity(size * size);
      for ((y, x), px) in dst.indexed_iter_mut() {
        window.clear();
        for dy in -half..=half {
          for dx in -half..=half {
            let yy = (y as isize + dy).clamp(0, ny as isize - 1) as usize;
            let xx = (x as isize + dx).clamp(0, nx as isize - 1) as usize;
            window.push(src[[yy, xx]]);
          }
        }
        window.sort_by(|a, b| a.total_cmp(b));
        *px = window[window.len() / 2];
      }
    });

  out
}
