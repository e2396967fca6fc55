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

//! Clean-up passes over finished instance label maps.

use std::collections::BTreeMap;

use ndarray as nd;
use rayon::prelude::*;

pub use crate::measure::remove_small_objects;
use crate::measure::{circularity, distinct_values, perimeter_2d, regionprops, shifted, Connectivity, Region};
use crate::morphology::fill_holes_2d;
use crate::volume::{is_planar, Labels, Resolution, BACKGROUND};

////////////////////////////////////////////////////////////////////////////////
//                               BLOB REPAIR                                  //
////////////////////////////////////////////////////////////////////////////////

/// Labels touching `label` inside `patch`, in order of discovery.
fn touching_labels(patch: nd::ArrayView3<usize>, label: usize) -> Vec<usize> {
  let shape = [patch.shape()[0], patch.shape()[1], patch.shape()[2]];
  let offsets = Connectivity::Full.offsets(is_planar(&shape));
  let mut found = Vec::new();
  for ((z, y, x), &l) in patch.indexed_iter() {
    if l != label {
      continue;
    }
    for &off in &offsets {
      if let Some(idx) = shifted([z, y, x], off, shape) {
        let n = patch[idx];
        if n != label && n != BACKGROUND && !found.contains(&n) {
          found.push(n);
        }
      }
    }
  }
  found
}

/// Repair instances of at least `size_th` voxels.
///
/// Every instance touching a large one (full connectivity, inside the large
/// instance's bounding box) is merged into it when its own bounding box lies
/// completely inside that of the large instance. Afterwards the holes of the
/// large instance are filled slice by slice; filled voxels take its label.
/// Bounding boxes are measured once, before any merge.
pub fn repair_large_blobs(labels: &Labels, size_th: usize) -> Labels {
  let props: BTreeMap<usize, Region> = regionprops(labels.view()).into_iter().map(|r| (r.label, r)).collect();
  let mut img = labels.clone();
  let mut merged = 0;

  for region in props.values().filter(|r| r.area >= size_th) {
    let l = region.label;

    //(1) merge contained neighbours
    let patch = img.slice(region.bbox.slice());
    if distinct_values(patch) > 2 {
      let neighbours = touching_labels(patch, l);
      for n in neighbours {
        let contained = props.get(&n).map_or(false, |nr| region.bbox.contains(&nr.bbox));
        if contained {
          img.par_mapv_inplace(|v| if v == n { l } else { v });
          merged += 1;
        }
      }
    }

    //(2) fill holes slice by slice
    let mut patch = img.slice_mut(region.bbox.slice());
    for mut plane in patch.axis_iter_mut(nd::Axis(0)) {
      let filled = fill_holes_2d(plane.mapv(|v| v == l).view());
      nd::Zip::from(&mut plane).and(&filled).for_each(|v, &f| {
        if f {
          *v = l
        }
      });
    }
  }

  log::info!("merged {merged} instances into blobs of at least {size_th} voxels");
  img
}

////////////////////////////////////////////////////////////////////////////////
//                           CIRCULARITY FILTER                               //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  Correct,
  Strange,
}

/// Measurements of a single instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceReport {
  pub label: usize,
  pub voxels: usize,
  /// area (planar) or volume, in physical units
  pub size: f64,
  /// mean circularity over the representative slices
  pub circularity: f64,
  /// largest bounding box extent
  pub diameter: usize,
  pub verdict: Verdict,
}

/// Representative slices of an instance: the slice of its detection
/// coordinate, or its central slice and the direct neighbours inside the
/// bounding box.
fn representative_slices(region: &Region, detection_z: Option<usize>) -> Vec<usize> {
  if let Some(z) = detection_z {
    return vec![z];
  }
  let (start, end) = (region.bbox.start[0], region.bbox.end[0]);
  let central = (start + end) / 2;
  let mut slices = Vec::with_capacity(3);
  if central >= start + 1 {
    slices.push(central - 1);
  }
  slices.push(central);
  if central + 1 < end {
    slices.push(central + 1);
  }
  slices
}

fn mean_circularity(labels: &Labels, region: &Region, slices: &[usize]) -> f64 {
  let (b0, b1) = (region.bbox.start, region.bbox.end);
  let (mut total, mut count) = (0.0, 0usize);
  for &z in slices {
    if z >= labels.shape()[0] {
      continue;
    }
    let mask = labels.slice(nd::s![z, b0[1]..b1[1], b0[2]..b1[2]]).mapv(|v| v == region.label);
    let area = mask.iter().filter(|&&m| m).count();
    if area == 0 {
      continue;
    }
    total += circularity(area as f64, perimeter_2d(mask.view()));
    count += 1;
  }
  if count == 0 {
    0.0
  } else {
    total / count as f64
  }
}

/// Drop instances whose circularity does not exceed `threshold`.
///
/// Circularity is measured on representative slices only (see
/// [`InstanceReport`]). When `coords` is given, an instance is measured on the
/// slice of the first detection coordinate that falls inside it. Returns the
/// filtered labels and one report per instance, sorted by label.
pub fn filter_by_circularity(
  labels: &Labels,
  resolution: &Resolution,
  coords: Option<&[[usize; 3]]>,
  threshold: f64,
) -> (Labels, Vec<InstanceReport>) {
  let planar = is_planar(labels.shape());
  let regions = regionprops(labels.view());
  log::info!("{} instances found before circularity filtering", regions.len());

  //(1) slice of the detection coordinate of every instance
  let mut detection_z: BTreeMap<usize, usize> = BTreeMap::new();
  for c in coords.unwrap_or(&[]) {
    match labels.get(*c) {
      Some(&l) if l != BACKGROUND => {
        detection_z.entry(l).or_insert(c[0]);
      }
      _ => log::debug!("detection {c:?} does not hit an instance"),
    }
  }

  //(2) measure every instance
  let reports: Vec<InstanceReport> = regions
    .par_iter()
    .map(|region| {
      let slices = if planar { vec![0] } else { representative_slices(region, detection_z.get(&region.label).copied()) };
      let circ = mean_circularity(labels, region, &slices);
      InstanceReport {
        label: region.label,
        voxels: region.area,
        size: region.area as f64 * resolution.voxel_size(planar),
        circularity: circ,
        diameter: region.bbox.diameter(planar),
        verdict: if circ > threshold { Verdict::Correct } else { Verdict::Strange },
      }
    })
    .collect();

  //(3) strange instances become background
  let strange: Vec<usize> = reports.iter().filter(|r| r.verdict == Verdict::Strange).map(|r| r.label).collect();
  let mut out = labels.clone();
  if !strange.is_empty() {
    out.par_mapv_inplace(|v| if strange.binary_search(&v).is_ok() { BACKGROUND } else { v });
  }
  log::info!(
    "removed {} instances by circularity, {} instances left",
    strange.len(),
    reports.len() - strange.len()
  );

  (out, reports)
}
