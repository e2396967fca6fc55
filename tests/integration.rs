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


use ndarray as nd;
use rustronomy_cellseg::prelude::*;

////////////////////////////////////////////////////////////////////////////////
//                                 FIXTURES                                   //
////////////////////////////////////////////////////////////////////////////////

/// A rectangle of foreground split in two by a contour column at x = 15.
fn touching_pair(depth: usize) -> ProbabilityVolume {
  let mut data = ProbabilityVolume::zeros((depth, 20, 30, 2));
  data.slice_mut(nd::s![.., 4..16, 3..27, 0]).fill(0.9);
  data.slice_mut(nd::s![.., 4..16, 15, 1]).fill(0.8);
  data
}

fn disk(img: &mut Labels, centre: (usize, usize), r: f64, label: usize) {
  for ((_, y, x), v) in img.indexed_iter_mut() {
    let d = ((y as f64 - centre.0 as f64).powi(2) + (x as f64 - centre.1 as f64).powi(2)).sqrt();
    if d <= r {
      *v = label;
    }
  }
}

/// Two annotated rectangles with a contour on their rims.
fn annotated_sample() -> CalibrationSample {
  let mut instances = Labels::zeros((1, 12, 20));
  instances.slice_mut(nd::s![.., 2..10, 2..9]).fill(1);
  instances.slice_mut(nd::s![.., 2..10, 11..18]).fill(2);
  let mut prediction = ProbabilityVolume::zeros((1, 12, 20, 2));
  for ((z, y, x), &l) in instances.indexed_iter() {
    if l != 0 {
      prediction[[z, y, x, 0]] = 0.9;
      let rim = y == 2 || y == 9 || x == 2 || x == 8 || x == 11 || x == 17;
      prediction[[z, y, x, 1]] = if rim { 0.8 } else { 0.05 };
    }
  }
  CalibrationSample { prediction, instances, distance: None }
}

fn temp_dir(name: &str) -> std::path::PathBuf {
  std::env::temp_dir().join(format!("cellseg-{name}-{}", std::process::id()))
}

////////////////////////////////////////////////////////////////////////////////
//                                 PIPELINE                                   //
////////////////////////////////////////////////////////////////////////////////

#[test]
fn contour_splits_touching_cells() {
  let data = touching_pair(1);
  let segmenter = SegmenterBuilder::new(ChannelMode::BC).build().unwrap();
  let (map, seeds) = segmenter.segment_with_seeds(&data).unwrap();
  let labels = map.to_labels();

  assert_eq!(map.dtype_name(), "uint8");
  assert_eq!(map.instance_count(), 2);
  assert_eq!(seeds.seed_map.iter().copied().max(), Some(2));

  //Left and right half end up in different instances
  let (left, right) = (labels[[0, 10, 5]], labels[[0, 10, 25]]);
  assert!(left != 0 && right != 0 && left != right);

  //The whole foreground is claimed, nothing outside of it
  let fg = data.index_axis(nd::Axis(3), 0).mapv(|v| v > 0.3);
  nd::Zip::from(&labels).and(&fg).for_each(|&l, &f| assert_eq!(l != 0, f));
}

#[test]
fn volumes_segment_like_their_slices() {
  let data = touching_pair(3);
  let map = watershed_by_channels(&data, ChannelMode::BC, ThresholdSet::default()).unwrap();
  assert_eq!(map.shape(), &[3, 20, 30]);
  assert_eq!(map.instance_count(), 2);
  let labels = map.to_labels();
  assert_eq!(labels[[0, 10, 5]], labels[[2, 10, 5]]);
  assert_ne!(labels[[1, 10, 5]], labels[[1, 10, 25]]);
}

#[test]
fn point_channel_seeds_split_a_blob() {
  let mut data = ProbabilityVolume::zeros((1, 20, 30, 2));
  data.slice_mut(nd::s![0, 4..16, 3..27, 0]).fill(0.9);
  data.slice_mut(nd::s![0, 9..11, 7..9, 1]).fill(0.9);
  data.slice_mut(nd::s![0, 9..11, 21..23, 1]).fill(0.9);
  let map = watershed_by_channels(&data, ChannelMode::BP, ThresholdSet::default()).unwrap();
  assert_eq!(map.instance_count(), 2);
  assert_ne!(map.get([0, 10, 4]), map.get([0, 10, 26]));
}

#[test]
fn missing_channels_are_reported() {
  let data = ProbabilityVolume::zeros((1, 8, 8, 2));
  let err = watershed_by_channels(&data, ChannelMode::BCD, ThresholdSet::default()).unwrap_err();
  assert!(matches!(err, SegError::ChannelCount { needed: 3, found: 2, .. }));
}

#[test]
fn diagnostics_are_written() {
  let dir = temp_dir("pipeline");
  let segmenter = SegmenterBuilder::new(ChannelMode::BC).set_diagnostics_dir(&dir).build().unwrap();
  segmenter.segment(&touching_pair(1)).unwrap();
  assert!(dir.join("seed_map.npy").exists());
  assert!(dir.join("foreground.npy").exists());
  let _ = std::fs::remove_dir_all(&dir);
}

////////////////////////////////////////////////////////////////////////////////
//                           CALIBRATION + ENSEMBLE                           //
////////////////////////////////////////////////////////////////////////////////

#[test]
fn calibrated_thresholds_reproduce_the_annotation() {
  let sample = annotated_sample();
  let cal = CalibratorBuilder::new(ChannelMode::BC).build().unwrap().calibrate(&[sample.clone()]).unwrap();
  assert_eq!(cal.samples_used, 1);
  assert!(cal.th3.mean < 0.9);
  assert!(cal.thresholds.th2 > 0.05 && cal.thresholds.th2 < 0.8);

  //Seed threshold picked by hand, separation and foreground from calibration
  let thresholds = ThresholdSet { th1: 0.5, ..cal.thresholds };
  let map = watershed_by_channels(&sample.prediction, ChannelMode::BC, thresholds).unwrap();
  assert_eq!(map.instance_count(), 2);
  let labels = map.to_labels();
  nd::Zip::from(&labels).and(&sample.instances).for_each(|&l, &gt| assert_eq!(l != 0, gt != 0));
}

#[test]
fn ensembled_identity_model_changes_nothing() {
  fn identity(batch: nd::ArrayView5<f32>) -> SegResult<ModelOutput> {
    Ok(ModelOutput::Single(batch.to_owned()))
  }
  let data = touching_pair(1);
  let ensemble = EnsembleBuilder::new().set_batch_size(4).build().unwrap();
  assert_eq!(ensemble.n_variants(&data), 8);
  let averaged = ensemble.predict(&identity, &data).unwrap();
  assert_eq!(averaged.shape(), data.shape());

  let segmenter = SegmenterBuilder::new(ChannelMode::BC).build().unwrap();
  let direct = segmenter.segment(&data).unwrap().to_labels();
  let via_ensemble = segmenter.segment(&averaged).unwrap().to_labels();
  assert_eq!(direct, via_ensemble);
}

#[test]
fn model_errors_propagate() {
  fn broken(_: nd::ArrayView5<f32>) -> SegResult<ModelOutput> {
    Ok(ModelOutput::Multi(Vec::new()))
  }
  let ensemble = EnsembleBuilder::new().build().unwrap();
  assert!(matches!(ensemble.predict(&broken, &touching_pair(1)), Err(SegError::Model(_))));
}

////////////////////////////////////////////////////////////////////////////////
//                                 CLEAN-UP                                   //
////////////////////////////////////////////////////////////////////////////////

#[test]
fn cleanup_chain_keeps_round_cells() {
  //Two round cells and a thin streak of foreground
  let mut truth = Labels::zeros((1, 48, 80));
  disk(&mut truth, (20, 20), 14.0, 1);
  disk(&mut truth, (20, 56), 14.0, 2);
  truth.slice_mut(nd::s![0, 44, 5..75]).fill(3);
  let mut data = ProbabilityVolume::zeros((1, 48, 80, 2));
  data.index_axis_mut(nd::Axis(3), 0).assign(&truth.mapv(|l| if l != 0 { 0.9 } else { 0.0 }));

  let labels = SegmenterBuilder::new(ChannelMode::BC).build().unwrap().segment(&data).unwrap().to_labels();
  assert_eq!(labels.iter().copied().max(), Some(3));

  //(1) nothing is small, the streak is not round
  let labels = remove_small_objects(&labels, 20);
  let (round, reports) = filter_by_circularity(&labels, &Resolution::default(), None, 0.7);
  assert_eq!(reports.len(), 3);
  let strange: Vec<_> = reports.iter().filter(|r| r.verdict == Verdict::Strange).collect();
  assert_eq!(strange.len(), 1);
  assert_eq!(strange[0].voxels, 70);
  assert_eq!(round[[0, 44, 40]], 0);

  //(2) the freed foreground goes to the nearest cell
  let filler = VoronoiBuilder::perimeter().set_threshold(0.5).build().unwrap();
  let filled = filler.fill(&round, &data).unwrap();
  assert_ne!(filled[[0, 44, 40]], 0);
  assert_eq!(filled[[0, 20, 20]], round[[0, 20, 20]]);
  assert_eq!(filled[[0, 20, 56]], round[[0, 20, 56]]);
  assert!(filled.iter().all(|&l| l == 0 || l == round[[0, 20, 20]] || l == round[[0, 20, 56]]));
}

#[test]
fn blob_repair_after_segmentation() {
  //A large cell with a small cell stuck inside it
  let mut data = ProbabilityVolume::zeros((1, 40, 40, 2));
  data.slice_mut(nd::s![0, 5..35, 5..35, 0]).fill(0.9);
  data.slice_mut(nd::s![0, 17..23, 17..23, 0]).fill(0.0);
  data.slice_mut(nd::s![0, 18..22, 18..22, 0]).fill(0.9);
  let labels = SegmenterBuilder::new(ChannelMode::BC).build().unwrap().segment(&data).unwrap().to_labels();
  assert_eq!(labels.iter().copied().max(), Some(2));

  let repaired = repair_large_blobs(&labels, 500);
  let outer = repaired[[0, 6, 6]];
  assert_ne!(outer, 0);
  assert_eq!(repaired[[0, 20, 20]], outer);
  assert_eq!(repaired[[0, 17, 17]], outer);
}
