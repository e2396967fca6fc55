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

//! Threshold calibration against annotated validation samples.
//!
//! Per sample, the foreground cut-offs (`th3`, `th5`) maximise the overlap
//! with the annotated foreground. With `th3` fixed, `th2` is swept until the
//! number of separated objects matches the annotation. Finally `th1` (and `th4`
//! for `BCD`) are swept the same way with a stricter tie policy. Object counts
//! always include background, on both sides of the comparison.
//!
//! The per-sample picks are aggregated as mean and sample standard deviation.

use ndarray as nd;
use rayon::prelude::*;

use crate::ensemble::{predict_one, EnsemblePredictor, Predictor};
use crate::error::{SegError, SegResult};
use crate::measure::{distinct_values, jaccard_index, label_mask, remove_small_objects, Connectivity};
use crate::volume::{channel, spatial_shape, threshold_channel, ChannelMode, Labels, ProbabilityVolume, ThresholdSet};

////////////////////////////////////////////////////////////////////////////////
//                                  GRIDS                                     //
////////////////////////////////////////////////////////////////////////////////

/// Candidates for probability thresholds: a few tiny values, then 0.1 to 0.95
/// in steps of 0.05.
pub fn probability_grid() -> Vec<f32> {
  let mut grid = vec![1e-6, 5e-6, 1e-5, 5e-5, 1e-4, 5e-4, 1e-3, 5e-3, 1e-2, 5e-2];
  grid.extend((0..18).map(|i| (((0.1 + 0.05 * i as f64) * 1000.0).round() / 1000.0) as f32));
  grid
}

/// Candidates for distance thresholds: 0.1 up to (not including) 110% of the
/// largest annotated distance, in steps of 0.05.
pub fn distance_grid(max_distance: f32) -> Vec<f32> {
  let stop = max_distance as f64 * 1.1;
  (0..)
    .map(|i| 0.1 + 0.05 * i as f64)
    .take_while(|&v| v < stop)
    .map(|v| v as f32)
    .collect()
}

////////////////////////////////////////////////////////////////////////////////
//                               TIE RULES                                    //
////////////////////////////////////////////////////////////////////////////////

/// Outcome of a count-matching sweep: the position of the recorded best
/// candidate (if any was recorded) and the position finally chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepChoice {
  pub best: Option<usize>,
  pub optimum: usize,
}

/// Separation sweep (`th2`). Any strict improvement of `|count - target|`
/// resets the tie run; every candidate after which the minimum equals the
/// previous difference extends it. The optimum moves half the run length past
/// the best position, or two positions for runs of ten and longer.
pub fn separation_choice(counts: &[usize], target: usize) -> SweepChoice {
  let mut min_diff = usize::MAX;
  let mut last = 0usize;
  let mut repeat = 0usize;
  let mut pos = None;

  for (k, &count) in counts.iter().enumerate() {
    let diff = count.abs_diff(target);
    if diff < min_diff {
      min_diff = diff;
      pos = Some(k);
      repeat = 0;
    }
    if min_diff == last {
      repeat += 1;
    }
    last = diff;
  }

  let shift = if repeat < 10 { repeat / 2 } else { 2 };
  SweepChoice { best: pos, optimum: clamp_position(pos, shift, counts.len()) }
}

/// Seed sweep (`th1`, `th4`). A candidate only becomes the new best when its
/// difference does not exceed the minimum, differs from the previous
/// difference, and fewer than four ties have been counted. Ties only count
/// while the run that started at the best position is unbroken. The optimum
/// moves the full run length past the best position.
pub fn seed_choice(counts: &[usize], target: usize) -> SweepChoice {
  let mut min_diff = usize::MAX;
  let mut last = 0usize;
  let mut repeat = 0usize;
  let mut pos = None;
  let mut in_row = false;

  for (k, &count) in counts.iter().enumerate() {
    let diff = count.abs_diff(target);
    if diff <= min_diff && repeat < 4 && diff != last {
      min_diff = diff;
      pos = Some(k);
      repeat = 0;
      in_row = true;
    }
    if diff == last && diff == min_diff && in_row {
      repeat += 1;
    } else if pos != Some(k) {
      in_row = false;
    }
    last = diff;
  }

  SweepChoice { best: pos, optimum: clamp_position(pos, repeat, counts.len()) }
}

/// Without a recorded best the choice falls back to the last candidate.
fn clamp_position(pos: Option<usize>, shift: usize, len: usize) -> usize {
  let last = len.saturating_sub(1);
  match pos {
    Some(p) => (p + shift).min(last),
    None => last,
  }
}

/// Position of the first maximum overlap score.
pub fn best_overlap(scores: &[f64]) -> Option<usize> {
  let mut best = None;
  let mut max = -1.0;
  for (j, &s) in scores.iter().enumerate() {
    if s > max {
      max = s;
      best = Some(j);
    }
  }
  best
}

////////////////////////////////////////////////////////////////////////////////
//                              DATA TYPES                                    //
////////////////////////////////////////////////////////////////////////////////

/// A network prediction paired with its annotation.
#[derive(Debug, Clone)]
pub struct CalibrationSample {
  pub prediction: ProbabilityVolume,
  pub instances: Labels,
  /// Annotated distance channel, required for `BCD`.
  pub distance: Option<nd::Array3<f32>>,
}

/// A raw image paired with its annotation, see [`Calibrator::calibrate_with_model`].
#[derive(Debug, Clone)]
pub struct CalibrationImage {
  pub image: ProbabilityVolume,
  pub instances: Labels,
  pub distance: Option<nd::Array3<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Estimate {
  pub mean: f32,
  pub std: f32,
}

impl Estimate {
  fn from_values(values: &[f32]) -> Self {
    let n = values.len();
    if n == 0 {
      return Estimate::default();
    }
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let std = if n > 1 {
      let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
      var.sqrt()
    } else {
      0.0
    };
    Estimate { mean: mean as f32, std: std as f32 }
  }
}

/// Score of every candidate for every usable sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCurve {
  pub name: &'static str,
  pub grid: Vec<f32>,
  pub per_sample: Vec<Vec<f64>>,
  /// Mean annotated object count, for count curves.
  pub ideal: Option<f64>,
}

impl ScoreCurve {
  /// Mean and population standard deviation per candidate.
  pub fn mean_std(&self) -> Vec<(f64, f64)> {
    (0..self.grid.len())
      .map(|j| {
        let col: Vec<f64> = self.per_sample.iter().filter_map(|s| s.get(j).copied()).collect();
        let n = col.len().max(1) as f64;
        let mean = col.iter().sum::<f64>() / n;
        let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
      })
      .collect()
  }
}

#[derive(Debug, Clone)]
pub struct Calibration {
  /// Thresholds to use for segmentation.
  pub thresholds: ThresholdSet,
  pub th1_best: Estimate,
  pub th1_opt: Estimate,
  pub th2_best: Estimate,
  pub th2_opt: Estimate,
  pub th3: Estimate,
  pub th4_best: Option<Estimate>,
  pub th4_opt: Option<Estimate>,
  pub th5: Option<Estimate>,
  /// Mean number of distinct values (background included) over all samples.
  pub ideal_objects: f64,
  pub samples_used: usize,
  pub samples_skipped: usize,
  pub curves: Vec<ScoreCurve>,
}

#[derive(Debug, Clone)]
struct SampleResult {
  th1_best: f32,
  th1_opt: f32,
  th2_best: f32,
  th2_opt: f32,
  th3: f32,
  th4: Option<(f32, f32)>,
  th5: Option<f32>,
  th1_counts: Vec<f64>,
  th2_counts: Vec<f64>,
  th3_scores: Vec<f64>,
  th4_counts: Vec<f64>,
  th5_scores: Vec<f64>,
}

/// Zero every channel outside `mask`. A mask of depth one is applied to every
/// slice.
pub fn apply_binary_mask(data: &mut ProbabilityVolume, mask: nd::ArrayView3<bool>) -> SegResult<()> {
  let [nz, ny, nx] = spatial_shape(data);
  let (mz, my, mx) = mask.dim();
  if (my, mx) != (ny, nx) || (mz != nz && mz != 1) {
    return Err(SegError::shape("binary mask", mask.shape(), &[nz, ny, nx]));
  }
  let mask = mask.broadcast((nz, ny, nx)).ok_or_else(|| SegError::shape("binary mask", &[mz, my, mx], &[nz, ny, nx]))?;
  for mut ch in data.axis_iter_mut(nd::Axis(3)) {
    nd::Zip::from(&mut ch).and(&mask).par_for_each(|v, &m| {
      if !m {
        *v = 0.0
      }
    });
  }
  Ok(())
}

////////////////////////////////////////////////////////////////////////////////
//                               CALIBRATOR                                   //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct CalibratorBuilder {
  #[cfg(feature = "plots")]
  chart_path: Option<std::path::PathBuf>,
  mode: ChannelMode,
  min_object_size: usize,
  use_minimum: bool,
  binary_mask: Option<nd::Array3<bool>>,
  grid: Option<Vec<f32>>,
}

impl CalibratorBuilder {
  pub fn new(mode: ChannelMode) -> Self {
    CalibratorBuilder {
      #[cfg(feature = "plots")]
      chart_path: None,
      mode,
      min_object_size: 5,
      use_minimum: false,
      binary_mask: None,
      grid: None,
    }
  }

  /// Objects smaller than this are dropped from the annotation and from the
  /// separated seeds of the `th2` sweep.
  pub fn set_min_object_size(mut self, min_size: usize) -> Self {
    self.min_object_size = min_size;
    self
  }

  /// Report the lowest per-sample best `th1`/`th4` instead of the mean
  /// optimum.
  pub fn set_use_minimum(mut self, use_minimum: bool) -> Self {
    self.use_minimum = use_minimum;
    self
  }

  pub fn set_binary_mask(mut self, mask: nd::Array3<bool>) -> Self {
    self.binary_mask = Some(mask);
    self
  }

  #[cfg(feature = "plots")]
  /// Draw score-vs-threshold charts into `path`. Only available with the
  /// `plots` feature gate enabled.
  pub fn set_chart_folder(mut self, path: &std::path::Path) -> Self {
    self.chart_path = Some(path.to_path_buf());
    self
  }

  /// Replace the probability candidates.
  pub fn set_grid(mut self, grid: Vec<f32>) -> Self {
    self.grid = Some(grid);
    self
  }

  pub fn build(self) -> SegResult<Calibrator> {
    if !matches!(self.mode, ChannelMode::BC | ChannelMode::BCM | ChannelMode::BCD) {
      return Err(SegError::InvalidConfig(format!(
        "threshold calibration supports BC, BCM and BCD, not {}",
        self.mode
      )));
    }
    let grid = self.grid.unwrap_or_else(probability_grid);
    if grid.is_empty() || grid.iter().any(|t| !t.is_finite()) {
      return Err(SegError::InvalidConfig("threshold grid has to be non-empty and finite".into()));
    }
    Ok(Calibrator {
      #[cfg(feature = "plots")]
      chart_path: self.chart_path,
      mode: self.mode,
      min_object_size: self.min_object_size,
      use_minimum: self.use_minimum,
      binary_mask: self.binary_mask,
      grid,
    })
  }
}

#[derive(Debug, Clone)]
pub struct Calibrator {
  #[cfg(feature = "plots")]
  chart_path: Option<std::path::PathBuf>,
  mode: ChannelMode,
  min_object_size: usize,
  use_minimum: bool,
  binary_mask: Option<nd::Array3<bool>>,
  grid: Vec<f32>,
}

impl Calibrator {
  fn counts_of(&self, seeds: &nd::Array3<bool>, prune: bool) -> f64 {
    let (labels, _) = label_mask(seeds.view(), Connectivity::Face);
    if prune && distinct_values(labels.view()) != 1 {
      distinct_values(remove_small_objects(&labels, self.min_object_size).view()) as f64
    } else {
      distinct_values(labels.view()) as f64
    }
  }

  fn analyse(&self, sample: &CalibrationSample, dist_grid: &[f32]) -> SegResult<Option<SampleResult>> {
    //(0) background-only samples are skipped
    let target = distinct_values(sample.instances.view());
    if target == 1 {
      log::debug!("skipping a sample that only holds background");
      return Ok(None);
    }
    let gt = remove_small_objects(&sample.instances, self.min_object_size).mapv(|l| l > 0);

    let mut pred = sample.prediction.clone();
    if let Some(ref mask) = self.binary_mask {
      apply_binary_mask(&mut pred, mask.view())?;
    }
    let (c0, c1) = (channel(&pred, 0), channel(&pred, 1));
    let bcd = self.mode == ChannelMode::BCD;
    let grid = &self.grid;

    //(1) th3, and th5 for BCD: best foreground overlap
    let th3_scores: Vec<f64> =
      grid.iter().map(|&t| jaccard_index(threshold_channel(c0, |v| v > t).view(), gt.view())).collect();
    let th3 = best_overlap(&th3_scores).map_or(-1.0, |j| grid[j]);

    let th5_scores: Vec<f64> = if bcd {
      let c2 = channel(&pred, 2);
      dist_grid.iter().map(|&t| jaccard_index(threshold_channel(c2, |v| v > t).view(), gt.view())).collect()
    } else {
      Vec::new()
    };
    let th5 = bcd.then(|| best_overlap(&th5_scores).map_or(-1.0, |j| dist_grid[j]));

    //(2) th2: separate the foreground until the object count matches
    let objects = threshold_channel(c0, |v| v > th3);
    let th2_counts: Vec<f64> = grid
      .iter()
      .map(|&t| {
        let mut seeds = objects.clone();
        nd::Zip::from(&mut seeds).and(&c1).par_for_each(|s, &v| *s = *s && v < t);
        self.counts_of(&seeds, true)
      })
      .collect();
    let th2 = separation_choice(&as_counts(&th2_counts), target);
    let th2_best = th2.best.map_or(0.0, |j| grid[j]);

    //(3) th1: seed threshold with th2 fixed
    let th1_counts: Vec<f64> = grid
      .iter()
      .map(|&t| {
        let mut seeds = threshold_channel(c0, |v| v > t);
        nd::Zip::from(&mut seeds).and(&c1).par_for_each(|s, &v| *s = *s && v < th2_best);
        self.counts_of(&seeds, false)
      })
      .collect();
    let th1 = seed_choice(&as_counts(&th1_counts), target);

    //(4) th4 for BCD: distance seed threshold with th2 fixed
    let (th4, th4_counts) = if bcd {
      let c2 = channel(&pred, 2);
      let counts: Vec<f64> = dist_grid
        .iter()
        .map(|&t| {
          let mut seeds = threshold_channel(c2, |v| v > t);
          nd::Zip::from(&mut seeds).and(&c1).par_for_each(|s, &v| *s = *s && v < th2_best);
          self.counts_of(&seeds, false)
        })
        .collect();
      let choice = seed_choice(&as_counts(&counts), target);
      (Some((choice.best.map_or(0.0, |j| dist_grid[j]), dist_grid[choice.optimum])), counts)
    } else {
      (None, Vec::new())
    };

    Ok(Some(SampleResult {
      th1_best: th1.best.map_or(0.0, |j| grid[j]),
      th1_opt: grid[th1.optimum],
      th2_best,
      th2_opt: grid[th2.optimum],
      th3,
      th4,
      th5,
      th1_counts,
      th2_counts,
      th3_scores,
      th4_counts,
      th5_scores,
    }))
  }

  fn check_sample(&self, sample: &CalibrationSample) -> SegResult<()> {
    self.mode.check_channels(sample.prediction.shape()[3])?;
    let shape = spatial_shape(&sample.prediction);
    if sample.instances.shape() != shape {
      return Err(SegError::shape("instance annotation", sample.instances.shape(), &shape));
    }
    Ok(())
  }

  /// Calibrate thresholds on prediction/annotation pairs.
  pub fn calibrate(&self, samples: &[CalibrationSample]) -> SegResult<Calibration> {
    //(1) validate and find the distance grid
    let dist_grid = if self.mode == ChannelMode::BCD {
      let mut max_distance = f32::NEG_INFINITY;
      for s in samples {
        let dist = s.distance.as_ref().ok_or_else(|| {
          SegError::MissingInput("BCD calibration needs the annotated distance channel of every sample".into())
        })?;
        max_distance = dist.iter().copied().fold(max_distance, f32::max);
      }
      let grid = distance_grid(max_distance);
      if grid.is_empty() {
        return Err(SegError::InvalidConfig(format!(
          "annotated distances (max {max_distance}) leave no distance candidates"
        )));
      }
      grid
    } else {
      Vec::new()
    };
    samples.iter().try_for_each(|s| self.check_sample(s))?;

    //(2) analyse all samples in parallel
    #[cfg(feature = "progress")]
    let bar = indicatif::ProgressBar::new(samples.len() as u64);
    let results: Vec<Option<SampleResult>> = samples
      .par_iter()
      .map(|s| {
        let res = self.analyse(s, &dist_grid);
        #[cfg(feature = "progress")]
        bar.inc(1);
        res
      })
      .collect::<SegResult<_>>()?;
    #[cfg(feature = "progress")]
    bar.finish_and_clear();

    let ideal_objects = samples
      .iter()
      .map(|s| distinct_values(s.instances.view()) as f64)
      .sum::<f64>()
      / samples.len().max(1) as f64;
    let used: Vec<&SampleResult> = results.iter().flatten().collect();
    if used.is_empty() {
      return Err(SegError::NoUsableSamples(samples.len()));
    }
    log::info!("calibrating on {} of {} samples", used.len(), samples.len());

    //(3) aggregate
    let collect = |f: fn(&SampleResult) -> f32| -> Vec<f32> { used.iter().map(|r| f(r)).collect() };
    let th1_best_all = collect(|r| r.th1_best);
    let th1_best = Estimate::from_values(&th1_best_all);
    let th1_opt = Estimate::from_values(&collect(|r| r.th1_opt));
    let th2_best = Estimate::from_values(&collect(|r| r.th2_best));
    let th2_opt = Estimate::from_values(&collect(|r| r.th2_opt));
    let th3 = Estimate::from_values(&collect(|r| r.th3));

    let bcd = self.mode == ChannelMode::BCD;
    let th4_best_all: Vec<f32> = used.iter().filter_map(|r| r.th4.map(|t| t.0)).collect();
    let th4_best = bcd.then(|| Estimate::from_values(&th4_best_all));
    let th4_opt = bcd.then(|| {
      Estimate::from_values(&used.iter().filter_map(|r| r.th4.map(|t| t.1)).collect::<Vec<_>>())
    });
    let th5 = bcd.then(|| Estimate::from_values(&used.iter().filter_map(|r| r.th5).collect::<Vec<_>>()));

    let lowest = |v: &[f32]| v.iter().copied().fold(f32::INFINITY, f32::min);
    let defaults = ThresholdSet::default();
    let thresholds = ThresholdSet {
      th1: if self.use_minimum { lowest(&th1_best_all) } else { th1_opt.mean },
      th2: th2_opt.mean,
      th3: th3.mean,
      th4: match th4_opt {
        Some(_) if self.use_minimum => lowest(&th4_best_all),
        Some(opt) => opt.mean,
        None => defaults.th4,
      },
      th5: th5.map_or(defaults.th5, |e| e.mean),
      th_points: defaults.th_points,
    };
    log::info!("calibrated thresholds: {thresholds:?}");

    //(4) score curves
    let per_sample = |f: fn(&SampleResult) -> &[f64]| -> Vec<Vec<f64>> { used.iter().map(|r| f(r).to_vec()).collect() };
    let mut curves = vec![
      ScoreCurve { name: "TH1", grid: self.grid.clone(), per_sample: per_sample(|r| &r.th1_counts), ideal: Some(ideal_objects) },
      ScoreCurve { name: "TH2", grid: self.grid.clone(), per_sample: per_sample(|r| &r.th2_counts), ideal: Some(ideal_objects) },
      ScoreCurve { name: "TH3", grid: self.grid.clone(), per_sample: per_sample(|r| &r.th3_scores), ideal: None },
    ];
    if bcd {
      curves.push(ScoreCurve {
        name: "TH4",
        grid: dist_grid.clone(),
        per_sample: per_sample(|r| &r.th4_counts),
        ideal: Some(ideal_objects),
      });
      curves.push(ScoreCurve { name: "TH5", grid: dist_grid, per_sample: per_sample(|r| &r.th5_scores), ideal: None });
    }

    #[cfg(feature = "plots")]
    if let Some(ref path) = self.chart_path {
      for curve in &curves {
        if let Err(err) = crate::plotting::plot_score_curve(curve, path) {
          log::warn!("could not chart {}: {err}", curve.name);
        }
      }
    }

    Ok(Calibration {
      thresholds,
      th1_best,
      th1_opt,
      th2_best,
      th2_opt,
      th3,
      th4_best,
      th4_opt,
      th5,
      ideal_objects,
      samples_used: used.len(),
      samples_skipped: samples.len() - used.len(),
      curves,
    })
  }

  /// Predict every image with `model` (through `ensemble` when given) and
  /// calibrate on the result. Images with a maximum above 30 are taken to be
  /// 8-bit and are divided by 255 first. Background-only images are not sent
  /// to the model.
  pub fn calibrate_with_model<P: Predictor + ?Sized>(
    &self,
    model: &P,
    ensemble: Option<&EnsemblePredictor>,
    images: Vec<CalibrationImage>,
  ) -> SegResult<Calibration> {
    let samples = images
      .into_iter()
      .map(|img| {
        let CalibrationImage { mut image, instances, distance } = img;
        let prediction = if distinct_values(instances.view()) == 1 {
          let [nz, ny, nx] = spatial_shape(&image);
          ProbabilityVolume::zeros((nz, ny, nx, self.mode.min_channels()))
        } else {
          if image.iter().copied().fold(f32::NEG_INFINITY, f32::max) > 30.0 {
            image.par_mapv_inplace(|v| v / 255.0);
          }
          match ensemble {
            Some(ens) => ens.predict(model, &image)?,
            None => predict_one(model, &image)?,
          }
        };
        Ok(CalibrationSample { prediction, instances, distance })
      })
      .collect::<SegResult<Vec<_>>>()?;
    self.calibrate(&samples)
  }
}

fn as_counts(counts: &[f64]) -> Vec<usize> {
  counts.iter().map(|&c| c as usize).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ensemble::ModelOutput;

  #[test]
  fn grids_have_expected_values() {
    let g = probability_grid();
    assert_eq!(g.len(), 28);
    assert_eq!(g[10], 0.1);
    assert_eq!(g[27], 0.95);
    let d = distance_grid(1.0);
    assert_eq!(d.len(), 20);
    assert!((d[19] - 1.05).abs() < 1e-6);
  }

  #[test]
  fn separation_tie_run_pushes_optimum_forward() {
    let choice = separation_choice(&[5, 4, 3, 3, 3, 6], 3);
    assert_eq!(choice.best, Some(2));
    assert!((2..=4).contains(&choice.optimum));
    assert_eq!(choice.optimum, 3);
  }

  #[test]
  fn long_separation_runs_are_capped() {
    let mut counts = vec![9];
    counts.extend(std::iter::repeat(3).take(14));
    let choice = separation_choice(&counts, 3);
    assert_eq!(choice.best, Some(1));
    assert_eq!(choice.optimum, 3);
  }

  #[test]
  fn seed_rule_moves_over_the_whole_run() {
    let choice = seed_choice(&[6, 5, 3, 3, 3, 7], 3);
    assert_eq!(choice.best, Some(2));
    assert_eq!(choice.optimum, 4);
  }

  #[test]
  fn seed_rule_without_update_takes_last_candidate() {
    //A difference of zero at the very start never differs from the initial one
    let choice = seed_choice(&[3, 3, 3], 3);
    assert_eq!(choice.best, None);
    assert_eq!(choice.optimum, 2);
  }

  #[test]
  fn overlap_picks_first_maximum() {
    assert_eq!(best_overlap(&[0.1, 0.7, 0.7, 0.3]), Some(1));
    assert_eq!(best_overlap(&[]), None);
  }

  fn two_object_sample() -> CalibrationSample {
    let mut instances = Labels::zeros((1, 12, 20));
    instances.slice_mut(nd::s![.., 2..10, 2..9]).fill(1);
    instances.slice_mut(nd::s![.., 2..10, 11..18]).fill(2);
    let mut prediction = ProbabilityVolume::zeros((1, 12, 20, 2));
    for ((z, y, x), &l) in instances.indexed_iter() {
      if l != 0 {
        prediction[[z, y, x, 0]] = 0.9;
        let edge = y == 2 || y == 9 || x == 2 || x == 8 || x == 11 || x == 17;
        prediction[[z, y, x, 1]] = if edge { 0.8 } else { 0.05 };
      }
    }
    CalibrationSample { prediction, instances, distance: None }
  }

  #[test]
  fn calibration_on_clean_prediction() {
    let background = CalibrationSample {
      prediction: ProbabilityVolume::zeros((1, 12, 20, 2)),
      instances: Labels::zeros((1, 12, 20)),
      distance: None,
    };
    let cal = CalibratorBuilder::new(ChannelMode::BC)
      .build()
      .unwrap()
      .calibrate(&[two_object_sample(), background])
      .unwrap();
    assert_eq!(cal.samples_used, 1);
    assert_eq!(cal.samples_skipped, 1);
    assert_eq!(cal.ideal_objects, 2.0);
    //Any foreground cut below 0.9 reproduces the annotation exactly
    assert!(cal.th3.mean < 0.9);
    let th = cal.thresholds;
    assert!(th.th2 > 0.05 && th.th2 <= 0.8, "th2 {}", th.th2);
    assert_eq!(cal.curves.len(), 3);
    assert_eq!(cal.curves[0].per_sample[0].len(), probability_grid().len());
  }

  #[test]
  fn only_background_is_an_error() {
    let background = CalibrationSample {
      prediction: ProbabilityVolume::zeros((1, 4, 4, 2)),
      instances: Labels::zeros((1, 4, 4)),
      distance: None,
    };
    let cal = CalibratorBuilder::new(ChannelMode::BC).build().unwrap();
    assert!(matches!(cal.calibrate(&[background]), Err(SegError::NoUsableSamples(1))));
  }

  #[test]
  fn bcd_without_distance_is_rejected() {
    let mut sample = two_object_sample();
    sample.prediction = ProbabilityVolume::zeros((1, 12, 20, 3));
    let cal = CalibratorBuilder::new(ChannelMode::BCD).build().unwrap();
    assert!(matches!(cal.calibrate(&[sample]), Err(SegError::MissingInput(_))));
    assert!(CalibratorBuilder::new(ChannelMode::Dv2).build().is_err());
  }

  #[test]
  fn binary_mask_zeroes_outside() {
    let mut data = ProbabilityVolume::from_elem((2, 2, 2, 2), 1.0);
    let mut mask = nd::Array3::from_elem((1, 2, 2), true);
    mask[[0, 0, 0]] = false;
    apply_binary_mask(&mut data, mask.view()).unwrap();
    assert_eq!(data[[1, 0, 0, 1]], 0.0);
    assert_eq!(data[[1, 1, 0, 1]], 1.0);
    assert!(apply_binary_mask(&mut data, nd::Array3::from_elem((1, 3, 2), true).view()).is_err());
  }

  #[test]
  fn eight_bit_images_are_rescaled_before_prediction() {
    fn model(batch: nd::ArrayView5<f32>) -> SegResult<ModelOutput> {
      assert!(batch.iter().all(|&v| v <= 1.0));
      let mut out = batch.to_owned();
      out.index_axis_mut(nd::Axis(4), 1).fill(0.0);
      Ok(ModelOutput::Single(out))
    }
    let sample = two_object_sample();
    let mut image = ProbabilityVolume::zeros((1, 12, 20, 2));
    image.index_axis_mut(nd::Axis(3), 0).assign(&sample.instances.mapv(|l| if l > 0 { 200.0 } else { 0.0 }));
    let cal = CalibratorBuilder::new(ChannelMode::BC).build().unwrap();
    let res = cal
      .calibrate_with_model(&model, None, vec![CalibrationImage { image, instances: sample.instances, distance: None }])
      .unwrap();
    assert_eq!(res.samples_used, 1);
  }
}
