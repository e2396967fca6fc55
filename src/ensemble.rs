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

//! Test-time augmentation around an external model.
//!
//! The input is reflect-padded until its `(y, x)` plane is square. Planar
//! inputs are then rotated by 0, 90, 180 and 270 degrees, with and without a
//! flip along x (8 variants). Volumes get the four rotations of the plain
//! volume plus those of the volume flipped along z, y and x (16 variants).
//! Every prediction is transformed back, the padding is cut off again and the
//! variants are averaged.

use ndarray as nd;

use crate::error::{SegError, SegResult};
use crate::volume::{is_planar, ProbabilityVolume};

/// What a model hands back. Models with several heads return a list; the last
/// entry is the prediction that counts.
#[derive(Debug, Clone)]
pub enum ModelOutput {
  Single(nd::Array5<f32>),
  Multi(Vec<nd::Array5<f32>>),
}

impl ModelOutput {
  pub fn into_prediction(self) -> SegResult<nd::Array5<f32>> {
    match self {
      ModelOutput::Single(arr) => Ok(arr),
      ModelOutput::Multi(mut list) => {
        list.pop().ok_or_else(|| SegError::Model("model returned an empty list".into()))
      }
    }
  }
}

/// External model: maps a batch `(N, z, y, x, C)` to predictions
/// `(N, z, y, x, C')`. Planar data has `z = 1`.
pub trait Predictor: Sync {
  fn predict(&self, batch: nd::ArrayView5<f32>) -> SegResult<ModelOutput>;
}

impl<F> Predictor for F
where
  F: Fn(nd::ArrayView5<f32>) -> SegResult<ModelOutput> + Sync,
{
  fn predict(&self, batch: nd::ArrayView5<f32>) -> SegResult<ModelOutput> {
    self(batch)
  }
}

/// Run `model` on a single volume and return its prediction.
pub fn predict_one<P: Predictor + ?Sized>(model: &P, vol: &ProbabilityVolume) -> SegResult<ProbabilityVolume> {
  let batch = vol.view().insert_axis(nd::Axis(0));
  let pred = model.predict(batch)?.into_prediction()?;
  if pred.shape()[0] != 1 || pred.shape()[1..4] != vol.shape()[..3] {
    return Err(SegError::Model(format!(
      "prediction has shape {:?} for an input of shape {:?}",
      pred.shape(),
      vol.shape()
    )));
  }
  Ok(pred.index_axis_move(nd::Axis(0), 0))
}

////////////////////////////////////////////////////////////////////////////////
//                             TRANSFORMATIONS                                //
////////////////////////////////////////////////////////////////////////////////

/// A flip (on a spatial axis of a `(z, y, x, C)` array) followed by `turns`
/// quarter rotations in the `(y, x)` plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Variant {
  flip: Option<usize>,
  turns: usize,
}

fn variants(planar: bool) -> Vec<Variant> {
  let flips: &[Option<usize>] = if planar { &[None, Some(2)] } else { &[None, Some(0), Some(1), Some(2)] };
  flips
    .iter()
    .flat_map(|&flip| (0..4).map(move |turns| Variant { flip, turns }))
    .collect()
}

/// One quarter turn in the `(y, x)` plane. The plane has to be square.
fn quarter_turn(vol: nd::ArrayView4<f32>) -> nd::Array4<f32> {
  let mut v = vol;
  v.invert_axis(nd::Axis(2));
  v.swap_axes(1, 2);
  v.as_standard_layout().into_owned()
}

fn turn(vol: nd::ArrayView4<f32>, turns: usize) -> nd::Array4<f32> {
  (0..turns % 4).fold(vol.to_owned(), |acc, _| quarter_turn(acc.view()))
}

fn flip(vol: nd::ArrayView4<f32>, axis: Option<usize>) -> nd::Array4<f32> {
  let mut v = vol;
  if let Some(ax) = axis {
    v.invert_axis(nd::Axis(ax));
  }
  v.to_owned()
}

impl Variant {
  fn forward(&self, vol: nd::ArrayView4<f32>) -> nd::Array4<f32> {
    turn(flip(vol, self.flip).view(), self.turns)
  }

  fn inverse(&self, vol: nd::ArrayView4<f32>) -> nd::Array4<f32> {
    flip(turn(vol, 4 - self.turns % 4).view(), self.flip)
  }
}

/// Index into `0..n` for a position `j` before/after the data, mirroring
/// around the edge samples without repeating them.
fn reflect_index(j: isize, n: usize) -> usize {
  if n == 1 {
    return 0;
  }
  let period = 2 * (n as isize - 1);
  let mut j = j.rem_euclid(period);
  if j >= n as isize {
    j = period - j;
  }
  j as usize
}

/// Reflect-pad `pad` samples at the start of `axis`.
fn pad_start(vol: nd::ArrayView4<f32>, axis: usize, pad: usize) -> nd::Array4<f32> {
  if pad == 0 {
    return vol.to_owned();
  }
  let n = vol.len_of(nd::Axis(axis));
  let mut shape = vol.raw_dim();
  shape[axis] += pad;
  nd::Array4::from_shape_fn(shape, |(z, y, x, c)| {
    let mut idx = [z, y, x, c];
    idx[axis] = reflect_index(idx[axis] as isize - pad as isize, n);
    vol[idx]
  })
}

////////////////////////////////////////////////////////////////////////////////
//                               PREDICTOR                                    //
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct EnsembleBuilder {
  batch_size: usize,
  n_classes: usize,
}

impl Default for EnsembleBuilder {
  fn default() -> Self {
    EnsembleBuilder { batch_size: 1, n_classes: 1 }
  }
}

impl EnsembleBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of variants handed to the model per call.
  pub fn set_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  /// With more than one class, every variant is reduced to its per-voxel
  /// argmax before averaging.
  pub fn set_n_classes(mut self, n_classes: usize) -> Self {
    self.n_classes = n_classes;
    self
  }

  pub fn build(self) -> SegResult<EnsemblePredictor> {
    if self.batch_size == 0 || self.n_classes == 0 {
      return Err(SegError::InvalidConfig(format!(
        "batch size ({}) and class count ({}) have to be at least 1",
        self.batch_size, self.n_classes
      )));
    }
    Ok(EnsemblePredictor { batch_size: self.batch_size, n_classes: self.n_classes })
  }
}

#[derive(Debug, Clone)]
pub struct EnsemblePredictor {
  batch_size: usize,
  n_classes: usize,
}

fn argmax_channel(pred: nd::ArrayView4<f32>) -> nd::Array4<f32> {
  pred
    .map_axis(nd::Axis(3), |lane| {
      lane
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0 as f32
    })
    .insert_axis(nd::Axis(3))
}

impl EnsemblePredictor {
  pub fn n_variants(&self, vol: &ProbabilityVolume) -> usize {
    variants(is_planar(vol.shape())).len()
  }

  /// Averaged prediction of all symmetry variants of `vol` `(z, y, x, C)`.
  pub fn predict<P: Predictor + ?Sized>(&self, model: &P, vol: &ProbabilityVolume) -> SegResult<ProbabilityVolume> {
    let (nz, ny, nx, _) = vol.dim();
    let planar = is_planar(vol.shape());

    //(1) pad the plane to a square
    let (pad_axis, pad) = if ny < nx { (1, nx - ny) } else { (2, ny - nx) };
    let square = pad_start(vol.view(), pad_axis, pad);
    let side = ny.max(nx);

    //(2) build all variants
    let variants = variants(planar);
    let augmented: Vec<nd::Array4<f32>> = variants.iter().map(|v| v.forward(square.view())).collect();
    log::debug!("ensembling {} variants of a {:?} input", variants.len(), vol.shape());

    //(3) run the model batch by batch
    let mut predictions: Vec<nd::Array4<f32>> = Vec::with_capacity(variants.len());
    for chunk in augmented.chunks(self.batch_size) {
      let views: Vec<_> = chunk.iter().map(|a| a.view()).collect();
      let batch = nd::stack(nd::Axis(0), &views)?;
      let out = model.predict(batch.view())?.into_prediction()?;
      if out.shape()[0] != chunk.len() || out.shape()[1..4] != [nz, side, side] {
        return Err(SegError::Model(format!(
          "prediction has shape {:?} for a batch of shape {:?}",
          out.shape(),
          batch.shape()
        )));
      }
      for pred in out.outer_iter() {
        predictions.push(if self.n_classes > 1 { argmax_channel(pred) } else { pred.to_owned() });
      }
    }

    //(4) undo the transformations, strip the padding and average
    let n_out = predictions.first().map(|p| p.shape()[3]).unwrap_or(0);
    let mut acc = nd::Array4::<f64>::zeros((nz, ny, nx, n_out));
    for (variant, pred) in variants.iter().zip(&predictions) {
      let restored = variant.inverse(pred.view());
      let cropped = match pad_axis {
        1 => restored.slice_move(nd::s![.., pad.., .., ..]),
        _ => restored.slice_move(nd::s![.., .., pad.., ..]),
      };
      nd::Zip::from(&mut acc).and(&cropped).for_each(|a, &p| *a += p as f64);
    }
    let n = variants.len() as f64;
    Ok(acc.mapv(|a| (a / n) as f32))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray_rand::{rand_distr::Uniform, RandomExt};

  fn identity(batch: nd::ArrayView5<f32>) -> SegResult<ModelOutput> {
    Ok(ModelOutput::Single(batch.to_owned()))
  }

  #[test]
  fn reflect_padding_skips_the_edge() {
    assert_eq!((-3..0).map(|j| reflect_index(j, 4)).collect::<Vec<_>>(), vec![3, 2, 1]);
    assert_eq!(reflect_index(-5, 3), 1);
    assert_eq!(reflect_index(-2, 1), 0);
  }

  #[test]
  fn identity_round_trip_planar() {
    let ens = EnsembleBuilder::new().set_batch_size(3).build().unwrap();
    for shape in [(1, 6, 6, 1), (1, 5, 9, 2), (1, 8, 3, 1), (1, 7, 7, 3)] {
      let vol = ProbabilityVolume::random(shape, Uniform::new(0.0, 1.0));
      assert_eq!(ens.n_variants(&vol), 8);
      assert_eq!(ens.predict(&identity, &vol).unwrap(), vol);
    }
  }

  #[test]
  fn identity_round_trip_volume() {
    let ens = EnsembleBuilder::new().set_batch_size(5).build().unwrap();
    for shape in [(3, 4, 4, 1), (2, 5, 8, 1), (4, 7, 2, 2)] {
      let vol = ProbabilityVolume::random(shape, Uniform::new(0.0, 1.0));
      assert_eq!(ens.n_variants(&vol), 16);
      assert_eq!(ens.predict(&identity, &vol).unwrap(), vol);
    }
  }

  #[test]
  fn multi_class_uses_majority_of_argmax() {
    fn model(batch: nd::ArrayView5<f32>) -> SegResult<ModelOutput> {
      let (n, z, y, x, _) = batch.dim();
      let mut out = nd::Array5::<f32>::zeros((n, z, y, x, 2));
      out.index_axis_mut(nd::Axis(4), 1).fill(0.8);
      Ok(ModelOutput::Multi(vec![nd::Array5::zeros((n, z, y, x, 2)), out]))
    }
    let ens = EnsembleBuilder::new().set_n_classes(2).build().unwrap();
    let vol = ProbabilityVolume::zeros((1, 4, 6, 1));
    let pred = ens.predict(&model, &vol).unwrap();
    assert_eq!(pred.shape(), &[1, 4, 6, 1]);
    assert!(pred.iter().all(|&v| v == 1.0));
  }

  #[test]
  fn wrong_prediction_shape_is_an_error() {
    fn model(batch: nd::ArrayView5<f32>) -> SegResult<ModelOutput> {
      Ok(ModelOutput::Single(batch.slice(nd::s![.., .., 1.., .., ..]).to_owned()))
    }
    let ens = EnsembleBuilder::new().build().unwrap();
    let vol = ProbabilityVolume::zeros((1, 4, 4, 1));
    assert!(matches!(ens.predict(&model, &vol), Err(SegError::Model(_))));
    assert!(matches!(ModelOutput::Multi(vec![]).into_prediction(), Err(SegError::Model(_))));
  }
}
