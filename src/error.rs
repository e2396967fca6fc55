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

//! Error type shared by all stages of the segmentation pipeline.
//!
//! Every error is fatal to the sample (or run) that raised it. Nothing in this
//! crate retries; degenerate samples are *not* errors and are logged instead.

use ndarray as nd;

/// Convenience alias used throughout the crate.
pub type SegResult<T> = Result<T, SegError>;

#[derive(Debug, thiserror::Error)]
pub enum SegError {
  /// A builder or function was handed parameters that cannot work together.
  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  /// Two arrays that have to line up spatially do not.
  #[error("shape mismatch: {what} has shape {found:?}, expected {expected:?}")]
  ShapeMismatch { what: &'static str, found: Vec<usize>, expected: Vec<usize> },

  /// The probability volume does not carry the channels the mode reads.
  #[error("channel mode {mode} needs at least {needed} channel(s), input has {found}")]
  ChannelCount { mode: &'static str, needed: usize, found: usize },

  /// An input required by the chosen mode was not supplied.
  #[error("missing input: {0}")]
  MissingInput(String),

  /// Every sample handed to the calibrator was background-only.
  #[error("no usable samples: all {0} sample(s) contain background only")]
  NoUsableSamples(usize),

  /// The external model failed or returned something unusable.
  #[error("model prediction failed: {0}")]
  Model(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Npy(#[from] ndarray_npy::WriteNpyError),

  #[error(transparent)]
  Shape(#[from] nd::ShapeError),
}

impl SegError {
  pub(crate) fn shape(what: &'static str, found: &[usize], expected: &[usize]) -> Self {
    SegError::ShapeMismatch { what, found: found.to_vec(), expected: expected.to_vec() }
  }
}
