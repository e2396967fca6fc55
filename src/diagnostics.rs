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

//! Best-effort dumps of intermediate rasters as `.npy` files.
//!
//! Volumes are written with axis order `(z, c, y, x, s)`, both singleton axes
//! included. A failed write is logged as a warning and otherwise ignored.

use std::path::{Path, PathBuf};

use ndarray as nd;
use ndarray_npy::WritableElement;

use crate::error::SegResult;
use crate::volume::{LabelMap, Labels};

#[derive(Debug, Clone)]
pub struct Diagnostics {
  dir: PathBuf,
}

impl Diagnostics {
  pub fn new<P: AsRef<Path>>(dir: P) -> Self {
    Diagnostics { dir: dir.as_ref().to_path_buf() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Directory for a sub-set of the output, e.g. one sample of a batch.
  pub fn child(&self, name: &str) -> Self {
    Diagnostics { dir: self.dir.join(name) }
  }

  fn try_write<A>(&self, name: &str, vol: nd::ArrayView3<A>) -> SegResult<PathBuf>
  where
    A: WritableElement,
  {
    std::fs::create_dir_all(&self.dir)?;
    let path = self.dir.join(format!("{name}.npy"));
    let zcyxs = vol.insert_axis(nd::Axis(1)).insert_axis(nd::Axis(4));
    ndarray_npy::write_npy(&path, &zcyxs)?;
    Ok(path)
  }

  fn write<A: WritableElement>(&self, name: &str, vol: nd::ArrayView3<A>) {
    match self.try_write(name, vol) {
      Ok(path) => log::debug!("saved {}", path.display()),
      Err(err) => log::warn!("could not save diagnostic raster \"{name}\": {err}"),
    }
  }

  pub fn save_label_map(&self, name: &str, map: &LabelMap) {
    match map {
      LabelMap::U8(arr) => self.write(name, arr.view()),
      LabelMap::U16(arr) => self.write(name, arr.view()),
      LabelMap::U32(arr) => self.write(name, arr.view()),
    }
  }

  /// Save `labels` with the same integer width as `like`, saturating labels
  /// that do not fit.
  pub fn save_labels_like(&self, name: &str, labels: &Labels, like: &LabelMap) {
    match like {
      LabelMap::U8(_) => self.write(name, labels.mapv(|l| l.min(u8::MAX as usize) as u8).view()),
      LabelMap::U16(_) => self.write(name, labels.mapv(|l| l.min(u16::MAX as usize) as u16).view()),
      LabelMap::U32(_) => self.write(name, labels.mapv(|l| l.min(u32::MAX as usize) as u32).view()),
    }
  }

  pub fn save_mask(&self, name: &str, mask: nd::ArrayView3<bool>) {
    self.write(name, mask.mapv(|m| m as u8).view())
  }

  pub fn save_u8(&self, name: &str, vol: nd::ArrayView3<u8>) {
    self.write(name, vol)
  }
}
