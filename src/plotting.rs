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

//! Images of label slices and charts of calibration curves.

use std::{error::Error, path::Path};

use ndarray as nd;
use num_traits::ToPrimitive;
use plotters::prelude::*;

use crate::calibrate::ScoreCurve;

//Colour for background px
const NAN_COL: RGBColor = BLACK;

pub fn plot_slice<'a, T>(
  slice: nd::ArrayView2<'a, T>,
  file_name: &Path,
  color_map: fn(count: T, min: T, max: T) -> Result<RGBColor, Box<dyn Error>>,
) -> Result<(), Box<dyn Error>>
where
  T: Default + std::fmt::Display + std::cmp::PartialOrd + ToPrimitive + Copy,
{
  //Get min and max vals of slice
  let min = slice.iter().fold(T::default(), |f: T, x: &T| if *x < f { *x } else { f });
  let max = slice.iter().fold(T::default(), |f: T, x: &T| if *x > f { *x } else { f });

  //Images are (width, height) = (x, y)
  let y_size = slice.shape()[0] as u32;
  let x_size = slice.shape()[1] as u32;

  //Make new fig
  let root = BitMapBackend::new(file_name, (x_size, y_size)).into_drawing_area();
  root.fill(&WHITE)?;

  //make empty drawing area in fig
  let mut chart = ChartBuilder::on(&root).build_cartesian_2d(0..x_size, 0..y_size)?;
  chart.configure_mesh().disable_mesh().disable_axes().draw()?;
  let plotting_area = chart.plotting_area();

  //fill pixels
  for ((y, x), px) in slice.indexed_iter() {
    plotting_area.draw_pixel((x as u32, y as u32), &color_map(*px, min, max)?)?
  }

  //save file
  root.present()?;
  log::debug!("slice saved as png: {file_name:?}; max:{max:2}, min:{min:2}");
  Ok(())
}

#[inline(always)]
pub fn grey_scale<T>(count: T, min: T, max: T) -> Result<RGBColor, Box<dyn Error>>
where
  T: std::fmt::Display + std::cmp::PartialOrd + ToPrimitive,
{
  if count <= min {
    Ok(NAN_COL)
  } else {
    let (count, min, max) = (to_f64(&count)?, to_f64(&min)?, to_f64(&max)?);
    let gray = (255.0 * (count - min) / (max - min)) as u8;
    Ok(RGBColor(gray, gray, gray))
  }
}

/// Background black, every label a fixed pseudo-random colour.
#[inline(always)]
pub fn label_colours<T>(count: T, _min: T, _max: T) -> Result<RGBColor, Box<dyn Error>>
where
  T: std::fmt::Display + std::cmp::PartialOrd + ToPrimitive,
{
  let label = count.to_u64().ok_or_else(|| format!("label {count} is not a non-negative integer"))?;
  if label == 0 {
    return Ok(NAN_COL);
  }
  //Spread consecutive labels over the colour cube
  let hash = label.wrapping_mul(0x9E37_79B9_7F4A_7C15);
  let [r, g, b] = [(hash >> 40) as u8, (hash >> 24) as u8, (hash >> 8) as u8];
  Ok(RGBColor(r | 0x30, g | 0x30, b | 0x30))
}

fn to_f64<T: ToPrimitive + std::fmt::Display>(v: &T) -> Result<f64, Box<dyn Error>> {
  v.to_f64().ok_or_else(|| format!("{v} cannot be plotted").into())
}

fn value_range<'a, I: IntoIterator<Item = &'a f64>>(values: I) -> std::ops::Range<f64> {
  let (lo, hi) = values
    .into_iter()
    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
  if !lo.is_finite() || !hi.is_finite() {
    0.0..1.0
  } else if hi > lo {
    lo..hi + (hi - lo) * 0.05
  } else {
    lo - 0.5..hi + 0.5
  }
}

/// Line chart of a 1D intensity profile.
pub fn plot_profile(line: &[f64], file_name: &Path) {
  let draw = || -> Result<(), Box<dyn Error>> {
    let root = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
      .margin(10)
      .x_label_area_size(30)
      .y_label_area_size(40)
      .build_cartesian_2d(0f64..line.len().max(1) as f64, value_range(line))?;
    chart.configure_mesh().draw()?;
    chart.draw_series(LineSeries::new(line.iter().enumerate().map(|(i, &v)| (i as f64, v)), &RED))?;
    root.present()?;
    Ok(())
  };
  if let Err(err) = draw() {
    log::warn!("could not plot profile {}: {err}", file_name.display());
  }
}

/// Two charts per calibration curve: every sample on its own, and the mean
/// with a one standard deviation band. Count curves also show the mean
/// annotated object count.
pub fn plot_score_curve(curve: &ScoreCurve, dir: &Path) -> Result<(), Box<dyn Error>> {
  std::fs::create_dir_all(dir)?;
  let xs: Vec<f64> = curve.grid.iter().map(|&t| t as f64).collect();
  let x_range = value_range(&xs);
  let all = curve.per_sample.iter().flatten().chain(curve.ideal.iter());

  //(1) per sample overlay
  let file = dir.join(format!("{}_per_sample.png", curve.name));
  let root = BitMapBackend::new(&file, (800, 600)).into_drawing_area();
  root.fill(&WHITE)?;
  let mut chart = ChartBuilder::on(&root)
    .margin(10)
    .x_label_area_size(30)
    .y_label_area_size(50)
    .build_cartesian_2d(x_range.clone(), value_range(all))?;
  chart.configure_mesh().draw()?;
  for (k, sample) in curve.per_sample.iter().enumerate() {
    let colour = Palette99::pick(k);
    chart.draw_series(LineSeries::new(xs.iter().copied().zip(sample.iter().copied()), &colour))?;
  }
  if let Some(ideal) = curve.ideal {
    chart.draw_series(LineSeries::new(xs.iter().map(|&x| (x, ideal)), &BLACK))?;
  }
  root.present()?;

  //(2) mean and band
  let stats = curve.mean_std();
  let upper: Vec<f64> = stats.iter().map(|(m, s)| m + s).collect();
  let lower: Vec<f64> = stats.iter().map(|(m, s)| m - s).collect();
  let file = dir.join(format!("{}_mean.png", curve.name));
  let root = BitMapBackend::new(&file, (800, 600)).into_drawing_area();
  root.fill(&WHITE)?;
  let mut chart = ChartBuilder::on(&root)
    .margin(10)
    .x_label_area_size(30)
    .y_label_area_size(50)
    .build_cartesian_2d(x_range, value_range(upper.iter().chain(&lower).chain(curve.ideal.iter())))?;
  chart.configure_mesh().draw()?;
  let band: Vec<(f64, f64)> = xs
    .iter()
    .copied()
    .zip(upper.iter().copied())
    .chain(xs.iter().copied().zip(lower.iter().copied()).rev())
    .collect();
  chart.draw_series(std::iter::once(Polygon::new(band, BLUE.mix(0.2))))?;
  chart.draw_series(LineSeries::new(xs.iter().copied().zip(stats.iter().map(|s| s.0)), &BLUE))?;
  if let Some(ideal) = curve.ideal {
    chart.draw_series(LineSeries::new(xs.iter().map(|&x| (x, ideal)), &BLACK))?;
  }
  root.present()?;
  Ok(())
}
