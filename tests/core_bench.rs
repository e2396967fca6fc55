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
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rustronomy_cellseg::prelude::*;

#[test]
fn core_bench() {
  //Create a random foreground/contour prediction
  let data = nd::Array4::<f32>::random((8, 256, 256, 2), Uniform::new(0.0, 1.0));

  //Set-up the segmenter
  let segmenter = SegmenterBuilder::new(ChannelMode::BC).set_remove_after(4).build().unwrap();

  println!("Testing 1 to {} threads performance", rayon::current_num_threads());

  //Time with num cores
  let results: Vec<f64> = (1..=rayon::current_num_threads())
    .map(|num_threads| {
      //Set core count
      println!("Running segmentation with {num_threads} thread(s)");
      let pool = rayon::ThreadPoolBuilder::new().num_threads(num_threads).build().unwrap();
      //Time segmentation
      let start = std::time::Instant::now();
      let map = pool.install(|| segmenter.segment(&data)).unwrap();
      let elapsed = start.elapsed().as_secs_f64();
      println!("{} instances found", map.instance_count());
      elapsed
    })
    .collect();

  //Print per run results
  for (threads, time) in results.iter().enumerate().map(|(i, t)| (i + 1, t)) {
    println!("{threads:02} threads = {time:000.02}s");
  }

  //Print total results
  let average = (1.0 / (results.len() as f64)) * results.iter().sum::<f64>();
  println!("Average time: {average:.02}");
}
