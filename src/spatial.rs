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

//! Point index over `(z, y, x)` coordinates, used for nearest-seed lookups and
//! for finding detections that sit too close together.

use rstar::{primitives::GeomWithData, RTree};

type Entry = GeomWithData<[f64; 3], usize>;

/// R-tree of points that remembers the position of every point in the list it
/// was built from. All queries answer with those positions.
#[derive(Debug, Clone)]
pub struct PointIndex {
  tree: RTree<Entry>,
  points: Vec<[f64; 3]>,
}

impl PointIndex {
  pub fn new(points: Vec<[f64; 3]>) -> Self {
    let entries = points.iter().enumerate().map(|(i, p)| Entry::new(*p, i)).collect();
    PointIndex { tree: RTree::bulk_load(entries), points }
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// Index of and distance to the point closest to `query`. Equidistant
  /// points resolve to the lowest index. `None` for an empty index.
  pub fn nearest(&self, query: &[f64; 3]) -> Option<(usize, f64)> {
    let mut candidates = self.tree.nearest_neighbor_iter_with_distance_2(query);
    let (first, best_d2) = candidates.next()?;
    //Candidates arrive by increasing distance
    let best = candidates
      .take_while(|&(_, d2)| d2 <= best_d2)
      .fold(first.data, |best, (entry, _)| best.min(entry.data));
    Some((best, best_d2.sqrt()))
  }

  /// Indices of all points within distance `r` of `query` (inclusive), sorted.
  pub fn within(&self, query: &[f64; 3], r: f64) -> Vec<usize> {
    let mut out: Vec<usize> = self.tree.locate_within_distance(*query, r * r).map(|e| e.data).collect();
    out.sort_unstable();
    out
  }

  /// All pairs `(i, j)` with `i < j` whose distance is at most `r`, sorted.
  pub fn query_pairs(&self, r: f64) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(usize, usize)> = self
      .points
      .iter()
      .enumerate()
      .flat_map(|(i, p)| self.within(p, r).into_iter().filter(move |&j| j > i).map(move |j| (i, j)))
      .collect();
    pairs.sort_unstable();
    pairs
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::Rng;

  fn dist2(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (0..3).map(|ax| (a[ax] - b[ax]).powi(2)).sum()
  }

  #[test]
  fn empty_index_has_no_neighbour() {
    let index = PointIndex::new(vec![]);
    assert!(index.is_empty());
    assert!(index.nearest(&[0.0; 3]).is_none());
    assert!(index.query_pairs(10.0).is_empty());
  }

  #[test]
  fn nearest_matches_brute_force() {
    let mut rng = rand::thread_rng();
    let pts: Vec<[f64; 3]> = (0..200)
      .map(|_| [rng.gen_range(0.0..10.0), rng.gen_range(0.0..50.0), rng.gen_range(0.0..50.0)])
      .collect();
    let index = PointIndex::new(pts.clone());
    assert_eq!(index.len(), 200);
    for _ in 0..100 {
      let q = [rng.gen_range(0.0..10.0), rng.gen_range(0.0..50.0), rng.gen_range(0.0..50.0)];
      let brute = pts.iter().map(|p| dist2(p, &q)).fold(f64::INFINITY, f64::min);
      let (i, d) = index.nearest(&q).unwrap();
      assert!((d * d - brute).abs() < 1e-9);
      assert!((dist2(&pts[i], &q) - brute).abs() < 1e-9);
    }
  }

  #[test]
  fn ties_go_to_lowest_index() {
    let index = PointIndex::new(vec![[0.0, 0.0, 3.0], [0.0, 0.0, 2.0], [0.0, 0.0, -2.0]]);
    assert_eq!(index.nearest(&[0.0, 0.0, 0.0]).unwrap().0, 1);
    let index = PointIndex::new(vec![[0.0, 2.0, 0.0], [0.0, 0.0, 2.0], [0.0, -2.0, 0.0], [2.0, 0.0, 0.0]]);
    assert_eq!(index.nearest(&[0.0, 0.0, 0.0]), Some((0, 2.0)));
  }

  #[test]
  fn radius_queries_are_inclusive() {
    let index = PointIndex::new(vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 5.0]]);
    assert_eq!(index.within(&[0.0, 0.0, 3.0], 2.0), vec![1, 2]);
    assert_eq!(index.query_pairs(2.0), vec![(0, 1)]);
    assert_eq!(index.query_pairs(1.0), vec![(0, 1)]);
    assert_eq!(index.query_pairs(4.0), vec![(0, 1), (1, 2)]);
  }
}
