//! Brute-force Euclidean search. Always available.
//!
//! Computes every distance, then partially selects the k smallest
//! (`select_nth_unstable_by`) and sorts only those. When k covers the
//! whole set it sorts everything.

use super::{by_distance, squared_euclidean, DistanceMetric, Hits, NeighborSearch, Points};
use crate::Result;

pub(crate) struct BruteForceSearch {
    points: Points,
}

impl NeighborSearch for BruteForceSearch {
    fn build(points: Points) -> Self {
        Self { points }
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Euclidean
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Hits> {
        let n = self.points.len();
        let mut scored: Vec<(f32, usize)> = (0..n)
            .map(|i| (squared_euclidean(self.points.row(i), query), i))
            .collect();

        if k < n {
            scored.select_nth_unstable_by(k - 1, by_distance);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_distance);

        Ok(Hits::from_pairs(scored.into_iter().map(|(d2, i)| (d2.sqrt(), i))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(rows: &[[f32; 2]]) -> Points {
        Points { data: rows.iter().flatten().copied().collect(), dim: 2 }
    }

    #[test]
    fn test_partial_selection_keeps_k_smallest() {
        let search = BruteForceSearch::build(points(&[[5.0, 0.0], [1.0, 0.0], [3.0, 0.0], [2.0, 0.0]]));
        let hits = search.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits.indices, vec![1, 3]);
        assert_eq!(hits.distances, vec![1.0, 2.0]);
    }

    #[test]
    fn test_ties_break_by_index() {
        let search = BruteForceSearch::build(points(&[[1.0, 0.0], [-1.0, 0.0], [0.0, 1.0]]));
        let hits = search.search(&[0.0, 0.0], 3).unwrap();
        assert_eq!(hits.indices, vec![0, 1, 2]);
    }
}
