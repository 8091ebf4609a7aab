//! Inner-product search over L2-normalized vectors.
//!
//! Rows are normalized once at build time (`x / (‖x‖ + 1e-12)`), the
//! query at search time; the reported distance is `1 − q·x`, i.e. cosine
//! distance in [0, 2]. Zero vectors normalize to zero and sit at distance 1.

use super::{by_distance, DistanceMetric, Hits, NeighborSearch, Points};
use crate::{Error, Result};

const NORM_EPS: f32 = 1e-12;

pub(crate) struct InnerProductSearch {
    normalized: Points,
}

fn normalize_into(v: &[f32], out: &mut Vec<f32>) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt() + NORM_EPS;
    out.extend(v.iter().map(|x| x / norm));
}

impl NeighborSearch for InnerProductSearch {
    fn build(points: Points) -> Self {
        let mut data = Vec::with_capacity(points.data.len());
        for i in 0..points.len() {
            normalize_into(points.row(i), &mut data);
        }
        Self { normalized: Points { data, dim: points.dim() } }
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Cosine
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Hits> {
        if query.iter().any(|x| !x.is_finite()) {
            return Err(Error::IndexBackend("query contains non-finite components".into()));
        }
        let mut q = Vec::with_capacity(query.len());
        normalize_into(query, &mut q);

        let n = self.normalized.len();
        let mut scored: Vec<(f32, usize)> = (0..n)
            .map(|i| {
                let sim: f32 = self.normalized.row(i).iter().zip(&q).map(|(a, b)| a * b).sum();
                (1.0 - sim, i)
            })
            .collect();

        if k < n {
            scored.select_nth_unstable_by(k - 1, by_distance);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_distance);
        Ok(Hits::from_pairs(scored))
    }
}
