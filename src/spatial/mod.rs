//! # Spatial Index
//!
//! Nearest-neighbor search over a fixed n×d `f32` matrix, built once and
//! never mutated. Geometric memory rebuilds a fresh index wholesale on
//! anneal and swaps it in; readers keep whatever snapshot they hold.
//!
//! ## Backends
//!
//! | Backend | Feature | Distance |
//! |---------|---------|----------|
//! | `InnerProduct` | `ip-search` | `1 − cos(q, x)` over L2-normalized vectors |
//! | `KdTree` | `kd-tree` | Euclidean |
//! | `BruteForce` | (always) | Euclidean |
//!
//! [`SpatialIndex::build`] picks the first available backend in that order.
//! Distances from different backends are NOT comparable.

mod brute;
#[cfg(feature = "ip-search")]
mod inner_product;
#[cfg(feature = "kd-tree")]
mod kdtree;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Number of recent query latencies kept for observability.
pub const LATENCY_WINDOW: usize = 128;

/// Distance reported for every slot of a degraded query.
pub const SENTINEL_DISTANCE: f32 = 1.0;
/// Index reported for every slot of a degraded query.
pub const SENTINEL_INDEX: i64 = -1;

// ============================================================================
// Backend choice and metric
// ============================================================================

/// How distances are measured by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// `1 − cosine similarity`, in [0, 2].
    Cosine,
    /// L2 distance.
    Euclidean,
}

/// Search strategy behind a [`SpatialIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpatialBackend {
    InnerProduct,
    KdTree,
    BruteForce,
}

impl SpatialBackend {
    /// Whether this backend was compiled in.
    pub fn is_available(self) -> bool {
        match self {
            SpatialBackend::InnerProduct => cfg!(feature = "ip-search"),
            SpatialBackend::KdTree => cfg!(feature = "kd-tree"),
            SpatialBackend::BruteForce => true,
        }
    }

    /// First available backend in priority order.
    pub fn preferred() -> Self {
        [SpatialBackend::InnerProduct, SpatialBackend::KdTree]
            .into_iter()
            .find(|b| b.is_available())
            .unwrap_or(SpatialBackend::BruteForce)
    }

    pub fn metric(self) -> DistanceMetric {
        match self {
            SpatialBackend::InnerProduct => DistanceMetric::Cosine,
            SpatialBackend::KdTree | SpatialBackend::BruteForce => DistanceMetric::Euclidean,
        }
    }
}

// ============================================================================
// Points
// ============================================================================

/// Row-major n×d matrix.
#[derive(Debug, Clone, Default)]
pub(crate) struct Points {
    data: Vec<f32>,
    dim: usize,
}

impl Points {
    pub(crate) fn len(&self) -> usize {
        if self.dim == 0 { 0 } else { self.data.len() / self.dim }
    }

    pub(crate) fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub(crate) fn dim(&self) -> usize {
        self.dim
    }
}

/// The capability every strategy exposes.
pub(crate) trait NeighborSearch: Send + Sync {
    fn build(points: Points) -> Self
    where
        Self: Sized;

    fn metric(&self) -> DistanceMetric;

    /// At most `k` neighbors of `query`, ascending by distance.
    /// `query.len()` equals the index dimension and `k >= 1`.
    fn search(&self, query: &[f32], k: usize) -> Result<Hits>;
}

/// Ascending order by distance, then index, so ties are deterministic.
pub(crate) fn by_distance(a: &(f32, usize), b: &(f32, usize)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

pub(crate) fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

// ============================================================================
// Query input / output
// ============================================================================

/// A single query vector or a batch of them.
#[derive(Debug, Clone, Copy)]
pub enum QueryInput<'a> {
    Single(&'a [f32]),
    Batch(&'a [Vec<f32>]),
}

impl<'a> From<&'a [f32]> for QueryInput<'a> {
    fn from(v: &'a [f32]) -> Self { QueryInput::Single(v) }
}
impl<'a, const N: usize> From<&'a [f32; N]> for QueryInput<'a> {
    fn from(v: &'a [f32; N]) -> Self { QueryInput::Single(v) }
}
impl<'a> From<&'a Vec<f32>> for QueryInput<'a> {
    fn from(v: &'a Vec<f32>) -> Self { QueryInput::Single(v) }
}
impl<'a> From<&'a [Vec<f32>]> for QueryInput<'a> {
    fn from(v: &'a [Vec<f32>]) -> Self { QueryInput::Batch(v) }
}
impl<'a> From<&'a Vec<Vec<f32>>> for QueryInput<'a> {
    fn from(v: &'a Vec<Vec<f32>>) -> Self { QueryInput::Batch(v) }
}

/// Neighbors of one query vector, ascending by distance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hits {
    pub distances: Vec<f32>,
    pub indices: Vec<i64>,
}

impl Hits {
    pub(crate) fn from_pairs(pairs: impl IntoIterator<Item = (f32, usize)>) -> Self {
        let (distances, indices) = pairs.into_iter().map(|(d, i)| (d, i as i64)).unzip();
        Self { distances, indices }
    }

    pub(crate) fn sentinel(k: usize) -> Self {
        Self {
            distances: vec![SENTINEL_DISTANCE; k],
            indices: vec![SENTINEL_INDEX; k],
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// True when every slot is the degraded-query sentinel.
    pub fn is_sentinel(&self) -> bool {
        !self.indices.is_empty() && self.indices.iter().all(|&i| i == SENTINEL_INDEX)
    }

    pub fn iter(&self) -> impl Iterator<Item = (f32, i64)> + '_ {
        self.distances.iter().copied().zip(self.indices.iter().copied())
    }
}

/// Query result, shaped like the input: flat for a single vector,
/// one row per query for a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Neighbors {
    Single(Hits),
    Batch(Vec<Hits>),
}

impl Neighbors {
    pub fn into_single(self) -> Option<Hits> {
        match self {
            Neighbors::Single(h) => Some(h),
            Neighbors::Batch(_) => None,
        }
    }

    pub fn into_batch(self) -> Vec<Hits> {
        match self {
            Neighbors::Single(h) => vec![h],
            Neighbors::Batch(rows) => rows,
        }
    }
}

/// Summary of the rolling latency window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub last_ms: f64,
}

// ============================================================================
// SpatialIndex
// ============================================================================

/// Immutable nearest-neighbor index. Safe to query from any thread.
pub struct SpatialIndex {
    backend: SpatialBackend,
    search: Box<dyn NeighborSearch>,
    len: usize,
    dim: usize,
    latency_ms: Mutex<VecDeque<f64>>,
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("backend", &self.backend)
            .field("len", &self.len)
            .field("dim", &self.dim)
            .finish()
    }
}

impl SpatialIndex {
    /// Build from rows using the preferred available backend.
    pub fn build(dim: usize, rows: &[Vec<f32>]) -> Result<Self> {
        Self::with_backend(dim, rows, SpatialBackend::preferred())
    }

    /// Build with an explicit backend. Fails if it was not compiled in.
    pub fn with_backend(dim: usize, rows: &[Vec<f32>], backend: SpatialBackend) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidArgument("index dimension must be at least 1".into()));
        }
        let mut data = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            if row.len() != dim {
                return Err(Error::DimensionMismatch { expected: dim, got: row.len() });
            }
            data.extend_from_slice(row);
        }
        let points = Points { data, dim };
        let len = points.len();

        let search: Box<dyn NeighborSearch> = match backend {
            #[cfg(feature = "ip-search")]
            SpatialBackend::InnerProduct => Box::new(inner_product::InnerProductSearch::build(points)),
            #[cfg(feature = "kd-tree")]
            SpatialBackend::KdTree => Box::new(kdtree::KdTreeSearch::build(points)),
            SpatialBackend::BruteForce => Box::new(brute::BruteForceSearch::build(points)),
            #[allow(unreachable_patterns)]
            other => {
                return Err(Error::IndexBackend(format!("{other:?} backend not compiled in")));
            }
        };

        Ok(Self {
            backend,
            search,
            len,
            dim,
            latency_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        })
    }

    /// An index with no points.
    pub fn empty(dim: usize) -> Result<Self> {
        Self::build(dim, &[])
    }

    pub fn backend(&self) -> SpatialBackend {
        self.backend
    }

    pub fn metric(&self) -> DistanceMetric {
        self.search.metric()
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The `k` nearest neighbors of each query vector.
    ///
    /// `k >= n` returns all n points. A backend failure during search is
    /// masked: the affected row becomes `k` sentinel slots
    /// (distance 1.0, index −1).
    pub fn query<'a>(&self, input: impl Into<QueryInput<'a>>, k: usize) -> Result<Neighbors> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be at least 1".into()));
        }
        let started = Instant::now();
        let input = input.into();

        let out = match input {
            QueryInput::Single(q) => Neighbors::Single(self.query_one(q, k)?),
            QueryInput::Batch(qs) => Neighbors::Batch(
                qs.iter().map(|q| self.query_one(q, k)).collect::<Result<Vec<_>>>()?,
            ),
        };

        self.record_latency(started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn query_one(&self, q: &[f32], k: usize) -> Result<Hits> {
        if q.len() != self.dim {
            return Err(Error::DimensionMismatch { expected: self.dim, got: q.len() });
        }
        if self.len == 0 {
            return Ok(Hits::default());
        }
        match self.search.search(q, k.min(self.len)) {
            Ok(hits) => Ok(hits),
            Err(e) => {
                warn!(backend = ?self.backend, error = %e, "spatial search failed; returning sentinel");
                Ok(Hits::sentinel(k))
            }
        }
    }

    fn record_latency(&self, ms: f64) {
        let mut window = self.latency_ms.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(ms);
    }

    /// Summary of the last [`LATENCY_WINDOW`] query latencies.
    pub fn latency(&self) -> LatencyStats {
        let window = self.latency_ms.lock();
        if window.is_empty() {
            return LatencyStats::default();
        }
        LatencyStats {
            samples: window.len(),
            mean_ms: window.iter().sum::<f64>() / window.len() as f64,
            max_ms: window.iter().copied().fold(0.0, f64::max),
            last_ms: window.back().copied().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn grid() -> Vec<Vec<f32>> {
        vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 2.0],
            vec![3.0, 3.0],
            vec![-1.0, -1.0],
        ]
    }

    fn all_backends() -> Vec<SpatialBackend> {
        [SpatialBackend::InnerProduct, SpatialBackend::KdTree, SpatialBackend::BruteForce]
            .into_iter()
            .filter(|b| b.is_available())
            .collect()
    }

    fn assert_complete_ascending(hits: &Hits, n: usize) {
        assert_eq!(hits.len(), n);
        let mut seen = hits.indices.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..n as i64).collect::<Vec<_>>());
        assert!(hits.distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_preferred_backend_priority() {
        let expected = if cfg!(feature = "ip-search") {
            SpatialBackend::InnerProduct
        } else if cfg!(feature = "kd-tree") {
            SpatialBackend::KdTree
        } else {
            SpatialBackend::BruteForce
        };
        assert_eq!(SpatialBackend::preferred(), expected);
        assert_eq!(SpatialIndex::build(2, &grid()).unwrap().backend(), expected);
    }

    #[test]
    fn test_len_matches_inserted() {
        let idx = SpatialIndex::build(2, &grid()).unwrap();
        assert_eq!(idx.len(), 5);
        assert_eq!(idx.dim(), 2);
    }

    #[test]
    fn test_k_at_least_n_returns_everything_sorted() {
        for backend in all_backends() {
            let idx = SpatialIndex::with_backend(2, &grid(), backend).unwrap();
            for k in [5, 6, 100] {
                let hits = idx.query(&[0.5, 0.5], k).unwrap().into_single().unwrap();
                assert_complete_ascending(&hits, 5);
            }
        }
    }

    #[test]
    fn test_euclidean_backends_agree() {
        let brute = SpatialIndex::with_backend(2, &grid(), SpatialBackend::BruteForce).unwrap();
        let hits = brute.query(&[0.9, 0.1], 2).unwrap().into_single().unwrap();
        assert_eq!(hits.indices, vec![1, 0]);
        assert!((hits.distances[0] - (0.02f32).sqrt()).abs() < 1e-6);

        #[cfg(feature = "kd-tree")]
        {
            let kd = SpatialIndex::with_backend(2, &grid(), SpatialBackend::KdTree).unwrap();
            let kd_hits = kd.query(&[0.9, 0.1], 2).unwrap().into_single().unwrap();
            assert_eq!(kd_hits, hits);
        }
    }

    #[cfg(feature = "ip-search")]
    #[test]
    fn test_inner_product_reports_cosine_distance() {
        let rows = vec![vec![1.0, 0.0], vec![0.0, 5.0], vec![-2.0, 0.0]];
        let idx = SpatialIndex::with_backend(2, &rows, SpatialBackend::InnerProduct).unwrap();
        assert_eq!(idx.metric(), DistanceMetric::Cosine);
        let hits = idx.query(&[3.0, 0.0], 3).unwrap().into_single().unwrap();
        assert_eq!(hits.indices, vec![0, 1, 2]);
        assert!(hits.distances[0].abs() < 1e-5);
        assert!((hits.distances[1] - 1.0).abs() < 1e-5);
        assert!((hits.distances[2] - 2.0).abs() < 1e-5);
    }

    #[cfg(feature = "ip-search")]
    #[test]
    fn test_backend_failure_degrades_to_sentinel() {
        let idx = SpatialIndex::with_backend(2, &grid(), SpatialBackend::InnerProduct).unwrap();
        let hits = idx.query(&[f32::NAN, 0.0], 3).unwrap().into_single().unwrap();
        assert!(hits.is_sentinel());
        assert_eq!(hits.distances, vec![SENTINEL_DISTANCE; 3]);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_batch_shape_mirrors_input() {
        let idx = SpatialIndex::build(2, &grid()).unwrap();
        let batch = vec![vec![0.0, 0.0], vec![3.0, 3.0]];
        match idx.query(&batch, 2).unwrap() {
            Neighbors::Batch(rows) => {
                assert_eq!(rows.len(), 2);
                assert!(rows.iter().all(|r| r.len() == 2));
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_queries_rejected() {
        let idx = SpatialIndex::build(2, &grid()).unwrap();
        assert!(matches!(idx.query(&[0.0, 0.0], 0), Err(Error::InvalidArgument(_))));
        assert_eq!(
            idx.query(&[0.0, 0.0, 0.0], 1).unwrap_err(),
            Error::DimensionMismatch { expected: 2, got: 3 }
        );
        assert!(SpatialIndex::build(2, &[vec![1.0]]).is_err());
    }

    #[test]
    fn test_empty_index_returns_no_hits() {
        let idx = SpatialIndex::empty(3).unwrap();
        assert!(idx.is_empty());
        let hits = idx.query(&[1.0, 2.0, 3.0], 4).unwrap().into_single().unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let idx = SpatialIndex::build(2, &grid()).unwrap();
        for _ in 0..(LATENCY_WINDOW + 20) {
            idx.query(&[0.0, 0.0], 1).unwrap();
        }
        let stats = idx.latency();
        assert_eq!(stats.samples, LATENCY_WINDOW);
        assert!(stats.max_ms >= stats.mean_ms);
    }

    proptest! {
        #[test]
        fn prop_full_query_is_a_sorted_permutation(
            rows in prop::collection::vec(prop::collection::vec(-100.0f32..100.0, 3), 1..40),
            q in prop::collection::vec(-100.0f32..100.0, 3),
            extra in 0usize..5,
        ) {
            for backend in all_backends() {
                let idx = SpatialIndex::with_backend(3, &rows, backend).unwrap();
                let hits = idx.query(&q, rows.len() + extra).unwrap().into_single().unwrap();
                prop_assert_eq!(hits.len(), rows.len());
                let mut seen = hits.indices.clone();
                seen.sort_unstable();
                seen.dedup();
                prop_assert_eq!(seen.len(), rows.len());
                prop_assert!(seen.iter().all(|&i| i >= 0 && (i as usize) < rows.len()));
                prop_assert!(hits.distances.windows(2).all(|w| w[0] <= w[1]));
            }
        }

        #[test]
        fn prop_kdtree_matches_brute_force(
            rows in prop::collection::vec(prop::collection::vec(-50.0f32..50.0, 4), 1..60),
            q in prop::collection::vec(-50.0f32..50.0, 4),
            k in 1usize..10,
        ) {
            let brute = SpatialIndex::with_backend(4, &rows, SpatialBackend::BruteForce).unwrap();
            let expected = brute.query(&q, k).unwrap().into_single().unwrap();
            if SpatialBackend::KdTree.is_available() {
                let kd = SpatialIndex::with_backend(4, &rows, SpatialBackend::KdTree).unwrap();
                let got = kd.query(&q, k).unwrap().into_single().unwrap();
                prop_assert_eq!(got.indices, expected.indices);
            }
        }
    }
}
