//! Exact kd-tree search, Euclidean distance.
//!
//! Built once: each split picks the axis with the widest spread and
//! partitions at the median with `select_nth_unstable_by`. Nodes live in
//! a flat arena. Search keeps a bounded max-heap of the best k candidates
//! and only descends into the far side when the splitting plane is within
//! the current worst distance.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{by_distance, squared_euclidean, DistanceMetric, Hits, NeighborSearch, Points};
use crate::Result;

const LEAF_SIZE: usize = 8;

enum KdNode {
    Leaf(Vec<usize>),
    Split { axis: usize, value: f32, left: usize, right: usize },
}

pub(crate) struct KdTreeSearch {
    points: Points,
    nodes: Vec<KdNode>,
    root: usize,
}

/// Heap entry ordered by (squared distance, index).
#[derive(Clone, Copy, PartialEq)]
struct Candidate(f32, usize);

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        by_distance(&(self.0, self.1), &(other.0, other.1))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl KdTreeSearch {
    fn build_node(points: &Points, idx: &mut [usize], nodes: &mut Vec<KdNode>) -> usize {
        if idx.len() <= LEAF_SIZE {
            nodes.push(KdNode::Leaf(idx.to_vec()));
            return nodes.len() - 1;
        }

        let axis = widest_axis(points, idx);
        let mid = idx.len() / 2;
        idx.select_nth_unstable_by(mid, |&a, &b| {
            points.row(a)[axis].total_cmp(&points.row(b)[axis])
        });
        let value = points.row(idx[mid])[axis];

        let (lo, hi) = idx.split_at_mut(mid);
        let left = Self::build_node(points, lo, nodes);
        let right = Self::build_node(points, hi, nodes);
        nodes.push(KdNode::Split { axis, value, left, right });
        nodes.len() - 1
    }

    fn visit(&self, node: usize, query: &[f32], k: usize, heap: &mut BinaryHeap<Candidate>) {
        match &self.nodes[node] {
            KdNode::Leaf(members) => {
                for &i in members {
                    let cand = Candidate(squared_euclidean(self.points.row(i), query), i);
                    if heap.len() < k {
                        heap.push(cand);
                    } else if heap.peek().is_some_and(|worst| cand < *worst) {
                        heap.pop();
                        heap.push(cand);
                    }
                }
            }
            KdNode::Split { axis, value, left, right } => {
                let diff = query[*axis] - value;
                let (near, far) = if diff < 0.0 { (*left, *right) } else { (*right, *left) };
                self.visit(near, query, k, heap);
                let plane = diff * diff;
                let worth_crossing = heap.len() < k || heap.peek().is_some_and(|worst| plane <= worst.0);
                if worth_crossing {
                    self.visit(far, query, k, heap);
                }
            }
        }
    }
}

fn widest_axis(points: &Points, idx: &[usize]) -> usize {
    (0..points.dim())
        .map(|axis| {
            let (lo, hi) = idx.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &i| {
                let v = points.row(i)[axis];
                (lo.min(v), hi.max(v))
            });
            (axis, hi - lo)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
        .map_or(0, |(axis, _)| axis)
}

impl NeighborSearch for KdTreeSearch {
    fn build(points: Points) -> Self {
        let mut idx: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::new();
        let root = Self::build_node(&points, &mut idx, &mut nodes);
        Self { points, nodes, root }
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Euclidean
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Hits> {
        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.visit(self.root, query, k, &mut heap);
        Ok(Hits::from_pairs(
            heap.into_sorted_vec().into_iter().map(|Candidate(d2, i)| (d2.sqrt(), i)),
        ))
    }
}
