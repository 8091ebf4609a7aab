//! # Geometric Host
//!
//! The contract between the executor's handlers and whatever owns the
//! geometry. Every mutating method takes a [`WriterToken`], which only the
//! executor can mint, so mutations outside a handler do not type-check.
//!
//! ## Implementations
//!
//! | Host | Module | Description |
//! |------|--------|-------------|
//! | `MemoryHost` | `memory` | In-memory buffer, shells, proximity indices, graph |

pub mod memory;

use serde::{Deserialize, Serialize};

use crate::config::WeightBounds;
use crate::model::{NodeId, PropertyMap, Value};
use crate::writer::WriterToken;
use crate::{Error, Result};

pub use memory::{IndexSnapshot, MemoryHost};

// ============================================================================
// Shell
// ============================================================================

/// One rotation plane of a bivector: rotate axes `i`→`j` by `angle × coeff`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub i: usize,
    pub j: usize,
    pub coeff: f64,
}

impl Plane {
    pub fn new(i: usize, j: usize, coeff: f64) -> Self {
        Self { i, j, coeff }
    }
}

/// Per-dimension unit of geometric memory: a vector subset that supports
/// rotational transforms.
#[derive(Debug, Clone, PartialEq)]
pub struct Shell {
    dim: usize,
    ids: Vec<NodeId>,
    vectors: Vec<Vec<f32>>,
}

impl Shell {
    pub fn new(dim: usize) -> Self {
        Self { dim, ids: Vec::new(), vectors: Vec::new() }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn get(&self, id: &NodeId) -> Option<&[f32]> {
        self.ids.iter().position(|x| x == id).map(|p| self.vectors[p].as_slice())
    }

    /// Truncate or zero-pad `v` to the shell dimension.
    pub fn project(&self, v: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.dim];
        let n = v.len().min(self.dim);
        out[..n].copy_from_slice(&v[..n]);
        out
    }

    /// Insert or replace the projection of `v` under `id`.
    pub fn upsert(&mut self, id: NodeId, v: &[f32]) {
        let projected = self.project(v);
        match self.ids.iter().position(|x| *x == id) {
            Some(p) => self.vectors[p] = projected,
            None => {
                self.ids.push(id);
                self.vectors.push(projected);
            }
        }
    }

    /// Rotate every vector by the product of one Givens rotation per plane,
    /// applied in order. Norms are preserved.
    pub fn spin_with_bivector(&mut self, planes: &[Plane], angle: f64) -> Result<()> {
        for p in planes {
            if p.i >= self.dim || p.j >= self.dim || p.i == p.j {
                return Err(Error::InvalidArgument(format!(
                    "plane ({}, {}) invalid for shell of dim {}",
                    p.i, p.j, self.dim
                )));
            }
            if !p.coeff.is_finite() {
                return Err(Error::InvalidArgument(format!("non-finite coefficient {}", p.coeff)));
            }
        }
        if !angle.is_finite() {
            return Err(Error::InvalidArgument(format!("non-finite angle {angle}")));
        }

        for p in planes {
            let theta = angle * p.coeff;
            if theta == 0.0 {
                continue;
            }
            let (sin, cos) = theta.sin_cos();
            let (sin, cos) = (sin as f32, cos as f32);
            for v in &mut self.vectors {
                let (xi, xj) = (v[p.i], v[p.j]);
                v[p.i] = cos * xi - sin * xj;
                v[p.j] = sin * xi + cos * xj;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Graph mutation
// ============================================================================

/// Edge change requested through `GRAPH_MOD`.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphMutation {
    /// Create or overlay an edge.
    AddEdge { source: NodeId, target: NodeId, attrs: PropertyMap },
    /// Best-effort weight accounting; `bounds: None` uses the host default.
    Increment {
        source: NodeId,
        target: NodeId,
        delta: f64,
        bounds: Option<WeightBounds>,
        attrs: PropertyMap,
    },
}

// ============================================================================
// GeometricHost Trait
// ============================================================================

/// Capabilities the executor's handlers consume.
///
/// Implementations may assume each call runs inside a handler on a writer
/// thread; the token is the proof.
pub trait GeometricHost: Send + Sync + 'static {
    /// Buffer a node for the next commit. Returns the stored node id.
    fn add_node(
        &self,
        writer: &WriterToken,
        id: NodeId,
        vector: Vec<f32>,
        attrs: PropertyMap,
    ) -> Result<Value>;

    /// Move buffered additions into the authoritative index, rebuilding it
    /// wholesale. Returns how many additions were committed.
    fn commit_pending(&self, writer: &WriterToken) -> Result<usize>;

    /// Lightweight secondary-index maintenance after a commit.
    ///
    /// Default: nothing to do.
    fn anneal_secondary(&self, _writer: &WriterToken) -> Result<()> {
        Ok(())
    }

    /// Rotate the shell of dimension `dim`. `Ok(false)` if there is no such shell.
    fn spin_shell(&self, writer: &WriterToken, dim: usize, planes: &[Plane], angle: f64) -> Result<bool>;

    /// Rebuild the proximity index of shell `dim`. `Ok(false)` if there is no such shell.
    fn refresh_shell_index(&self, writer: &WriterToken, dim: usize) -> Result<bool>;

    /// Apply one edge mutation.
    fn mutate_graph(&self, writer: &WriterToken, mutation: GraphMutation) -> Result<Value>;

    /// Recompute graph communities, stamping labels under `key`.
    ///
    /// Default: not supported, resolves to `Value::Null`.
    fn detect_communities(&self, _writer: &WriterToken, _key: &str) -> Result<Value> {
        Ok(Value::Null)
    }
}
