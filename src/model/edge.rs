//! Undirected weighted edge in the graph store.

use serde::{Deserialize, Serialize};
use super::{NodeId, PropertyMap, Value};

/// Unordered endpoint pair. `EdgeKey::new(a, b) == EdgeKey::new(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    lo: NodeId,
    hi: NodeId,
}

impl EdgeKey {
    pub fn new(a: impl Into<NodeId>, b: impl Into<NodeId>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b { Self { lo: a, hi: b } } else { Self { lo: b, hi: a } }
    }

    pub fn endpoints(&self) -> (&NodeId, &NodeId) {
        (&self.lo, &self.hi)
    }

    pub fn is_self_loop(&self) -> bool {
        self.lo == self.hi
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}--{}", self.lo, self.hi)
    }
}

/// Edge payload. `weight` is `None` until something sets it; accounting
/// treats a missing weight as 0.0, community detection as 1.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub weight: Option<f64>,
    pub attributes: PropertyMap,
}

impl Edge {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}
