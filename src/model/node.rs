//! Node identity shared by the graph store and geometric memory.

use serde::{Deserialize, Serialize};

/// Opaque node identifier.
///
/// The same id names a node's graph vertex and its vector in geometric memory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self { NodeId(s.to_owned()) }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self { NodeId(s) }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self { id.clone() }
}
