//! # Graph Store
//!
//! Undirected weighted graph of conceptual relationships.
//!
//! Nodes carry an attribute map; edges are keyed by an unordered pair
//! and carry an optional weight plus attributes. Two accounting paths are
//! best-effort and never propagate failures:
//!
//! - [`GraphStore::increment_edge_weight`] returns an [`EdgeUpdate`]
//! - [`GraphStore::compute_and_store_communities`] returns a [`CommunityOutcome`]
//!
//! Both log skipped/failed work at warn level so callers can keep going.
//!
//! ## Limitations
//!
//! - **No locking**: the store is plain data. Geometric memory wraps it in
//!   an `RwLock` and only mutates it from executor handlers.
//! - **No self-loops**: an edge needs two distinct endpoints.
//! - **Stale communities**: `community_id` reflects the last partition run
//!   only; later edge changes do not update it.

#[cfg(feature = "communities")]
mod louvain;

use std::collections::BTreeSet;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::WeightBounds;
use crate::model::{Edge, EdgeKey, NodeId, PropertyMap, Value};
use crate::{Error, Result};

/// Default attribute key stamped by community detection.
pub const COMMUNITY_KEY: &str = "community_id";

/// Below this many nodes a partition is statistically meaningless.
pub const MIN_COMMUNITY_NODES: usize = 10;

/// Attribute key that `add_edge` lifts into [`Edge::weight`].
const WEIGHT_ATTR: &str = "weight";

// ============================================================================
// Outcomes
// ============================================================================

/// Result of a best-effort weight increment: applied or skipped, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EdgeUpdate {
    Created { weight: f64 },
    Updated { previous: f64, weight: f64 },
    Skipped { reason: String },
}

impl EdgeUpdate {
    pub fn is_applied(&self) -> bool {
        !matches!(self, EdgeUpdate::Skipped { .. })
    }

    /// Weight after the update, if it was applied.
    pub fn weight(&self) -> Option<f64> {
        match self {
            EdgeUpdate::Created { weight } | EdgeUpdate::Updated { weight, .. } => Some(*weight),
            EdgeUpdate::Skipped { .. } => None,
        }
    }
}

/// Result of a community-detection run.
#[derive(Debug, Clone, PartialEq)]
pub enum CommunityOutcome {
    /// Fewer than [`MIN_COMMUNITY_NODES`] nodes; nothing was written.
    TooSmall { nodes: usize },
    /// Detection not compiled in; nothing was written.
    Unavailable,
    /// Every node was stamped with the index of its community.
    Assigned { communities: Vec<Vec<NodeId>>, modularity: f64 },
    /// Detection failed; any labels already written stay.
    Failed { reason: String },
}

impl CommunityOutcome {
    pub fn communities(&self) -> Option<&[Vec<NodeId>]> {
        match self {
            CommunityOutcome::Assigned { communities, .. } => Some(communities),
            _ => None,
        }
    }
}

// ============================================================================
// Snapshot (node-link JSON)
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    id: NodeId,
    #[serde(default)]
    attributes: PropertyMap,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinkRecord {
    source: NodeId,
    target: NodeId,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    attributes: PropertyMap,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    nodes: Vec<NodeRecord>,
    links: Vec<LinkRecord>,
}

// ============================================================================
// GraphStore
// ============================================================================

/// Weighted undirected graph with attribute maps.
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    nodes: HashMap<NodeId, PropertyMap>,
    edges: HashMap<EdgeKey, Edge>,
    /// node → neighbors, kept sorted for deterministic iteration
    adjacency: HashMap<NodeId, BTreeSet<NodeId>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Create a node, or overlay `attrs` onto an existing one.
    pub fn add_node(&mut self, id: impl Into<NodeId>, attrs: PropertyMap) {
        let id = id.into();
        self.adjacency.entry(id.clone()).or_default();
        self.nodes.entry(id).or_default().extend(attrs);
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&PropertyMap> {
        self.nodes.get(id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Neighbor ids in ascending order. Unknown nodes have none.
    pub fn get_neighbors(&self, id: &NodeId) -> Vec<NodeId> {
        self.adjacency
            .get(id)
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ========================================================================
    // Edges
    // ========================================================================

    /// Create an edge (and any missing endpoint), or overlay `attrs` onto an
    /// existing one. A numeric `weight` attribute sets the edge weight.
    pub fn add_edge(
        &mut self,
        u: impl Into<NodeId>,
        v: impl Into<NodeId>,
        mut attrs: PropertyMap,
    ) -> Result<()> {
        let key = EdgeKey::new(u, v);
        if key.is_self_loop() {
            return Err(Error::InvalidArgument(format!("self-loop on {}", key.endpoints().0)));
        }
        let weight = match attrs.remove(WEIGHT_ATTR) {
            None => None,
            Some(w) => match w.as_float() {
                Some(w) if w.is_finite() => Some(w),
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "edge weight must be a finite number, got {}",
                        w.type_name()
                    )));
                }
            },
        };

        let edge = self.ensure_edge(key);
        if weight.is_some() {
            edge.weight = weight;
        }
        edge.attributes.extend(attrs);
        Ok(())
    }

    pub fn get_edge(&self, u: impl Into<NodeId>, v: impl Into<NodeId>) -> Option<&Edge> {
        self.edges.get(&EdgeKey::new(u, v))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn ensure_edge(&mut self, key: EdgeKey) -> &mut Edge {
        let (a, b) = key.endpoints();
        let (a, b) = (a.clone(), b.clone());
        self.nodes.entry(a.clone()).or_default();
        self.nodes.entry(b.clone()).or_default();
        self.adjacency.entry(a.clone()).or_default().insert(b.clone());
        self.adjacency.entry(b).or_default().insert(a);
        self.edges.entry(key).or_default()
    }

    /// Add `delta` to the weight of edge `u-v`, clamping into `bounds`.
    ///
    /// - absent edge: created with weight `max(min, delta)` (capped at `max`)
    /// - present edge: `clamp(current + delta)`, where an unset weight counts as 0.0
    ///
    /// Then each supplied attribute replaces the stored value under its key.
    /// Invalid input is logged and reported as [`EdgeUpdate::Skipped`].
    pub fn increment_edge_weight(
        &mut self,
        u: impl Into<NodeId>,
        v: impl Into<NodeId>,
        delta: f64,
        bounds: WeightBounds,
        attrs: PropertyMap,
    ) -> EdgeUpdate {
        let key = EdgeKey::new(u, v);
        let skipped = |reason: String| {
            warn!(edge = %key, %reason, "edge weight increment skipped");
            EdgeUpdate::Skipped { reason }
        };

        if key.is_self_loop() {
            return skipped("self-loop".into());
        }
        if !delta.is_finite() {
            return skipped(format!("non-finite delta {delta}"));
        }
        if !bounds.is_valid() {
            return skipped(format!("invalid bounds [{}, {}]", bounds.min, bounds.max));
        }

        let update = match self.edges.get_mut(&key) {
            Some(edge) => {
                let previous = edge.weight.unwrap_or(0.0);
                let weight = bounds.clamp(previous + delta);
                edge.weight = Some(weight);
                edge.attributes.extend(attrs);
                EdgeUpdate::Updated { previous, weight }
            }
            None => {
                let weight = bounds.clamp(delta.max(bounds.min));
                let edge = self.ensure_edge(key.clone());
                edge.weight = Some(weight);
                edge.attributes.extend(attrs);
                EdgeUpdate::Created { weight }
            }
        };
        debug!(edge = %key, ?update, "edge weight incremented");
        update
    }

    // ========================================================================
    // Communities
    // ========================================================================

    /// Partition the graph by modularity and stamp every node with its
    /// zero-based community index under `key`.
    pub fn compute_and_store_communities(&mut self, key: &str) -> CommunityOutcome {
        let n = self.nodes.len();
        if n < MIN_COMMUNITY_NODES {
            debug!(nodes = n, "graph too small for community detection");
            return CommunityOutcome::TooSmall { nodes: n };
        }
        self.detect_and_stamp(key)
    }

    #[cfg(not(feature = "communities"))]
    fn detect_and_stamp(&mut self, _key: &str) -> CommunityOutcome {
        CommunityOutcome::Unavailable
    }

    #[cfg(feature = "communities")]
    fn detect_and_stamp(&mut self, key: &str) -> CommunityOutcome {
        let (ids, weighted) = self.weighted_view();
        let labels = match louvain::partition(&weighted) {
            Ok(labels) => labels,
            Err(e) => {
                warn!(error = %e, "community detection failed");
                return CommunityOutcome::Failed { reason: e.to_string() };
            }
        };
        let modularity = louvain::modularity(&weighted, &labels);

        let count = labels.iter().copied().max().map_or(0, |c| c + 1);
        let mut communities: Vec<Vec<NodeId>> = vec![Vec::new(); count];
        for (id, &label) in ids.iter().zip(&labels) {
            communities[label].push(id.clone());
        }

        for (index, members) in communities.iter().enumerate() {
            for id in members {
                match self.nodes.get_mut(id) {
                    Some(attrs) => {
                        attrs.insert(key.to_owned(), Value::from(index));
                    }
                    None => {
                        let reason = format!("node {id} vanished while stamping communities");
                        warn!(%reason, "community detection failed");
                        return CommunityOutcome::Failed { reason };
                    }
                }
            }
        }

        debug!(communities = count, modularity, "communities stored");
        CommunityOutcome::Assigned { communities, modularity }
    }

    /// Modularity of an arbitrary partition. Nodes missing from every
    /// community are treated as singletons.
    #[cfg(feature = "communities")]
    pub fn modularity(&self, communities: &[Vec<NodeId>]) -> f64 {
        let (ids, weighted) = self.weighted_view();
        let mut label_of: HashMap<&NodeId, usize> = HashMap::new();
        for (c, members) in communities.iter().enumerate() {
            for id in members {
                label_of.insert(id, c);
            }
        }
        let mut next = communities.len();
        let labels: Vec<usize> = ids
            .iter()
            .map(|id| {
                label_of.get(id).copied().unwrap_or_else(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect();
        louvain::modularity(&weighted, &labels)
    }

    /// Sorted ids plus an index-based adjacency; unset weights count as 1.0.
    #[cfg(feature = "communities")]
    fn weighted_view(&self) -> (Vec<NodeId>, louvain::WeightedGraph) {
        let ids = self.node_ids();
        let mut adj = vec![Vec::new(); ids.len()];
        {
            let index: HashMap<&NodeId, usize> = ids.iter().enumerate().map(|(i, id)| (id, i)).collect();
            let mut keys: Vec<&EdgeKey> = self.edges.keys().collect();
            keys.sort();
            for key in keys {
                let (a, b) = key.endpoints();
                let w = self.edges[key].weight.unwrap_or(1.0);
                let (ia, ib) = (index[a], index[b]);
                adj[ia].push((ib, w));
                adj[ib].push((ia, w));
            }
        }
        (ids, louvain::WeightedGraph { adj })
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Node-link JSON: `{"nodes": [...], "links": [...]}`, sorted by id.
    pub fn to_json(&self) -> serde_json::Value {
        let nodes = self
            .node_ids()
            .into_iter()
            .map(|id| NodeRecord { attributes: self.nodes[&id].clone(), id })
            .collect();
        let mut keys: Vec<&EdgeKey> = self.edges.keys().collect();
        keys.sort();
        let links = keys
            .into_iter()
            .map(|key| {
                let (a, b) = key.endpoints();
                let edge = &self.edges[key];
                LinkRecord {
                    source: a.clone(),
                    target: b.clone(),
                    weight: edge.weight,
                    attributes: edge.attributes.clone(),
                }
            })
            .collect();
        serde_json::to_value(Snapshot { nodes, links }).unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild a store from [`GraphStore::to_json`] output.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_value(value)
            .map_err(|e| Error::InvalidArgument(format!("graph snapshot: {e}")))?;
        let mut store = Self::new();
        for node in snapshot.nodes {
            store.add_node(node.id, node.attributes);
        }
        for link in snapshot.links {
            let mut attrs = link.attributes;
            if let Some(w) = link.weight {
                attrs.insert(WEIGHT_ATTR.into(), Value::Float(w));
            }
            store.add_edge(link.source, link.target, attrs)?;
        }
        Ok(store)
    }
}
