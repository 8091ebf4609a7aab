//! In-memory geometric host.
//!
//! This is the reference implementation of `GeometricHost`.
//!
//! - **Main index**: additions accumulate in a pending buffer; a commit
//!   folds them into the authoritative set and rebuilds a fresh
//!   `SpatialIndex`, published by swapping an `Arc`. Readers holding the
//!   previous snapshot keep a consistent view.
//! - **Shells**: one per configured dimension. Every added vector is
//!   projected into every shell. A spin marks the shell's proximity index
//!   stale until it is refreshed.
//! - **Graph**: a `GraphStore` behind an `RwLock`.
//!
//! ## Limitations
//!
//! - **Writes are not atomic across structures**: each structure has its
//!   own lock. The executor's single-writer discipline is what keeps them
//!   consistent; readers may observe a shell spun but not yet re-indexed.
//! - **No persistence**: everything lives for the process lifetime.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::debug;

use crate::config::HostConfig;
use crate::graph::{GraphStore, COMMUNITY_KEY};
use crate::model::{NodeId, PropertyMap, Value};
use crate::spatial::{Hits, SpatialIndex};
use crate::writer::WriterToken;
use crate::{Error, Result};
use super::{GeometricHost, GraphMutation, Plane, Shell};

// ============================================================================
// IndexSnapshot
// ============================================================================

/// An immutable index plus the node id of each row.
#[derive(Debug)]
pub struct IndexSnapshot {
    index: SpatialIndex,
    ids: Vec<NodeId>,
}

impl IndexSnapshot {
    fn build(dim: usize, ids: Vec<NodeId>, vectors: &[Vec<f32>]) -> Result<Self> {
        Ok(Self { index: SpatialIndex::build(dim, vectors)?, ids })
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The `k` nearest node ids with their distances. Sentinel slots from a
    /// degraded query are dropped.
    pub fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        let hits = self.index.query(vector, k)?.into_single().unwrap_or_default();
        Ok(self.resolve(&hits))
    }

    fn resolve(&self, hits: &Hits) -> Vec<(NodeId, f32)> {
        hits.iter()
            .filter_map(|(d, i)| {
                let i = usize::try_from(i).ok()?;
                self.ids.get(i).map(|id| (id.clone(), d))
            })
            .collect()
    }
}

// ============================================================================
// MemoryHost
// ============================================================================

#[derive(Default)]
struct Committed {
    ids: Vec<NodeId>,
    vectors: Vec<Vec<f32>>,
    /// id → row in `ids` / `vectors`
    position: HashMap<NodeId, usize>,
}

impl Committed {
    fn upsert(&mut self, id: NodeId, vector: Vec<f32>) {
        match self.position.get(&id) {
            Some(&p) => self.vectors[p] = vector,
            None => {
                self.position.insert(id.clone(), self.ids.len());
                self.ids.push(id);
                self.vectors.push(vector);
            }
        }
    }
}

/// In-memory geometric storage, shells, proximity engine and graph.
pub struct MemoryHost {
    config: HostConfig,
    pending: Mutex<Vec<(NodeId, Vec<f32>)>>,
    committed: Mutex<Committed>,
    main: RwLock<Arc<IndexSnapshot>>,
    shells: RwLock<BTreeMap<usize, Shell>>,
    shell_indices: RwLock<HashMap<usize, Arc<IndexSnapshot>>>,
    /// Shells whose proximity index lags their vectors.
    stale: Mutex<BTreeSet<usize>>,
    graph: RwLock<GraphStore>,
}

impl MemoryHost {
    pub fn new(config: HostConfig) -> Result<Self> {
        config.validate()?;
        let shells: BTreeMap<usize, Shell> =
            config.shell_dims.iter().map(|&d| (d, Shell::new(d))).collect();
        let mut shell_indices = HashMap::with_capacity(shells.len());
        for &d in shells.keys() {
            shell_indices.insert(d, Arc::new(IndexSnapshot::build(d, Vec::new(), &[])?));
        }
        let main = Arc::new(IndexSnapshot::build(config.embed_dim, Vec::new(), &[])?);

        Ok(Self {
            config,
            pending: Mutex::new(Vec::new()),
            committed: Mutex::new(Committed::default()),
            main: RwLock::new(main),
            shells: RwLock::new(shells),
            shell_indices: RwLock::new(shell_indices),
            stale: Mutex::new(BTreeSet::new()),
            graph: RwLock::new(GraphStore::new()),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    // ========================================================================
    // Concurrent reads (never routed through the executor)
    // ========================================================================

    /// Current main index snapshot.
    pub fn main_index(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.main.read())
    }

    /// Nearest committed nodes to `vector`.
    pub fn nearest(&self, vector: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        self.main_index().nearest(vector, k)
    }

    /// Current proximity index of shell `dim`.
    pub fn shell_index(&self, dim: usize) -> Option<Arc<IndexSnapshot>> {
        self.shell_indices.read().get(&dim).cloned()
    }

    /// Nearest nodes inside shell `dim`, as of its last refresh.
    pub fn shell_nearest(&self, dim: usize, vector: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        self.shell_index(dim)
            .ok_or_else(|| Error::NotFound(format!("shell {dim}")))?
            .nearest(vector, k)
    }

    /// Copy of shell `dim`.
    pub fn shell(&self, dim: usize) -> Option<Shell> {
        self.shells.read().get(&dim).cloned()
    }

    pub fn shell_dims(&self) -> Vec<usize> {
        self.shells.read().keys().copied().collect()
    }

    pub fn is_shell_stale(&self, dim: usize) -> bool {
        self.stale.lock().contains(&dim)
    }

    /// Additions buffered since the last commit.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Read access to the graph.
    pub fn graph(&self) -> RwLockReadGuard<'_, GraphStore> {
        self.graph.read()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn rebuild_shell_index(&self, dim: usize) -> Result<bool> {
        let snapshot = {
            let shells = self.shells.read();
            let Some(shell) = shells.get(&dim) else {
                return Ok(false);
            };
            IndexSnapshot::build(dim, shell.ids().to_vec(), shell.vectors())?
        };
        self.shell_indices.write().insert(dim, Arc::new(snapshot));
        self.stale.lock().remove(&dim);
        Ok(true)
    }
}

// ============================================================================
// GeometricHost impl
// ============================================================================

impl GeometricHost for MemoryHost {
    fn add_node(
        &self,
        writer: &WriterToken,
        id: NodeId,
        vector: Vec<f32>,
        attrs: PropertyMap,
    ) -> Result<Value> {
        writer.debug_assert_held();
        if vector.len() != self.config.embed_dim {
            return Err(Error::DimensionMismatch { expected: self.config.embed_dim, got: vector.len() });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidArgument(format!("vector for {id} has non-finite components")));
        }

        {
            let mut shells = self.shells.write();
            let mut stale = self.stale.lock();
            for (dim, shell) in shells.iter_mut() {
                shell.upsert(id.clone(), &vector);
                stale.insert(*dim);
            }
        }
        self.graph.write().add_node(id.clone(), attrs);

        let mut pending = self.pending.lock();
        match pending.iter_mut().find(|(p, _)| *p == id) {
            Some(slot) => slot.1 = vector,
            None => pending.push((id.clone(), vector)),
        }
        debug!(node = %id, pending = pending.len(), op = %writer.op(), "node buffered");
        Ok(Value::String(id.0))
    }

    fn commit_pending(&self, writer: &WriterToken) -> Result<usize> {
        writer.debug_assert_held();
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return Ok(0);
        }
        let count = drained.len();

        let snapshot = {
            let mut committed = self.committed.lock();
            for (id, vector) in drained {
                committed.upsert(id, vector);
            }
            IndexSnapshot::build(self.config.embed_dim, committed.ids.clone(), &committed.vectors)?
        };
        let total = snapshot.len();
        *self.main.write() = Arc::new(snapshot);

        debug!(committed = count, total, op = %writer.op(), "main index rebuilt");
        Ok(count)
    }

    /// Refreshes every shell index left stale by additions or spins.
    fn anneal_secondary(&self, writer: &WriterToken) -> Result<()> {
        writer.debug_assert_held();
        let dims: Vec<usize> = self.stale.lock().iter().copied().collect();
        for dim in dims {
            self.rebuild_shell_index(dim)?;
        }
        Ok(())
    }

    fn spin_shell(&self, writer: &WriterToken, dim: usize, planes: &[Plane], angle: f64) -> Result<bool> {
        writer.debug_assert_held();
        let mut shells = self.shells.write();
        let Some(shell) = shells.get_mut(&dim) else {
            debug!(dim, "spin requested for unknown shell");
            return Ok(false);
        };
        shell.spin_with_bivector(planes, angle)?;
        self.stale.lock().insert(dim);
        Ok(true)
    }

    fn refresh_shell_index(&self, writer: &WriterToken, dim: usize) -> Result<bool> {
        writer.debug_assert_held();
        self.rebuild_shell_index(dim)
    }

    fn mutate_graph(&self, writer: &WriterToken, mutation: GraphMutation) -> Result<Value> {
        writer.debug_assert_held();
        let mut graph = self.graph.write();
        match mutation {
            GraphMutation::AddEdge { source, target, attrs } => {
                graph.add_edge(source, target, attrs)?;
                Ok(Value::Bool(true))
            }
            GraphMutation::Increment { source, target, delta, bounds, attrs } => {
                let bounds = bounds.unwrap_or(self.config.weight_bounds);
                let update = graph.increment_edge_weight(source, target, delta, bounds, attrs);
                serde_json::to_value(&update)
                    .map(json_to_value)
                    .map_err(|e| Error::InvalidArgument(e.to_string()))
            }
        }
    }

    fn detect_communities(&self, writer: &WriterToken, key: &str) -> Result<Value> {
        writer.debug_assert_held();
        let key = if key.is_empty() { COMMUNITY_KEY } else { key };
        let outcome = self.graph.write().compute_and_store_communities(key);
        Ok(match outcome.communities() {
            Some(c) => Value::from(c.len()),
            None => Value::Null,
        })
    }
}

/// Plain JSON → `Value`; numbers become `Int` when integral.
fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map_or(Value::Null, Value::Float),
        },
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => {
            Value::Map(map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props;
    use crate::writer::WriterMark;

    fn with_writer<T>(f: impl FnOnce(&WriterToken) -> T) -> T {
        let _mark = WriterMark::enter();
        let token = WriterToken::mint(0, crate::op::OpId(0));
        f(&token)
    }

    fn host() -> MemoryHost {
        MemoryHost::new(HostConfig::new(3).with_shells([2, 4])).unwrap()
    }

    #[test]
    fn test_additions_invisible_until_commit() {
        let host = host();
        with_writer(|w| host.add_node(w, "a".into(), vec![1.0, 0.0, 0.0], PropertyMap::new())).unwrap();
        assert_eq!(host.pending_count(), 1);
        assert!(host.main_index().is_empty());

        let committed = with_writer(|w| host.commit_pending(w)).unwrap();
        assert_eq!(committed, 1);
        assert_eq!(host.pending_count(), 0);
        assert_eq!(host.main_index().len(), 1);
        assert_eq!(host.nearest(&[1.0, 0.0, 0.0], 1).unwrap()[0].0, NodeId::from("a"));
    }

    #[test]
    fn test_old_snapshot_survives_commit() {
        let host = host();
        with_writer(|w| {
            host.add_node(w, "a".into(), vec![1.0, 0.0, 0.0], PropertyMap::new()).unwrap();
            host.commit_pending(w).unwrap();
        });
        let before = host.main_index();
        with_writer(|w| {
            host.add_node(w, "b".into(), vec![0.0, 1.0, 0.0], PropertyMap::new()).unwrap();
            host.commit_pending(w).unwrap();
        });
        assert_eq!(before.len(), 1);
        assert_eq!(host.main_index().len(), 2);
    }

    #[test]
    fn test_readding_replaces_vector() {
        let host = host();
        with_writer(|w| {
            host.add_node(w, "a".into(), vec![1.0, 0.0, 0.0], PropertyMap::new()).unwrap();
            host.commit_pending(w).unwrap();
            host.add_node(w, "a".into(), vec![0.0, 0.0, 1.0], PropertyMap::new()).unwrap();
            host.commit_pending(w).unwrap();
        });
        assert_eq!(host.main_index().len(), 1);
    }

    #[test]
    fn test_add_node_validates_vector() {
        let host = host();
        let err = with_writer(|w| host.add_node(w, "a".into(), vec![1.0], PropertyMap::new())).unwrap_err();
        assert_eq!(err, Error::DimensionMismatch { expected: 3, got: 1 });
        assert_eq!(host.pending_count(), 0);
    }

    #[test]
    fn test_shells_track_staleness() {
        let host = host();
        with_writer(|w| host.add_node(w, "a".into(), vec![1.0, 2.0, 3.0], props! { "k" => 1 })).unwrap();
        assert_eq!(host.shell(4).unwrap().get(&"a".into()), Some(&[1.0, 2.0, 3.0, 0.0][..]));
        assert!(host.is_shell_stale(2));

        with_writer(|w| host.anneal_secondary(w)).unwrap();
        assert!(!host.is_shell_stale(2));
        assert_eq!(host.shell_index(2).unwrap().len(), 1);

        let spun = with_writer(|w| host.spin_shell(w, 2, &[Plane::new(0, 1, 1.0)], 0.3)).unwrap();
        assert!(spun);
        assert!(host.is_shell_stale(2));
        assert!(!with_writer(|w| host.spin_shell(w, 7, &[], 0.3)).unwrap());
    }

    #[test]
    fn test_graph_mutations() {
        let host = host();
        let out = with_writer(|w| {
            host.mutate_graph(w, GraphMutation::Increment {
                source: "a".into(),
                target: "b".into(),
                delta: 15.0,
                bounds: None,
                attrs: PropertyMap::new(),
            })
        })
        .unwrap();
        let map = out.as_map().unwrap();
        assert_eq!(map.get("status"), Some(&Value::from("created")));
        assert_eq!(map.get("weight").and_then(Value::as_float), Some(10.0));
        assert_eq!(host.graph().get_edge("a", "b").unwrap().weight, Some(10.0));
    }

    #[test]
    fn test_json_to_value() {
        let v = json_to_value(serde_json::json!({"a": [1, 2.5, null], "b": "x"}));
        let m = v.as_map().unwrap();
        assert_eq!(m.get("a"), Some(&Value::List(vec![Value::Int(1), Value::Float(2.5), Value::Null])));
        assert_eq!(m.get("b"), Some(&Value::from("x")));
    }
}
