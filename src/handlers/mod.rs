//! Mutation handlers: `OpKind` → routine run on a writer thread.
//!
//! Each handler receives the host, the writer token for the current call,
//! and the operation parameters. Handlers are synchronous; the executor
//! turns their `Err` (or panic) into `Error::HandlerFailure`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::WeightBounds;
use crate::graph::COMMUNITY_KEY;
use crate::host::{GeometricHost, GraphMutation, Plane};
use crate::model::{NodeId, PropertyMap, Value};
use crate::op::OpKind;
use crate::writer::WriterToken;
use crate::{Error, Result};

/// A mutation routine.
pub type Handler =
    Arc<dyn Fn(&dyn GeometricHost, &WriterToken, &PropertyMap) -> Result<Value> + Send + Sync>;

// ============================================================================
// Registry
// ============================================================================

/// Dispatch table consulted by workers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OpKind, Handler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(OpKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}

impl HandlerRegistry {
    /// An empty registry: every kind is a no-op.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in kinds.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(OpKind::AddNode, add_node);
        reg.register(OpKind::ShellSpin, shell_spin);
        reg.register(OpKind::UpdateShellIndex, update_shell_index);
        reg.register(OpKind::AnnealMainIndex, anneal_main_index);
        reg.register(OpKind::GraphMod, graph_mod);
        reg.register(OpKind::Communities, compute_communities);
        reg
    }

    /// Install (or replace) the handler for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<OpKind>, handler: F) -> &mut Self
    where
        F: Fn(&dyn GeometricHost, &WriterToken, &PropertyMap) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(kind.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, kind: &OpKind) -> Option<&Handler> {
        self.handlers.get(kind)
    }

    pub fn contains(&self, kind: &OpKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Run the handler for `kind`. Unknown kinds succeed with `Value::Null`.
    pub fn dispatch(
        &self,
        kind: &OpKind,
        host: &dyn GeometricHost,
        writer: &WriterToken,
        params: &PropertyMap,
    ) -> Result<Value> {
        match self.handlers.get(kind) {
            Some(handler) => handler(host, writer, params),
            None => {
                debug!(%kind, op_id = %writer.op(), "no handler registered, treating as no-op");
                Ok(Value::Null)
            }
        }
    }
}

// ============================================================================
// Parameter extraction
// ============================================================================

fn require<'a>(params: &'a PropertyMap, key: &str) -> Result<&'a Value> {
    match params.get(key) {
        Some(v) if !v.is_null() => Ok(v),
        _ => Err(Error::MissingParam(key.into())),
    }
}

fn require_str<'a>(params: &'a PropertyMap, key: &str) -> Result<&'a str> {
    let v = require(params, key)?;
    v.as_str()
        .ok_or_else(|| Error::InvalidArgument(format!("'{key}' must be a string, got {}", v.type_name())))
}

fn require_usize(params: &PropertyMap, key: &str) -> Result<usize> {
    let v = require(params, key)?;
    v.as_int()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| Error::InvalidArgument(format!("'{key}' must be a non-negative integer")))
}

fn require_vector(params: &PropertyMap, key: &str) -> Result<Vec<f32>> {
    require(params, key)?
        .as_vector()
        .ok_or_else(|| Error::InvalidArgument(format!("'{key}' must be a list of numbers")))
}

fn optional_f64(params: &PropertyMap, key: &str) -> Result<Option<f64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_float()
            .map(Some)
            .ok_or_else(|| Error::InvalidArgument(format!("'{key}' must be a number, got {}", v.type_name()))),
    }
}

fn optional_map(params: &PropertyMap, key: &str) -> Result<PropertyMap> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(PropertyMap::new()),
        Some(v) => v
            .as_map()
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("'{key}' must be a map, got {}", v.type_name()))),
    }
}

/// `[[i, j, coeff], ...]`
fn planes(params: &PropertyMap, key: &str) -> Result<Vec<Plane>> {
    let list = require(params, key)?
        .as_list()
        .ok_or_else(|| Error::InvalidArgument(format!("'{key}' must be a list of [i, j, coeff]")))?;
    list.iter()
        .map(|entry| {
            let bad = || Error::InvalidArgument(format!("bad plane {entry} in '{key}'"));
            match entry.as_list() {
                Some([i, j, c]) => {
                    let i = i.as_int().and_then(|i| usize::try_from(i).ok()).ok_or_else(bad)?;
                    let j = j.as_int().and_then(|j| usize::try_from(j).ok()).ok_or_else(bad)?;
                    let coeff = c.as_float().ok_or_else(bad)?;
                    Ok(Plane::new(i, j, coeff))
                }
                _ => Err(bad()),
            }
        })
        .collect()
}

// ============================================================================
// Built-in handlers
// ============================================================================

/// `ADD_NODE {id, vector, attrs?}` → node id
fn add_node(host: &dyn GeometricHost, w: &WriterToken, params: &PropertyMap) -> Result<Value> {
    let id = NodeId::from(require_str(params, "id")?);
    let vector = require_vector(params, "vector")?;
    let attrs = optional_map(params, "attrs")?;
    host.add_node(w, id, vector, attrs)
}

/// `SHELL_SPIN {dim, bivector, angle?}` → true
fn shell_spin(host: &dyn GeometricHost, w: &WriterToken, params: &PropertyMap) -> Result<Value> {
    let dim = require_usize(params, "dim")?;
    let planes = planes(params, "bivector")?;
    let angle = optional_f64(params, "angle")?.unwrap_or(0.0);
    if !host.spin_shell(w, dim, &planes, angle)? {
        debug!(dim, "no shell to spin");
    }
    Ok(Value::Bool(true))
}

/// `UPDATE_SHELL_INDEX {dim}` → true. Refresh failures are logged only.
fn update_shell_index(host: &dyn GeometricHost, w: &WriterToken, params: &PropertyMap) -> Result<Value> {
    let dim = require_usize(params, "dim")?;
    if let Err(e) = host.refresh_shell_index(w, dim) {
        warn!(dim, error = %e, "shell index refresh failed");
    }
    Ok(Value::Bool(true))
}

/// `ANNEAL_MAIN_INDEX {}` → true. Commit errors propagate; secondary
/// anneal errors are logged only.
fn anneal_main_index(host: &dyn GeometricHost, w: &WriterToken, _params: &PropertyMap) -> Result<Value> {
    let committed = host.commit_pending(w)?;
    if let Err(e) = host.anneal_secondary(w) {
        warn!(error = %e, "secondary anneal failed");
    }
    debug!(committed, "main index annealed");
    Ok(Value::Bool(true))
}

/// `GRAPH_MOD {source, target, delta?, min_w?, max_w?, attrs?}`
fn graph_mod(host: &dyn GeometricHost, w: &WriterToken, params: &PropertyMap) -> Result<Value> {
    let source = NodeId::from(require_str(params, "source")?);
    let target = NodeId::from(require_str(params, "target")?);
    let attrs = optional_map(params, "attrs")?;

    let mutation = match optional_f64(params, "delta")? {
        Some(delta) => {
            let min = optional_f64(params, "min_w")?;
            let max = optional_f64(params, "max_w")?;
            let bounds = match (min, max) {
                (None, None) => None,
                (min, max) => {
                    let default = WeightBounds::default();
                    Some(WeightBounds::new(min.unwrap_or(default.min), max.unwrap_or(default.max)))
                }
            };
            GraphMutation::Increment { source, target, delta, bounds, attrs }
        }
        None => GraphMutation::AddEdge { source, target, attrs },
    };
    host.mutate_graph(w, mutation)
}

/// `COMPUTE_COMMUNITIES {key?}` → community count, or null when skipped
fn compute_communities(host: &dyn GeometricHost, w: &WriterToken, params: &PropertyMap) -> Result<Value> {
    let key = match params.get("key") {
        None | Some(Value::Null) => COMMUNITY_KEY,
        Some(_) => require_str(params, "key")?,
    };
    host.detect_communities(w, key)
}
