//! Operations and their one-shot completion handles.
//!
//! An [`Operation`] is created per request, moves into the work queue,
//! is consumed by exactly one worker, and is destroyed after its
//! [`CompletionHandle`] is settled. The submitter keeps the matching
//! [`Pending`] and awaits it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::model::{PropertyMap, Value};
use crate::{Error, Result};

// ============================================================================
// Identity and kind
// ============================================================================

/// Monotonic operation identifier, assigned at schedule time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Mutation kind. The string forms are what the async layer sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Buffer a node into geometric storage.
    AddNode,
    /// Rotate one dimensional shell.
    ShellSpin,
    /// Rebuild one shell's proximity index after a transform.
    UpdateShellIndex,
    /// Commit buffered insertions into the main index, then anneal secondaries.
    AnnealMainIndex,
    /// Mutate one graph edge.
    GraphMod,
    /// Recompute graph communities and stamp labels onto nodes.
    Communities,
    /// Anything else; dispatched only if a handler was registered for it.
    Custom(String),
}

impl OpKind {
    pub fn as_str(&self) -> &str {
        match self {
            OpKind::AddNode => "ADD_NODE",
            OpKind::ShellSpin => "SHELL_SPIN",
            OpKind::UpdateShellIndex => "UPDATE_SHELL_INDEX",
            OpKind::AnnealMainIndex => "ANNEAL_MAIN_INDEX",
            OpKind::GraphMod => "GRAPH_MOD",
            OpKind::Communities => "COMPUTE_COMMUNITIES",
            OpKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "ADD_NODE" => OpKind::AddNode,
            "SHELL_SPIN" => OpKind::ShellSpin,
            "UPDATE_SHELL_INDEX" => OpKind::UpdateShellIndex,
            "ANNEAL_MAIN_INDEX" => OpKind::AnnealMainIndex,
            "GRAPH_MOD" => OpKind::GraphMod,
            "COMPUTE_COMMUNITIES" => OpKind::Communities,
            other => OpKind::Custom(other.to_owned()),
        })
    }
}

impl From<&str> for OpKind {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

// ============================================================================
// Completion handle
// ============================================================================

/// One-shot result slot, settled by a worker thread.
///
/// Settling consumes the handle, so a second resolution does not
/// type-check. Dropping it unsettled makes the awaiter observe
/// [`Error::ExecutorShutdown`].
#[derive(Debug)]
pub struct CompletionHandle {
    tx: oneshot::Sender<Result<Value>>,
    settled: Arc<AtomicBool>,
}

impl CompletionHandle {
    /// Create a linked handle / receiver pair.
    pub fn new() -> (Self, oneshot::Receiver<Result<Value>>, Arc<AtomicBool>) {
        let (tx, rx) = oneshot::channel();
        let settled = Arc::new(AtomicBool::new(false));
        (Self { tx, settled: Arc::clone(&settled) }, rx, settled)
    }

    /// Settle with a value or an error. Safe from any thread: the oneshot
    /// send wakes the awaiting task on whichever runtime polls it.
    ///
    /// Returns false when the awaiter is gone; the result is discarded.
    pub fn settle(self, outcome: Result<Value>) -> bool {
        let already = self.settled.swap(true, Ordering::AcqRel);
        debug_assert!(!already, "completion handle settled twice");
        self.tx.send(outcome).is_ok()
    }

    pub fn resolve(self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(self, err: Error) -> bool {
        self.settle(Err(err))
    }

    /// Whether the awaiting side has gone away (timeout, cancellation).
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// Operation
// ============================================================================

/// One mutation request plus its result slot.
#[derive(Debug)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
    pub params: PropertyMap,
    /// Operations that must complete before this one runs.
    pub deps: SmallVec<[OpId; 4]>,
    pub handle: CompletionHandle,
    pub enqueued_at: Instant,
}

impl Operation {
    /// Build an operation and the [`Pending`] its submitter will await.
    pub fn new(
        id: OpId,
        kind: OpKind,
        params: PropertyMap,
        deps: impl IntoIterator<Item = OpId>,
    ) -> (Self, Pending) {
        let (handle, rx, settled) = CompletionHandle::new();
        let pending = Pending { id, kind: kind.clone(), rx, settled };
        let op = Self {
            id,
            kind,
            params,
            deps: deps.into_iter().collect(),
            handle,
            enqueued_at: Instant::now(),
        };
        (op, pending)
    }
}

/// Submitter's side of an operation.
#[derive(Debug)]
pub struct Pending {
    id: OpId,
    kind: OpKind,
    rx: oneshot::Receiver<Result<Value>>,
    settled: Arc<AtomicBool>,
}

impl Pending {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    /// Whether a worker has settled the handle. Does not consume the result.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Wait for the worker to settle this operation.
    ///
    /// Dropping the returned future does not cancel the operation; the
    /// worker still runs it and discards the result.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ExecutorShutdown),
        }
    }
}
