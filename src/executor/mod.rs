//! # Single-Writer Executor
//!
//! Async callers enqueue [`Operation`]s; dedicated writer threads dequeue
//! them in FIFO order, run the registered handler against the host, and
//! settle the caller's completion handle.
//!
//! ```text
//! submit ──► WorkQueue (bounded) ──► horizon-writer-0 ─┐
//!   ▲                              └► horizon-writer-1 ─┤ dependency gate
//!   │                                                   │ mutation lock
//!   └──────────── oneshot settle ◄── handler(host, token, params)
//! ```
//!
//! With `serialize_handlers` on (the default) every handler runs under one
//! mutation lock, so at most one writer touches protected state at any
//! instant regardless of the worker count.

mod gate;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::ExecutorConfig;
use crate::handlers::HandlerRegistry;
use crate::host::GeometricHost;
use crate::model::{PropertyMap, Value};
use crate::op::{OpId, OpKind, Operation, Pending};
use crate::queue::{PushError, WorkQueue};
use crate::writer::{WriterMark, WriterToken};
use crate::{Error, Result};

use gate::DependencyGate;

/// Snapshot of executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Operations waiting in the queue.
    pub queue_depth: usize,
    /// Operations dequeued but not yet settled.
    pub in_flight: usize,
    /// Operations whose handler returned a value.
    pub completed: u64,
    /// Operations whose handler failed or panicked.
    pub failed: u64,
    /// Submissions refused with `QueueSaturated`.
    pub saturated: u64,
    pub workers: usize,
}

struct ExecutorInner {
    host: Arc<dyn GeometricHost>,
    registry: HandlerRegistry,
    queue: WorkQueue<Operation>,
    gate: DependencyGate,
    /// Held around every handler call when handlers are serialized.
    mutation_lock: Option<Mutex<()>>,
    accepting: AtomicBool,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    saturated: AtomicU64,
}

/// Owns the writer threads. Dropping it shuts them down.
pub struct Executor {
    inner: Arc<ExecutorInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: ExecutorConfig,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("registry", &self.inner.registry)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Executor {
    /// Start writer threads over `host` with the built-in handlers.
    pub fn start<H: GeometricHost>(host: Arc<H>, config: ExecutorConfig) -> Result<Self> {
        Self::start_with_registry(host, HandlerRegistry::builtin(), config)
    }

    /// Start writer threads with a caller-supplied dispatch table.
    pub fn start_with_registry<H: GeometricHost>(
        host: Arc<H>,
        registry: HandlerRegistry,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(ExecutorInner {
            host,
            registry,
            queue: WorkQueue::new(config.queue_capacity),
            gate: DependencyGate::new(),
            mutation_lock: config.serialize_handlers.then(|| Mutex::new(())),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            saturated: AtomicU64::new(0),
        });

        let executor = Self {
            inner,
            workers: Mutex::new(Vec::with_capacity(config.workers)),
            config,
        };
        for i in 0..executor.config.workers {
            let inner = Arc::clone(&executor.inner);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", executor.config.thread_name, i))
                .spawn(move || worker_loop(&inner, i));
            match spawned {
                Ok(handle) => executor.workers.lock().push(handle),
                // Dropping `executor` joins whatever already started.
                Err(e) => return Err(Error::WorkerSpawn(e.to_string())),
            }
        }

        debug!(
            workers = executor.config.workers,
            capacity = executor.config.queue_capacity,
            serialized = executor.config.serialize_handlers,
            "executor started"
        );
        Ok(executor)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn GeometricHost> {
        &self.inner.host
    }

    /// Whether new submissions are accepted.
    pub fn is_running(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Enqueue an operation and return its [`Pending`] without waiting for
    /// the result.
    ///
    /// Every id in `deps` must have been issued by an earlier `schedule`.
    /// The operation runs only after all of them have settled, success or
    /// failure.
    ///
    /// If the queue is full, waits `backpressure_delay` once and retries
    /// once before failing with [`Error::QueueSaturated`].
    pub async fn schedule(
        &self,
        kind: impl Into<OpKind>,
        params: PropertyMap,
        deps: impl IntoIterator<Item = OpId>,
    ) -> Result<Pending> {
        if !self.is_running() {
            return Err(Error::ExecutorShutdown);
        }
        let inner = &self.inner;
        let id = OpId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let issued = IssuedId { gate: &inner.gate, id, queued: false };
        let (op, pending) = Operation::new(id, kind.into(), params, deps);

        if let Some(&dep) = op.deps.iter().find(|d| d.0 == 0 || d.0 >= id.0) {
            return Err(Error::InvalidDependency { op: id.0, dep: dep.0 });
        }

        let op = match inner.queue.try_push(op) {
            Ok(()) => {
                issued.queued();
                return Ok(pending);
            }
            Err(PushError::Closed(_)) => return Err(Error::ExecutorShutdown),
            Err(PushError::Full(op)) => op,
        };

        debug!(op_id = %id, kind = %op.kind, "queue full, backing off");
        tokio::time::sleep(self.config.backpressure_delay).await;

        match inner.queue.try_push(op) {
            Ok(()) => {
                issued.queued();
                Ok(pending)
            }
            Err(PushError::Closed(_)) => Err(Error::ExecutorShutdown),
            Err(PushError::Full(op)) => {
                inner.saturated.fetch_add(1, Ordering::Relaxed);
                warn!(op_id = %id, kind = %op.kind, capacity = self.config.queue_capacity, "queue saturated");
                Err(Error::QueueSaturated { capacity: self.config.queue_capacity })
            }
        }
    }

    /// Enqueue an operation and wait for its result.
    pub async fn submit(&self, kind: impl Into<OpKind>, params: PropertyMap) -> Result<Value> {
        self.schedule(kind, params, []).await?.wait().await
    }

    /// Like [`submit`](Self::submit), running only after `deps` settle.
    pub async fn submit_after(
        &self,
        kind: impl Into<OpKind>,
        params: PropertyMap,
        deps: impl IntoIterator<Item = OpId>,
    ) -> Result<Value> {
        self.schedule(kind, params, deps).await?.wait().await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop accepting submissions, let the workers drain the queue, and
    /// join them. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.accepting.swap(false, Ordering::AcqRel) {
            debug!(queued = self.inner.queue.len(), "executor shutting down");
        }
        self.inner.queue.close();

        let current = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            // A handler dropping the last executor handle must not join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("writer thread terminated abnormally");
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let inner = &self.inner;
        ExecutorStats {
            queue_depth: inner.queue.len(),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            completed: inner.completed.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            saturated: inner.saturated.load(Ordering::Relaxed),
            workers: self.config.workers,
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Worker
// ============================================================================

/// An id issued by `schedule` that has not reached the queue yet.
///
/// Unless handed to the queue, the id is marked done on drop, including
/// when the caller drops the `schedule` future mid-backoff.
struct IssuedId<'a> {
    gate: &'a DependencyGate,
    id: OpId,
    queued: bool,
}

impl IssuedId<'_> {
    fn queued(mut self) {
        self.queued = true;
    }
}

impl Drop for IssuedId<'_> {
    fn drop(&mut self) {
        if !self.queued {
            self.gate.mark_done(self.id);
        }
    }
}

/// Decrements `in_flight` and releases dependents even if settling panics.
struct InFlightGuard<'a> {
    inner: &'a ExecutorInner,
    id: OpId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.gate.mark_done(self.id);
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

fn worker_loop(inner: &ExecutorInner, worker: usize) {
    while let Some(op) = inner.queue.pop() {
        inner.in_flight.fetch_add(1, Ordering::Relaxed);
        let Operation { id, kind, params, deps, handle, enqueued_at } = op;
        let guard = InFlightGuard { inner, id };

        inner.gate.wait_for(&deps);
        let started = Instant::now();
        let outcome = inner.run(worker, id, &kind, &params);

        match &outcome {
            Ok(_) => {
                inner.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    op_id = %id,
                    %kind,
                    worker,
                    queued_us = started.duration_since(enqueued_at).as_micros() as u64,
                    run_us = started.elapsed().as_micros() as u64,
                    "operation completed"
                );
            }
            Err(e) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                warn!(op_id = %id, %kind, worker, error = %e, "operation failed");
            }
        }

        // Dependents may run as soon as the effects are in place.
        drop(guard);
        if !handle.settle(outcome) {
            debug!(op_id = %id, %kind, "awaiter gone, result discarded");
        }
    }
    debug!(worker, "writer thread exiting");
}

impl ExecutorInner {
    /// One handler call inside the writer window. Never unwinds.
    fn run(&self, worker: usize, id: OpId, kind: &OpKind, params: &PropertyMap) -> Result<Value> {
        let _serial = self.mutation_lock.as_ref().map(|m| m.lock());
        let _mark = WriterMark::enter();
        let token = WriterToken::mint(worker, id);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.registry.dispatch(kind, self.host.as_ref(), &token, params)
        }));
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::HandlerFailure { kind: kind.to_string(), message: e.to_string() }),
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(op_id = %id, %kind, worker, %message, "handler panicked");
                Err(Error::HandlerFailure { kind: kind.to_string(), message })
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "(non-string panic)".into())
}
