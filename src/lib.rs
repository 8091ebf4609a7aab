//! # horizon: Single-Writer Geometric Memory Engine
//!
//! Bridges an async request layer to dedicated writer threads that own
//! every mutation of geometric memory: a nearest-neighbor index and a
//! weighted graph store.
//!
//! ## Design Principles
//!
//! 1. **One writer**: protected state is mutated only inside handler execution
//!    on an executor worker, holding a [`WriterToken`] minted by the executor
//! 2. **Never block the caller**: `submit` enqueues without blocking; the only
//!    wait is a single bounded backpressure delay before `QueueSaturated`
//! 3. **Readers don't queue**: spatial queries run on any thread against an
//!    immutable, atomically swapped index snapshot
//! 4. **Trait-first host**: [`GeometricHost`] is the contract between the
//!    executor's handlers and whatever owns the geometry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use horizon::{Executor, ExecutorConfig, HostConfig, MemoryHost, OpKind, props};
//!
//! # async fn example() -> horizon::Result<()> {
//! let host = Arc::new(MemoryHost::new(HostConfig::default())?);
//! let executor = Executor::start(host.clone(), ExecutorConfig::default())?;
//!
//! executor.submit(OpKind::AddNode, props! {
//!     "id" => "ada",
//!     "vector" => vec![0.1, 0.2, 0.3],
//! }).await?;
//! executor.submit(OpKind::AnnealMainIndex, props! {}).await?;
//!
//! // Reads bypass the queue.
//! let hits = host.nearest(&[0.1, 0.2, 0.3], 1)?;
//! println!("{hits:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Spatial Backends
//!
//! | Backend | Feature | Distance |
//! |---------|---------|----------|
//! | Inner product | `ip-search` (default) | `1 − cosine similarity` |
//! | kd-tree | `kd-tree` (default) | Euclidean |
//! | Brute force | (always) | Euclidean |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod config;
pub mod op;
pub mod queue;
pub mod writer;
pub mod handlers;
pub mod executor;
pub mod spatial;
pub mod graph;
pub mod host;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{Edge, EdgeKey, NodeId, PropertyMap, Value};

// ============================================================================
// Re-exports: Scheduling
// ============================================================================

pub use config::{ExecutorConfig, HostConfig, WeightBounds};
pub use op::{CompletionHandle, OpId, OpKind, Operation, Pending};
pub use queue::WorkQueue;
pub use writer::{WriterMark, WriterToken};
pub use handlers::{Handler, HandlerRegistry};
pub use executor::{Executor, ExecutorStats};

// ============================================================================
// Re-exports: Protected state
// ============================================================================

pub use spatial::{DistanceMetric, Hits, LatencyStats, Neighbors, QueryInput, SpatialBackend, SpatialIndex};
pub use graph::{CommunityOutcome, EdgeUpdate, GraphStore};
pub use host::{GeometricHost, GraphMutation, IndexSnapshot, MemoryHost, Plane, Shell};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Work queue saturated (capacity {capacity}); retry later")]
    QueueSaturated { capacity: usize },

    #[error("Handler for {kind} failed: {message}")]
    HandlerFailure { kind: String, message: String },

    #[error("Executor is shut down")]
    ExecutorShutdown,

    #[error("Failed to spawn writer thread: {0}")]
    WorkerSpawn(String),

    #[error("Operation {op} depends on {dep}, which was not issued before it")]
    InvalidDependency { op: u64, dep: u64 },

    #[error("Missing parameter `{0}`")]
    MissingParam(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Index backend error: {0}")]
    IndexBackend(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the caller may reasonably resubmit the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueSaturated { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
