//! Configuration structs.
//!
//! Loading (files, env, CLI) belongs to the embedding application; these
//! types only carry defaults and derive serde so a loader can fill them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ============================================================================
// Executor
// ============================================================================

/// Configuration for the single-writer executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of writer threads.
    pub workers: usize,
    /// Bounded queue capacity.
    pub queue_capacity: usize,
    /// Delay before the single enqueue retry when the queue is full.
    #[serde(with = "millis")]
    pub backpressure_delay: Duration,
    /// Run handlers under one mutation lock so that several workers still
    /// give single-writer semantics. Without it, exclusivity holds only
    /// with `workers == 1`.
    pub serialize_handlers: bool,
    /// Thread name prefix; workers are named `{prefix}-{i}`.
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1024,
            backpressure_delay: Duration::from_millis(10),
            serialize_handlers: true,
            thread_name: "horizon-writer".into(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_backpressure_delay(mut self, delay: Duration) -> Self {
        self.backpressure_delay = delay;
        self
    }

    pub fn with_serialized_handlers(mut self, on: bool) -> Self {
        self.serialize_handlers = on;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidArgument("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidArgument("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ============================================================================
// Graph weight bounds
// ============================================================================

/// Clamp interval for edge-weight accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightBounds {
    pub min: f64,
    pub max: f64,
}

impl WeightBounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, w: f64) -> f64 {
        w.max(self.min).min(self.max)
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

impl Default for WeightBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 10.0 }
    }
}

// ============================================================================
// Host
// ============================================================================

/// Configuration for [`MemoryHost`](crate::MemoryHost).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Dimension of vectors in the main index.
    pub embed_dim: usize,
    /// One shell is created per listed dimension.
    pub shell_dims: Vec<usize>,
    /// Default bounds for `GRAPH_MOD` weight increments.
    pub weight_bounds: WeightBounds,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            embed_dim: 3,
            shell_dims: vec![2, 3],
            weight_bounds: WeightBounds::default(),
        }
    }
}

impl HostConfig {
    pub fn new(embed_dim: usize) -> Self {
        Self { embed_dim, ..Self::default() }
    }

    pub fn with_shells(mut self, dims: impl IntoIterator<Item = usize>) -> Self {
        self.shell_dims = dims.into_iter().collect();
        self
    }

    pub fn with_weight_bounds(mut self, bounds: WeightBounds) -> Self {
        self.weight_bounds = bounds;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.embed_dim == 0 {
            return Err(Error::InvalidArgument("embed_dim must be at least 1".into()));
        }
        if let Some(d) = self.shell_dims.iter().find(|&&d| d == 0) {
            return Err(Error::InvalidArgument(format!("shell dimension {d} is not allowed")));
        }
        if !self.weight_bounds.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "invalid weight bounds [{}, {}]",
                self.weight_bounds.min, self.weight_bounds.max
            )));
        }
        Ok(())
    }
}
