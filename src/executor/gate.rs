//! Completion tracking for operation dependencies.

use std::collections::BTreeSet;

use parking_lot::{Condvar, Mutex};

use crate::op::OpId;

/// Ids settled so far: everything `<= watermark`, plus the sparse set of
/// later ids that finished out of order.
#[derive(Debug, Default)]
struct Finished {
    watermark: u64,
    ahead: BTreeSet<u64>,
}

impl Finished {
    fn contains(&self, id: OpId) -> bool {
        id.0 <= self.watermark || self.ahead.contains(&id.0)
    }

    fn insert(&mut self, id: OpId) {
        if id.0 <= self.watermark {
            return;
        }
        self.ahead.insert(id.0);
        while self.ahead.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
    }
}

/// Workers block here until every dependency of their operation is done.
///
/// Ids are issued from 1. An id that will never run (rejected at schedule
/// time) must still be marked done so the watermark can pass it.
#[derive(Debug, Default)]
pub(crate) struct DependencyGate {
    finished: Mutex<Finished>,
    changed: Condvar,
}

impl DependencyGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_done(&self, id: OpId) -> bool {
        self.finished.lock().contains(id)
    }

    pub(crate) fn mark_done(&self, id: OpId) {
        let mut finished = self.finished.lock();
        finished.insert(id);
        self.changed.notify_all();
    }

    /// Block until every id in `deps` is done.
    pub(crate) fn wait_for(&self, deps: &[OpId]) {
        if deps.is_empty() {
            return;
        }
        let mut finished = self.finished.lock();
        while !deps.iter().all(|&d| finished.contains(d)) {
            self.changed.wait(&mut finished);
        }
    }

    #[cfg(test)]
    fn backlog(&self) -> usize {
        self.finished.lock().ahead.len()
    }
}
