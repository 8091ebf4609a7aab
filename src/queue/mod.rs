//! Bounded FIFO work queue between submitters and writer threads.
//!
//! Push never blocks: a full queue hands the item back. Pop blocks on a
//! condvar until an item arrives or the queue is closed and drained.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Why a push was refused. The item is handed back either way.
#[derive(Debug)]
pub enum PushError<T> {
    Full(T),
    Closed(T),
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer FIFO.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue without blocking.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() >= self.capacity {
                return Err(PushError::Full(item));
            }
            state.items.push_back(item);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Dequeue, blocking while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and every item has been taken.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Refuse further pushes and wake every blocked consumer.
    /// Items already queued are still handed out by `pop`.
    pub fn close(&self) {
        // Notify under the lock so a consumer between its closed check and
        // wait() cannot miss the wakeup.
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
