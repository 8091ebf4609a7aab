//! Writer identity: who may mutate protected state right now.
//!
//! Two layers:
//! - [`WriterMark`]: a thread-local flag, true only while a handler runs on
//!   an executor worker. An assertion device, not a lock.
//! - [`WriterToken`]: a capability minted only by the executor for one
//!   handler call and passed by reference into every mutating host method.
//!   It is `!Send`, so it cannot escape the worker thread.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::op::OpId;

thread_local! {
    static WRITER: Cell<bool> = const { Cell::new(false) };
}

/// Thread-local "this thread currently holds mutation rights" flag.
pub struct WriterMark;

impl WriterMark {
    /// True only inside a handler's execution window on a worker thread.
    pub fn is_set() -> bool {
        WRITER.with(Cell::get)
    }

    /// Set the mark for the lifetime of the returned guard.
    pub(crate) fn enter() -> MarkGuard {
        WRITER.with(|w| w.set(true));
        MarkGuard { _not_send: PhantomData }
    }
}

/// Clears the mark on drop, including during unwinding.
pub(crate) struct MarkGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for MarkGuard {
    fn drop(&mut self) {
        WRITER.with(|w| w.set(false));
    }
}

/// Proof that the holder is the executor's current writer.
#[derive(Debug)]
pub struct WriterToken {
    worker: usize,
    op: OpId,
    _not_send: PhantomData<*const ()>,
}

impl WriterToken {
    pub(crate) fn mint(worker: usize, op: OpId) -> Self {
        Self { worker, op, _not_send: PhantomData }
    }

    /// Index of the worker thread running the handler.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Operation the token was minted for.
    pub fn op(&self) -> OpId {
        self.op
    }

    /// Cross-check the token against the thread-local mark.
    pub fn debug_assert_held(&self) {
        debug_assert!(
            WriterMark::is_set(),
            "writer token for {} used outside its handler window",
            self.op
        );
    }
}
