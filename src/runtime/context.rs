//! Thread-local runtime context.
//!
//! Set by [`enter_context`] for the duration of every `block_on`, and by
//! [`enter_task`] around every poll of a spawned task. Lets [`Task::spawn`]
//! and the blocking bridge find the current runtime without an explicit
//! handle.
//!
//! [`Task::spawn`]: crate::Task::spawn

use crate::bridge::{BlockingPool, Unblock};
use crate::runtime::{Handle, TaskQueue};
use crate::utils::lock;

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

thread_local! {
    /// The runtime whose `block_on` is running on this thread.
    static CURRENT_HANDLE: RefCell<Option<Arc<Handle>>> = const { RefCell::new(None) };

    /// Interrupt slot of the task being polled, if any.
    static CURRENT_TASK: RefCell<Option<Arc<InterruptSlot>>> = const { RefCell::new(None) };
}

/// Enters a runtime context for the current thread.
///
/// The previous context is restored when `function` returns, so nested
/// `block_on` calls on different runtimes see their own handle.
pub(crate) fn enter_context<F, R>(handle: Arc<Handle>, function: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = CURRENT_HANDLE.with(|current| current.borrow_mut().replace(handle));
    let _restore = Restore(Some(|| {
        CURRENT_HANDLE.with(|current| *current.borrow_mut() = previous)
    }));

    function()
}

/// Marks `slot` as the interrupt slot of the task being polled.
pub(crate) fn enter_task<F, R>(slot: Arc<InterruptSlot>, function: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = CURRENT_TASK.with(|current| current.borrow_mut().replace(slot));
    let _restore = Restore(Some(|| {
        CURRENT_TASK.with(|current| *current.borrow_mut() = previous)
    }));

    function()
}

pub(crate) fn current_handle() -> Option<Arc<Handle>> {
    CURRENT_HANDLE.with(|current| current.borrow().clone())
}

pub(crate) fn current_queue() -> Option<Arc<TaskQueue>> {
    CURRENT_HANDLE.with(|current| current.borrow().as_ref().map(|handle| handle.queue.clone()))
}

pub(crate) fn current_interrupt() -> Option<Arc<InterruptSlot>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

/// Helper pool of the current runtime, or the process-wide one.
pub(crate) fn blocking_pool() -> BlockingPool {
    current_handle()
        .map(|handle| handle.pool.clone())
        .unwrap_or_else(|| BlockingPool::global().clone())
}

/// Holds the unblock function of a task's in-flight blocking call.
#[derive(Default)]
pub(crate) struct InterruptSlot {
    armed: Mutex<Option<Arc<dyn Unblock>>>,
}

impl InterruptSlot {
    pub(crate) fn arm(&self, unblock: Arc<dyn Unblock>) {
        *lock(&self.armed) = Some(unblock);
    }

    pub(crate) fn disarm(&self) {
        lock(&self.armed).take();
    }

    /// Fires the armed unblock function. Returns false if the task is not
    /// inside a blocking call.
    pub(crate) fn fire(&self) -> bool {
        // Clone out so the unblock function runs without the lock held.
        let unblock = lock(&self.armed).clone();

        match unblock {
            Some(unblock) => {
                unblock.unblock();
                true
            }
            None => false,
        }
    }
}

// Runs its closure on drop, so thread-local state is restored even if the
// wrapped function panics.
struct Restore<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Restore<F> {
    fn drop(&mut self) {
        if let Some(restore) = self.0.take() {
            restore();
        }
    }
}
