//! Waker implementations for task wake-up notifications.
//!
//! Wakers may fire on any thread: helper threads wake the task that handed
//! them a blocking call, so both wakers only touch thread-safe state.

use crate::runtime::TaskQueue;
use crate::task::Runnable;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Wake, Waker};

/// Re-queues a spawned task when awakened.
pub(crate) struct TaskWaker {
    task: Arc<dyn Runnable>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.task.clone().schedule();
    }
}

/// Creates a Waker from a task that re-queues it on wake.
pub(crate) fn make_waker(task: Arc<dyn Runnable>) -> Waker {
    Waker::from(Arc::new(TaskWaker { task }))
}

/// Waker for the future passed to `block_on`.
///
/// The main future is not in the task queue; waking it sets a flag the
/// runtime loop checks, and unparks the loop if it is asleep.
pub(crate) struct MainWaker {
    notified: AtomicBool,
    queue: Arc<TaskQueue>,
}

impl MainWaker {
    pub(crate) fn new(queue: Arc<TaskQueue>) -> Arc<Self> {
        // Starts notified so the main future gets its first poll.
        Arc::new(Self {
            notified: AtomicBool::new(true),
            queue,
        })
    }

    /// Consumes a pending notification.
    pub(crate) fn take_notified(&self) -> bool {
        self.notified.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }
}

impl Wake for MainWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notified.store(true, Ordering::Release);
        self.queue.unpark();
    }
}
