//! Thread-safe task queue for managing ready tasks.
//!
//! Provides a FIFO queue that wakers on any thread push tasks into, and a
//! parker the runtime thread sleeps on while nothing is ready.

use crate::task::Runnable;
use crate::utils::lock;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A thread-safe, FIFO queue for storing executable tasks.
///
/// Tasks are pushed when spawned or woken and popped by the executor.
/// Helper threads finishing a blocking call push from outside the runtime
/// thread, which is what [`TaskQueue::park`] waits for.
pub(crate) struct TaskQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

struct QueueState {
    tasks: VecDeque<Arc<dyn Runnable>>,
    unparked: bool,
}

impl TaskQueue {
    /// Creates a new empty task queue.
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                unparked: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Enqueues a task to be executed and wakes a parked runtime.
    pub(crate) fn push(&self, task: Arc<dyn Runnable>) {
        lock(&self.state).tasks.push_back(task);
        self.condvar.notify_one();
    }

    /// Dequeues and returns the next ready task.
    pub(crate) fn pop(&self) -> Option<Arc<dyn Runnable>> {
        lock(&self.state).tasks.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.state).tasks.is_empty()
    }

    /// Wakes a parked runtime without queueing a task.
    pub(crate) fn unpark(&self) {
        lock(&self.state).unparked = true;
        self.condvar.notify_one();
    }

    /// Sleeps until a task is queued, [`TaskQueue::unpark`] is called, or
    /// `timeout` elapses.
    ///
    /// An unpark issued before the call is not lost: it makes the next park
    /// return immediately.
    pub(crate) fn park(&self, timeout: Option<Duration>) {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = lock(&self.state);

        while state.tasks.is_empty() && !state.unparked {
            state = match deadline {
                None => self
                    .condvar
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }

                    self.condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        state.unparked = false;
    }
}
