//! Async runtime that executes futures and manages task scheduling.
//!
//! The runtime coordinates the execution of a main future via `block_on` and handles
//! spawned background tasks. Polling happens on the thread that calls
//! `block_on`; blocking kernel calls made through the bridge run on the
//! runtime's helper pool while the polling thread keeps serving other tasks.

use crate::bridge::{BlockingPool, PoolConfig};
use crate::runtime::waker::MainWaker;
use crate::runtime::{Executor, Handle, enter_context};
use crate::task::{self, JoinHandle};
use crate::timer;

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::{debug, trace};

/// Main async runtime for executing futures.
///
/// Provides the core API for running futures to completion and spawning background tasks.
/// Dropping the runtime interrupts any blocking call still in flight and
/// retires its helper threads.
pub struct Runtime {
    handle: Arc<Handle>,
    executor: Executor,
}

impl Runtime {
    /// Creates a runtime with the default helper pool settings.
    ///
    /// # Example
    /// ```ignore
    /// let mut rt = Runtime::new();
    /// assert_eq!(rt.block_on(async { 1 + 1 }), 2);
    /// ```
    pub fn new() -> Self {
        Self::with_pool(PoolConfig::default())
    }

    pub(crate) fn with_pool(config: PoolConfig) -> Self {
        debug!(
            max_blocking_threads = config.max_threads,
            keep_alive = ?config.keep_alive,
            "runtime created"
        );

        let handle = Arc::new(Handle::new(BlockingPool::new(config)));
        let executor = Executor::new(handle.queue.clone());

        Self { handle, executor }
    }

    /// Spawns a background task to be executed concurrently.
    ///
    /// The task is polled once `block_on` runs.
    ///
    /// # Example
    /// ```ignore
    /// let handle = rt.spawn(async { 7 });
    /// assert_eq!(rt.block_on(handle), 7);
    /// ```
    pub fn spawn<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        task::spawn_on(fut, &self.handle.queue)
    }

    /// Forces every blocking call in flight on this runtime to return.
    ///
    /// Each interrupted call completes with
    /// [`Error::Interrupted`](crate::Error::Interrupted) unless it already had
    /// a result. Returns how many calls were signalled.
    pub fn interrupt_blocking(&self) -> usize {
        self.handle.interrupt_blocking()
    }

    /// Number of tasks currently suspended in a blocking call.
    pub fn blocking_calls(&self) -> usize {
        self.handle.blocking_calls()
    }

    /// Blocks until the given future completes, processing spawned tasks along the way.
    ///
    /// Establishes a runtime context, so [`Task::spawn`](crate::Task::spawn)
    /// and the blocking bridge work inside `fut` without an explicit runtime
    /// reference. Tasks still ready when `fut` completes are drained before
    /// returning.
    ///
    /// # Example
    /// ```ignore
    /// let result = rt.block_on(async { 42 });
    /// assert_eq!(result, 42);
    /// ```
    pub fn block_on<F: Future>(&mut self, fut: F) -> F::Output {
        let queue = self.handle.queue.clone();

        enter_context(self.handle.clone(), || {
            let mut fut = Box::pin(fut);

            let main = MainWaker::new(queue.clone());
            let waker = Waker::from(main.clone());
            let mut cx = Context::from_waker(&waker);

            loop {
                // Try to make progress on the main future
                if main.take_notified()
                    && let Poll::Ready(val) = fut.as_mut().poll(&mut cx)
                {
                    self.executor.drain();
                    return val;
                }

                // Execute spawned tasks that are ready
                self.executor.tick();

                // Fire expired timers (this wakes sleeping tasks)
                let has_pending_timers = timer::process_timers();

                if main.is_notified() || !queue.is_empty() {
                    continue;
                }

                // Nothing ready: sleep until a timer is due or a waker fires,
                // possibly from a helper thread finishing a blocking call.
                let timeout = if has_pending_timers {
                    timer::next_timer_remaining()
                } else {
                    None
                };

                trace!(?timeout, "runtime parked");
                queue.park(timeout);
            }
        })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let interrupted = self.handle.interrupt_blocking();
        self.handle.pool.shutdown();

        // Queued tasks hold the queue alive; drop them to break the cycle.
        while self.handle.queue.pop().is_some() {}

        debug!(interrupted, "runtime dropped");
    }
}
