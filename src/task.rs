//! Task wrapper that combines futures with waker integration.
//!
//! A task encapsulates a future and provides mechanisms for polling and awakening
//! when the future is ready to make progress. Supports both direct task execution via
//! the runtime and global task spawning without requiring an explicit runtime reference.
//!
//! # Task Spawning
//!
//! Tasks are spawned using [`Task::spawn`] from within an async context:
//!
//! ```ignore
//! use kbridge::Task;
//!
//! async fn spawn_example() {
//!     Task::spawn(async {
//!         println!("Running in background");
//!     });
//!     println!("Task spawned, main continues");
//! }
//! ```
//!
//! # Join Handles
//!
//! [`Task::spawn`] returns a [`JoinHandle`] that can be awaited to wait for
//! completion, or used to interrupt a blocking call the task is parked in:
//!
//! ```ignore
//! let queue = Arc::new(ReadinessQueue::new()?);
//! let waiter = queue.clone();
//! let handle = Task::spawn(async move { waiter.wait(16, None).await });
//!
//! sleep(Duration::from_millis(10)).await;
//! handle.interrupt();
//! assert!(matches!(handle.await, Err(Error::Interrupted)));
//! ```
//!
//! # How Tasks Work
//!
//! 1. A future is wrapped in a [`Task`]
//! 2. The task is enqueued in the runtime's task queue
//! 3. The executor polls the task with a custom waker
//! 4. When the future yields `Poll::Pending`, it's stored for later
//! 5. When a timer fires or a blocking call completes, the waker re-queues the task
//! 6. The task is polled again and can make progress

use crate::runtime::context::{self, InterruptSlot};
use crate::runtime::{TaskQueue, make_waker};
use crate::utils::lock;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A spawned task that wraps a future and supports generic output.
///
/// Tasks are created via [`Task::spawn`] or [`Runtime::spawn`] and are not
/// constructed directly in user code.
///
/// # Internals
///
/// - `future`: The wrapped future being executed
/// - `result`: Stores the output value once the task completes
/// - `queue`: Reference to the task queue for re-scheduling
/// - `completed`: Atomic flag indicating task completion
/// - `waiters`: Wakers waiting for this task to complete
/// - `interrupt`: Unblock function of the blocking call the task is in, if any
///
/// [`Runtime::spawn`]: crate::Runtime::spawn
pub struct Task<T> {
    future: Mutex<Option<BoxFuture<T>>>,
    result: Mutex<Option<T>>,
    queue: Arc<TaskQueue>,
    completed: AtomicBool,
    waiters: Mutex<Vec<Waker>>,
    interrupt: Arc<InterruptSlot>,
}

impl<T: Send + 'static> Task<T> {
    pub(crate) fn new<F>(fut: F, queue: Arc<TaskQueue>) -> Arc<Self>
    where
        F: Future<Output = T> + Send + 'static,
    {
        Arc::new(Task {
            future: Mutex::new(Some(Box::pin(fut))),
            result: Mutex::new(None),
            queue,
            completed: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
            interrupt: Arc::new(InterruptSlot::default()),
        })
    }

    /// Polls the task's future once.
    ///
    /// If the future returns [`Poll::Pending`] it is stored back for later
    /// polling. If it returns [`Poll::Ready`] the result is stored and all
    /// waiters are notified.
    fn poll(self: &Arc<Self>) {
        let waker = make_waker(self.clone());
        let mut cx = Context::from_waker(&waker);

        let mut future_slot = lock(&self.future);

        if let Some(mut future) = future_slot.take() {
            let poll = context::enter_task(self.interrupt.clone(), || {
                future.as_mut().poll(&mut cx)
            });

            match poll {
                Poll::Pending => {
                    *future_slot = Some(future);
                }
                Poll::Ready(val) => {
                    drop(future_slot);
                    *lock(&self.result) = Some(val);
                    self.completed.store(true, Ordering::Release);

                    let waiters: Vec<Waker> = lock(&self.waiters).drain(..).collect();
                    for w in waiters {
                        w.wake();
                    }
                }
            }
        }
    }

    /// Spawns a task on the current runtime context and returns a [`JoinHandle`].
    ///
    /// The task runs concurrently with the current one. The returned
    /// [`JoinHandle`] can be awaited to wait for the spawned task to complete.
    ///
    /// # Panics
    /// Panics if called outside of a runtime context, i.e. outside the future
    /// passed to [`Runtime::block_on`] and the tasks it spawned.
    ///
    /// # Example
    /// ```ignore
    /// async fn example() {
    ///     let handle = Task::spawn(async { 42 });
    ///     assert_eq!(handle.await, 42);
    /// }
    /// ```
    ///
    /// [`Runtime::block_on`]: crate::Runtime::block_on
    pub fn spawn<F>(future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let queue =
            context::current_queue().expect("Task::spawn() called outside of a runtime context");

        spawn_on(future, &queue)
    }
}

pub(crate) fn spawn_on<F, T>(future: F, queue: &Arc<TaskQueue>) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let task: Arc<Task<T>> = Task::new(future, queue.clone());
    queue.push(task.clone());

    JoinHandle { task }
}

/// Objects that can be polled as tasks by the executor.
///
/// Lets heterogeneous task types share one queue.
pub(crate) trait Runnable: Send + Sync + 'static {
    /// Polls the task for progress.
    fn run(self: Arc<Self>);

    /// Puts the task back on its queue.
    fn schedule(self: Arc<Self>);
}

impl<T: Send + 'static> Runnable for Task<T> {
    fn run(self: Arc<Self>) {
        Task::poll(&self);
    }

    fn schedule(self: Arc<Self>) {
        if self.completed.load(Ordering::Acquire) {
            return;
        }

        let queue = self.queue.clone();
        queue.push(self);
    }
}

/// A future that resolves when the associated task completes, returning the output value.
///
/// This is the return value of [`Task::spawn`] and [`Runtime::spawn`].
///
/// [`Runtime::spawn`]: crate::Runtime::spawn
pub struct JoinHandle<T> {
    task: Arc<Task<T>>,
}

impl<T> JoinHandle<T> {
    /// Forces the blocking call the task is currently suspended in to return.
    ///
    /// The call completes with [`Error::Interrupted`] unless it already had a
    /// result. Returns false, and does nothing, when the task is not inside a
    /// blocking call.
    ///
    /// [`Error::Interrupted`]: crate::Error::Interrupted
    pub fn interrupt(&self) -> bool {
        self.task.interrupt.fire()
    }

    pub fn is_finished(&self) -> bool {
        self.task.completed.load(Ordering::Acquire)
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut ws = lock(&self.task.waiters);

        if self.task.completed.load(Ordering::Acquire) {
            drop(ws);
            let result = lock(&self.task.result)
                .take()
                .expect("task completed but result missing");

            return Poll::Ready(result);
        }

        ws.push(cx.waker().clone());

        Poll::Pending
    }
}

/// A helper to collect multiple [`JoinHandle`]s and await all of them at once.
///
/// # Example
/// ```ignore
/// let mut set = JoinSet::new();
///
/// for i in 0..5 {
///     set.push(Task::spawn(async move { i }));
/// }
///
/// assert_eq!(set.await_all().await, vec![0, 1, 2, 3, 4]);
/// ```
pub struct JoinSet<T> {
    handles: Vec<JoinHandle<T>>,
}

impl<T> JoinSet<T> {
    /// Creates a new empty JoinSet.
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Adds a [`JoinHandle`] to the set.
    pub fn push(&mut self, handle: JoinHandle<T>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Awaits all handles in insertion order, returning their outputs.
    ///
    /// Handles are removed from the set as they complete.
    pub async fn await_all(&mut self) -> Vec<T> {
        let mut outputs = Vec::with_capacity(self.handles.len());

        for handle in self.handles.drain(..) {
            outputs.push(handle.await);
        }

        outputs
    }
}

impl<T> Default for JoinSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
