//! The readiness queue: one kernel event-notification object plus the
//! bookkeeping that turns its output into [`ReadinessEvent`]s.

use crate::bridge;
use crate::capability::Backend;
use crate::error::{Error, Result, record};
use crate::reactor::event::ReadinessEvent;
use crate::reactor::interest::{Action, Subscription, Target};
use crate::reactor::poller::{Poller, RawEvents};
use crate::reactor::unblock::{Unblocker, WaitGuard, WaitState};
use crate::utils::lock;

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

const DEFAULT_SIZE_HINT: usize = 1024;

/// Configures a [`ReadinessQueue`] before it is created.
///
/// # Example
/// ```ignore
/// let queue = ReadinessQueue::builder()
///     .backend(Backend::Epoll)
///     .size_hint(64)
///     .build()?;
/// ```
#[derive(Clone, Debug)]
pub struct QueueBuilder {
    backend: Option<Backend>,
    size_hint: usize,
}

impl Default for QueueBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            size_hint: DEFAULT_SIZE_HINT,
        }
    }
}

impl QueueBuilder {
    /// Forces a backend instead of the one the capability probe prefers.
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Expected number of registrations. Only presizes bookkeeping; the
    /// queue grows past it freely.
    pub fn size_hint(mut self, size_hint: usize) -> Self {
        self.size_hint = size_hint;
        self
    }

    /// Creates the queue.
    ///
    /// # Errors
    ///
    /// [`Error::Unsupported`] if the platform has no usable backend or the
    /// requested one is missing. [`Error::ResourceExhausted`] if the kernel
    /// refuses to allocate the queue.
    pub fn build(self) -> Result<ReadinessQueue> {
        ReadinessQueue::create(self).map_err(record)
    }
}

/// A kernel event-notification queue.
///
/// Subscriptions are applied with [`update`](Self::update) and readiness is
/// collected with [`wait`](Self::wait), which suspends only the calling task
/// while the kernel blocks. At most one wait runs at a time.
///
/// Every failing operation also stores its OS error code where
/// [`last_os_error`](crate::last_os_error) can read it.
pub struct ReadinessQueue {
    shared: Arc<Shared>,
    wait: Arc<WaitState>,
    backend: Backend,
}

// Reachable from helper threads that outlive the wait which started them.
struct Shared {
    poller: Mutex<Option<Arc<Poller>>>,
    // Events collected by a wait beyond what its caller asked for, or by a
    // wait whose caller went away.
    backlog: Mutex<VecDeque<ReadinessEvent>>,
}

// What the helper thread hands back from one kernel wait. The guard keeps
// the queue claimed until the result has been dealt with.
type Handoff = (RawEvents, std::result::Result<usize, i32>, Arc<WaitGuard>);

enum Step {
    Done(Result<Vec<ReadinessEvent>>),
    Retry,
}

impl ReadinessQueue {
    /// Creates a queue on the preferred backend for this platform.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> QueueBuilder {
        QueueBuilder::default()
    }

    fn create(builder: QueueBuilder) -> Result<Self> {
        let backend = builder.backend.or_else(Backend::detect).ok_or(Error::Unsupported {
            target: "queue",
            backend: "none",
        })?;

        let poller = Poller::new(backend, builder.size_hint)?;
        debug!(%backend, fd = poller.raw_fd(), "created readiness queue");

        Ok(Self {
            shared: Arc::new(Shared {
                poller: Mutex::new(Some(Arc::new(poller))),
                backlog: Mutex::new(VecDeque::new()),
            }),
            wait: Arc::new(WaitState::default()),
            backend,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The kernel object's descriptor, or `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        lock(&self.shared.poller).as_ref().map(|poller| poller.raw_fd())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of live registrations. Oneshot and process-exit
    /// registrations disappear once they have fired.
    pub fn registered(&self) -> usize {
        lock(&self.shared.poller)
            .as_ref()
            .map_or(0, |poller| poller.registered())
    }

    /// Applies `subscriptions` in order.
    ///
    /// Stops at the first one the kernel rejects. Everything before it
    /// stays applied.
    ///
    /// # Errors
    ///
    /// The rejected subscription's error if it was the first, otherwise
    /// [`Error::Partial`] carrying how many were applied.
    /// [`Error::InvalidHandle`] if the queue is closed.
    pub fn update(&self, subscriptions: &[Subscription]) -> Result<()> {
        self.apply(subscriptions).map_err(record)
    }

    fn apply(&self, subscriptions: &[Subscription]) -> Result<()> {
        let poller = self.poller()?;

        for (applied, subscription) in subscriptions.iter().enumerate() {
            if let Err(source) = poller.submit(subscription) {
                debug!(
                    applied,
                    target = ?subscription.target,
                    action = ?subscription.action,
                    %source,
                    "subscription rejected"
                );

                return Err(match applied {
                    0 => source,
                    applied => Error::Partial {
                        applied,
                        source: Box::new(source),
                    },
                });
            }

            if subscription.action == Action::Delete {
                self.shared.forget(subscription.target);
            }
        }

        trace!(count = subscriptions.len(), "subscriptions applied");
        Ok(())
    }

    /// Waits for readiness on the subscribed targets.
    ///
    /// Returns at most `max_events` events, or an empty vector once
    /// `timeout` elapses. `None` waits indefinitely. A zero timeout polls
    /// without leaving the calling task; otherwise the kernel wait runs on a
    /// helper thread and only this task is suspended.
    ///
    /// # Errors
    ///
    /// - [`Error::Interrupted`] if the wait was unblocked with nothing ready.
    /// - [`Error::AlreadyWaiting`] if another wait is in flight.
    /// - [`Error::InvalidHandle`] if the queue is closed, before or during
    ///   the wait.
    /// - [`Error::Os`] with `EINVAL` if `max_events` is zero.
    pub async fn wait(
        &self,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReadinessEvent>> {
        self.wait_bridged(max_events, timeout)
            .await
            .map_err(record)
    }

    async fn wait_bridged(
        &self,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReadinessEvent>> {
        let poller = self.poller()?;
        if max_events == 0 {
            return Err(Error::os(libc::EINVAL));
        }

        let guard = Arc::new(self.wait.begin()?);
        if let Some(events) = self.shared.take_backlog(max_events) {
            return Ok(events);
        }

        let deadline = deadline(timeout);
        let mut events = poller.events(max_events);

        loop {
            let remaining = remaining(deadline);

            let outcome = if remaining == Some(Duration::ZERO) {
                poller.wait_raw(&mut events, remaining)
            } else {
                let blocking = poller.clone();
                let held = guard.clone();
                let shared = self.shared.clone();
                let salvaged = poller.clone();

                let (returned, outcome, _held): Handoff = bridge::run_blocking_with(
                    move || {
                        let outcome = blocking.wait_raw(&mut events, remaining);
                        (events, outcome, held)
                    },
                    Arc::new(self.unblocker()),
                    move |(events, outcome, _held): Handoff| {
                        shared.salvage(&salvaged, &events, outcome);
                    },
                )
                .await?;

                events = returned;
                outcome
            };

            match self.step(&poller, &events, outcome, max_events, deadline) {
                Step::Done(result) => return result,
                Step::Retry => continue,
            }
        }
    }

    /// Like [`wait`](Self::wait), but blocks the calling thread in the
    /// kernel directly.
    ///
    /// For callers with no runtime to hand the call to. Another thread can
    /// still end it early through an [`Unblocker`].
    pub fn wait_blocking(
        &self,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReadinessEvent>> {
        self.wait_direct(max_events, timeout).map_err(record)
    }

    fn wait_direct(
        &self,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReadinessEvent>> {
        let poller = self.poller()?;
        if max_events == 0 {
            return Err(Error::os(libc::EINVAL));
        }

        let _guard = self.wait.begin()?;
        if let Some(events) = self.shared.take_backlog(max_events) {
            return Ok(events);
        }

        let deadline = deadline(timeout);
        let mut events = poller.events(max_events);

        loop {
            let outcome = poller.wait_raw(&mut events, remaining(deadline));

            match self.step(&poller, &events, outcome, max_events, deadline) {
                Step::Done(result) => return result,
                Step::Retry => continue,
            }
        }
    }

    // Interprets one return from the kernel wait.
    fn step(
        &self,
        poller: &Poller,
        events: &RawEvents,
        outcome: std::result::Result<usize, i32>,
        max_events: usize,
        deadline: Option<Instant>,
    ) -> Step {
        if self.is_closed() {
            return Step::Done(Err(Error::InvalidHandle));
        }

        let n = match outcome {
            Ok(n) => n,
            Err(libc::EINTR) => 0,
            Err(code) => return Step::Done(Err(Error::os(code))),
        };

        let mut collected = Vec::new();
        let woken = poller.collect(events, n, &mut collected);

        if !collected.is_empty() {
            return Step::Done(Ok(self.shared.deliver(collected, max_events)));
        }

        if self.wait.take_unblocked() {
            debug!("wait interrupted");
            return Step::Done(Err(Error::Interrupted));
        }

        if remaining(deadline) == Some(Duration::ZERO) {
            return Step::Done(Ok(Vec::new()));
        }

        // Signal, stale wake, or only internal entries: keep waiting out
        // the remaining time.
        trace!(n, woken, "spurious wakeup, waiting again");
        Step::Retry
    }

    /// A handle that can force the in-flight wait to return from any
    /// thread.
    pub fn unblocker(&self) -> Unblocker {
        let poller = lock(&self.shared.poller)
            .as_ref()
            .map(Arc::downgrade)
            .unwrap_or_default();

        Unblocker::new(self.wait.clone(), poller)
    }

    /// Releases the kernel object and every registration on it.
    ///
    /// A wait in flight returns [`Error::InvalidHandle`]. The descriptor is
    /// closed once that wait has left the kernel.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if the queue was already closed.
    pub fn close(&self) -> Result<()> {
        let poller = lock(&self.shared.poller)
            .take()
            .ok_or(Error::InvalidHandle)
            .map_err(record)?;

        lock(&self.shared.backlog).clear();

        if self.wait.is_waiting() {
            // Best effort; the waiter also sees the closed flag on its next
            // pass.
            let _ = poller.wake();
        }

        debug!(fd = poller.raw_fd(), "closed readiness queue");
        Ok(())
    }

    fn poller(&self) -> Result<Arc<Poller>> {
        lock(&self.shared.poller).clone().ok_or(Error::InvalidHandle)
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        lock(&self.poller).is_none()
    }

    // Hands back up to `max_events` and keeps the rest for the next wait.
    fn deliver(&self, mut collected: Vec<ReadinessEvent>, max_events: usize) -> Vec<ReadinessEvent> {
        if collected.len() > max_events {
            let overflow = collected.split_off(max_events);
            trace!(count = overflow.len(), "events held for next wait");
            lock(&self.backlog).extend(overflow);
        }

        collected
    }

    fn take_backlog(&self, max_events: usize) -> Option<Vec<ReadinessEvent>> {
        let mut backlog = lock(&self.backlog);
        if backlog.is_empty() {
            return None;
        }

        let count = max_events.min(backlog.len());
        Some(backlog.drain(..count).collect())
    }

    // Drops held events for a target that is no longer subscribed.
    fn forget(&self, target: Target) {
        lock(&self.backlog).retain(|event| event.target != target);
    }

    // Keeps what a wait collected after its caller stopped listening, so
    // edge-triggered and oneshot readiness is not lost.
    fn salvage(
        &self,
        poller: &Poller,
        events: &RawEvents,
        outcome: std::result::Result<usize, i32>,
    ) {
        let Ok(n) = outcome else {
            return;
        };

        let mut collected = Vec::new();
        poller.collect(events, n, &mut collected);
        if collected.is_empty() {
            return;
        }

        let mut backlog = lock(&self.backlog);
        if self.is_closed() {
            return;
        }

        debug!(
            count = collected.len(),
            "events of an abandoned wait held for next wait"
        );
        backlog.extend(collected);
    }
}

impl fmt::Debug for ReadinessQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessQueue")
            .field("backend", &self.backend)
            .field("fd", &self.raw_fd())
            .field("waiting", &self.wait.is_waiting())
            .finish()
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    // Too far out to represent: treat as no deadline.
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::event::Readiness;

    #[test]
    fn remaining_saturates_at_zero() {
        let past = Instant::now() - Duration::from_millis(5);
        assert_eq!(remaining(Some(past)), Some(Duration::ZERO));
        assert_eq!(remaining(None), None);
    }

    #[test]
    fn unrepresentable_timeout_waits_forever() {
        assert_eq!(deadline(Some(Duration::MAX)), None);
        assert!(deadline(Some(Duration::from_secs(1))).is_some());
    }

    #[test]
    fn backlog_is_served_before_the_kernel() {
        let queue = ReadinessQueue::new().unwrap();
        let event = |fd| ReadinessEvent {
            target: Target::Descriptor(fd),
            readiness: Readiness::READABLE,
            tag: fd as u64,
            data: 0,
        };

        let delivered = queue.shared.deliver(vec![event(1), event(2), event(3)], 1);
        assert_eq!(delivered, vec![event(1)]);

        queue.shared.forget(Target::Descriptor(3));
        let held = queue.wait_blocking(8, Some(Duration::ZERO)).unwrap();
        assert_eq!(held, vec![event(2)]);
    }
}
