use crate::bridge::Unblock;
use crate::error::{Error, Result};
use crate::reactor::poller::Poller;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tracing::{trace, warn};

const IDLE: u8 = 0;
const WAITING: u8 = 1;
const UNBLOCKED: u8 = 2;

/// Tracks whether a queue has a wait in flight and whether it was asked to
/// return early.
#[derive(Debug, Default)]
pub(crate) struct WaitState {
    state: AtomicU8,
}

impl WaitState {
    /// Claims the queue for one wait. The claim lasts until the guard is
    /// dropped, including by a helper thread still inside the kernel.
    pub(crate) fn begin(self: &Arc<Self>) -> Result<WaitGuard> {
        self.state
            .compare_exchange(IDLE, WAITING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyWaiting)?;

        Ok(WaitGuard {
            state: self.clone(),
        })
    }

    /// Marks the in-flight wait as unblocked. False if nothing is waiting
    /// or it was already unblocked.
    fn unblock(&self) -> bool {
        self.state
            .compare_exchange(WAITING, UNBLOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Consumes a pending unblock request.
    pub(crate) fn take_unblocked(&self) -> bool {
        self.state
            .compare_exchange(UNBLOCKED, WAITING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) != IDLE
    }
}

pub(crate) struct WaitGuard {
    state: Arc<WaitState>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.state.state.store(IDLE, Ordering::Release);
    }
}

/// Makes a queue's in-flight wait return [`Error::Interrupted`].
///
/// Cheap to clone and usable from any thread. Obtained from
/// [`ReadinessQueue::unblocker`](crate::ReadinessQueue::unblocker).
#[derive(Clone)]
pub struct Unblocker {
    state: Arc<WaitState>,
    poller: Weak<Poller>,
}

impl Unblocker {
    pub(crate) fn new(state: Arc<WaitState>, poller: Weak<Poller>) -> Self {
        Self { state, poller }
    }

    /// Forces the current wait on the queue to return.
    ///
    /// Returns false, and changes nothing, if no wait is in flight or the
    /// queue is closed. A wait that has events in hand when the request
    /// lands returns them instead.
    pub fn unblock(&self) -> bool {
        if !self.state.unblock() {
            return false;
        }

        let Some(poller) = self.poller.upgrade() else {
            return false;
        };

        if let Err(code) = poller.wake() {
            warn!(code, "failed to signal queue wake primitive");
        }

        trace!(fd = poller.raw_fd(), "wait unblocked");
        true
    }
}

impl fmt::Debug for Unblocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unblocker")
            .field("waiting", &self.state.is_waiting())
            .field("closed", &(self.poller.strong_count() == 0))
            .finish()
    }
}

impl Unblock for Unblocker {
    fn unblock(&self) {
        Unblocker::unblock(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_wait_is_rejected() {
        let state = Arc::new(WaitState::default());
        let guard = state.begin().unwrap();

        assert!(matches!(state.begin(), Err(Error::AlreadyWaiting)));
        drop(guard);
        assert!(state.begin().is_ok());
    }

    #[test]
    fn unblock_without_waiter_is_a_no_op() {
        let state = Arc::new(WaitState::default());
        let unblocker = Unblocker::new(state.clone(), Weak::new());

        assert!(!unblocker.unblock());
        assert!(!state.is_waiting());

        let _guard = state.begin().unwrap();
        assert!(!state.take_unblocked());
    }

    #[test]
    fn unblock_is_consumed_once() {
        let state = Arc::new(WaitState::default());
        let _guard = state.begin().unwrap();

        assert!(state.unblock());
        assert!(!state.unblock());
        assert!(state.take_unblocked());
        assert!(!state.take_unblocked());
    }

    #[test]
    fn shared_guard_releases_with_its_last_holder() {
        let state = Arc::new(WaitState::default());
        let guard = Arc::new(state.begin().unwrap());
        let helper = guard.clone();

        drop(guard);
        assert!(state.is_waiting());

        drop(helper);
        assert!(!state.is_waiting());
    }
}
