use crate::runtime::context;
use crate::runtime::{Handle, InterruptSlot};

use std::sync::Arc;

use tracing::trace;

/// Forces an in-flight blocking call to return early.
///
/// Implementations must be callable from any thread, including while the
/// call they target is parked in the kernel, and must tolerate being
/// called when nothing is blocked.
pub trait Unblock: Send + Sync {
    fn unblock(&self);
}

impl<F> Unblock for F
where
    F: Fn() + Send + Sync,
{
    fn unblock(&self) {
        self()
    }
}

/// Span during which the current task has given up the execution token.
///
/// While a region is alive its unblock function is reachable from the
/// task's [`JoinHandle::interrupt`](crate::JoinHandle::interrupt) and from
/// [`Runtime::interrupt_blocking`](crate::Runtime::interrupt_blocking).
/// Dropping a region whose call has not completed fires the unblock
/// function so the helper thread does not stay parked in the kernel.
pub(crate) struct Region {
    unblock: Arc<dyn Unblock>,
    registration: Option<(Arc<Handle>, usize)>,
    interrupt: Option<Arc<InterruptSlot>>,
    completed: bool,
}

impl Region {
    pub(crate) fn enter(unblock: Arc<dyn Unblock>) -> Self {
        let registration =
            context::current_handle().map(|handle| {
                let key = handle.register_blocking(unblock.clone());
                (handle, key)
            });

        let interrupt = context::current_interrupt();
        if let Some(slot) = &interrupt {
            slot.arm(unblock.clone());
        }

        trace!(
            in_runtime = registration.is_some(),
            "execution token released"
        );

        Self {
            unblock,
            registration,
            interrupt,
            completed: false,
        }
    }

    pub(crate) fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Some((handle, key)) = self.registration.take() {
            handle.unregister_blocking(key);
        }

        if let Some(slot) = self.interrupt.take() {
            slot.disarm();
        }

        if self.completed {
            trace!("execution token reacquired");
        } else {
            trace!("blocking call abandoned, unblocking helper");
            self.unblock.unblock();
        }
    }
}
