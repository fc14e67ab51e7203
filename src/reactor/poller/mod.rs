//! Kernel backends behind the readiness queue.
//!
//! Each backend exposes the same inherent methods; [`Poller`] dispatches
//! to whichever one the capability probe selected. Only the backends the
//! target platform provides are compiled.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
mod kqueue;

use crate::capability::Backend;
use crate::error::Error;
use crate::reactor::event::ReadinessEvent;
use crate::reactor::interest::Subscription;

use std::os::fd::RawFd;
use std::time::Duration;

pub(crate) enum Poller {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::EpollPoller),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    Kqueue(kqueue::KqueuePoller),
}

/// Kernel-format event buffer handed to the blocking wait.
pub(crate) enum RawEvents {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::RawEvents),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    Kqueue(kqueue::RawEvents),
}

impl Poller {
    pub(crate) fn new(backend: Backend, size_hint: usize) -> Result<Self, Error> {
        match backend {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll => Ok(Poller::Epoll(epoll::EpollPoller::new(size_hint)?)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Backend::Kqueue => Ok(Poller::Kqueue(kqueue::KqueuePoller::new(size_hint)?)),
            #[allow(unreachable_patterns)]
            _ => Err(Error::Unsupported {
                target: "queue",
                backend: backend.name(),
            }),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(poller) => poller.raw_fd(),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(poller) => poller.raw_fd(),
        }
    }

    pub(crate) fn submit(&self, subscription: &Subscription) -> Result<(), Error> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(poller) => poller.submit(subscription),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(poller) => poller.submit(subscription),
        }
    }

    pub(crate) fn events(&self, capacity: usize) -> RawEvents {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(_) => RawEvents::Epoll(epoll::RawEvents::with_capacity(capacity)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(_) => RawEvents::Kqueue(kqueue::RawEvents::with_capacity(capacity)),
        }
    }

    /// The kernel wait itself. May block for as long as `timeout` allows.
    ///
    /// Returns the number of entries written into `events`, or the `errno`
    /// read immediately after the call returned.
    pub(crate) fn wait_raw(
        &self,
        events: &mut RawEvents,
        timeout: Option<Duration>,
    ) -> Result<usize, i32> {
        match (self, events) {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            (Poller::Epoll(poller), RawEvents::Epoll(events)) => poller.wait_raw(events, timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            (Poller::Kqueue(poller), RawEvents::Kqueue(events)) => {
                poller.wait_raw(events, timeout)
            }
            #[allow(unreachable_patterns)]
            _ => Err(libc::EINVAL),
        }
    }

    /// Translates the first `n` raw entries into events appended to `out`.
    ///
    /// Returns true if the queue's wake primitive fired.
    pub(crate) fn collect(
        &self,
        events: &RawEvents,
        n: usize,
        out: &mut Vec<ReadinessEvent>,
    ) -> bool {
        match (self, events) {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            (Poller::Epoll(poller), RawEvents::Epoll(events)) => poller.collect(events, n, out),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            (Poller::Kqueue(poller), RawEvents::Kqueue(events)) => poller.collect(events, n, out),
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }

    /// Kicks a blocked wait out of the kernel.
    pub(crate) fn wake(&self) -> Result<(), i32> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(poller) => poller.wake(),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(poller) => poller.wake(),
        }
    }

    /// Number of live registrations.
    pub(crate) fn registered(&self) -> usize {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(poller) => poller.registered(),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(poller) => poller.registered(),
        }
    }
}
