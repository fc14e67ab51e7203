//! Readiness notification on top of the kernel's event queues.
//!
//! - [`interest`]: targets, interests and subscription requests
//! - [`event`]: readiness reported back by a wait
//! - [`queue`]: the queue itself, create / update / wait / close
//! - [`unblock`]: forcing an in-flight wait to return
//!
//! The backends live in `poller`; epoll on Linux and Android, kqueue on
//! the BSDs and Apple platforms.

pub mod event;
pub mod interest;
pub(crate) mod poller;
pub mod queue;
pub mod unblock;
