//! Kernel event notification for a cooperative async runtime.
//!
//! This crate pairs a small single-threaded runtime with a uniform
//! interface over the kernel's event queues (epoll, kqueue), and bridges
//! the two: a task that waits on a queue hands the blocking kernel call to
//! a helper thread and suspends, so the rest of the runtime keeps running.
//!
//! # Architecture
//!
//! - **Capability probe**: which kernel facilities this build can use
//! - **ReadinessQueue**: create, update, wait on and close a kernel queue
//! - **Bridge**: runs a blocking call off the runtime thread, with unblock
//! - **Error surface**: typed errors plus the thread's last OS error code
//! - **Runtime**: `block_on`, task spawning, timers and helper threads
//!
//! # Example
//!
//! ```ignore
//! use kbridge::{Interest, ReadinessQueue, Runtime, Subscription, Target};
//! use std::time::Duration;
//!
//! let mut rt = Runtime::new();
//! let queue = ReadinessQueue::new()?;
//! queue.update(&[Subscription::add(Target::Descriptor(fd), Interest::READABLE).with_tag(1)])?;
//!
//! let events = rt.block_on(queue.wait(16, Some(Duration::from_secs(1))))?;
//! ```

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
compile_error!("kbridge supports Linux, Android, macOS, iOS, FreeBSD and DragonFly only");

pub mod bridge;
mod builder;
pub mod capability;
mod error;
mod reactor;
mod runtime;
mod task;
mod timer;
mod utils;

pub use builder::RuntimeBuilder;
pub use capability::{Backend, CapabilitySet, Facility};
pub use error::{Error, Result, last_os_error};
pub use reactor::event::{Readiness, ReadinessEvent};
pub use reactor::interest::{Action, Flags, Interest, Subscription, Target};
pub use reactor::queue::{QueueBuilder, ReadinessQueue};
pub use reactor::unblock::Unblocker;
pub use runtime::Runtime;
pub use runtime::yield_now::{YieldNow, yield_now};
pub use task::{JoinHandle, JoinSet, Task};
pub use timer::{Sleep, sleep};
