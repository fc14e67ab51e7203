//! Runtime subsystem modules.

pub(crate) mod context;
mod core;
pub(crate) mod executor;
mod handle;
pub(crate) mod queue;
pub(crate) mod waker;
pub mod yield_now;

pub(crate) use context::{InterruptSlot, enter_context};
pub use core::Runtime;
pub(crate) use executor::Executor;
pub(crate) use handle::Handle;
pub(crate) use queue::TaskQueue;
pub(crate) use waker::make_waker;
