//! Releasing the execution token around blocking kernel calls.
//!
//! The runtime polls tasks on one thread. A task that needs to block in the
//! kernel hands the call to a helper thread and suspends; the runtime keeps
//! polling every other task until the helper finishes and wakes it.
//!
//! The blocking call must capture everything it needs, including any
//! `errno` it observes, in its return value. Nothing it touches may belong
//! to the runtime thread.

mod call;
pub(crate) mod pool;
mod region;

pub use region::Unblock;

pub(crate) use pool::{BlockingPool, PoolConfig};

use crate::error::{Error, Result};
use crate::runtime::context;
use call::{BlockingCall, Completion};
use region::Region;

use std::sync::Arc;

use tracing::warn;

/// Runs `work` on a helper thread while the calling task is suspended.
///
/// `unblock` must make `work` return promptly when invoked. It fires when
/// the task is interrupted, when the runtime shuts down, and when this
/// future is dropped before `work` returns.
///
/// Outside a runtime the call still runs on a helper thread, taken from a
/// process-wide pool.
///
/// # Errors
///
/// [`Error::ResourceExhausted`] or [`Error::Os`] if no helper thread could
/// be started.
///
/// # Example
/// ```ignore
/// let n = kbridge::bridge::run_blocking(
///     move || unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) },
///     Arc::new(move || wake_reader()),
/// )
/// .await?;
/// ```
pub async fn run_blocking<F, T>(work: F, unblock: Arc<dyn Unblock>) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    run_blocking_with(work, unblock, drop::<T>).await
}

/// Like [`run_blocking`], but an outcome produced after the caller went
/// away is handed to `salvage` instead of being dropped.
///
/// `salvage` runs on the helper thread if `work` was still running when
/// the future was dropped, otherwise on the thread that dropped it.
pub(crate) async fn run_blocking_with<F, T, S>(
    work: F,
    unblock: Arc<dyn Unblock>,
    salvage: S,
) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    S: FnOnce(T) + Send + 'static,
{
    let call = BlockingCall::new(Box::new(salvage));
    let pool = context::blocking_pool();
    let mut region = Region::enter(unblock);

    let slot = call.clone();
    let submitted = pool.execute(Box::new(move || {
        let outcome = work();
        slot.complete(outcome);
    }));

    if let Err(code) = submitted {
        warn!(code, "no helper thread for blocking call");
        region.complete();
        return Err(Error::allocation(code));
    }

    let outcome = Completion::new(call).await;
    region.complete();

    Ok(outcome)
}
