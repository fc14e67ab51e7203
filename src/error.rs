//! Error taxonomy and the per-thread OS error surface.
//!
//! Every failing operation in this crate records the OS error code that
//! describes it before returning, so [`last_os_error`] read right after a
//! failure reports that code even when the kernel call itself ran on a
//! helper thread.

use std::cell::Cell;
use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by readiness queues and the blocking-call bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The OS refused to allocate a queue or one of its descriptors.
    #[error("readiness queue allocation denied: {}", io::Error::from_raw_os_error(*code))]
    ResourceExhausted { code: i32 },

    /// Operation on a queue that was closed or never opened.
    #[error("operation on a closed or unknown readiness queue")]
    InvalidHandle,

    /// A second wait was started on a queue that is already waiting.
    #[error("a wait is already in progress on this readiness queue")]
    AlreadyWaiting,

    /// The wait was cut short by an unblock request.
    #[error("wait interrupted by an unblock request")]
    Interrupted,

    /// The selected backend cannot watch this kind of target.
    #[error("{target} targets are not supported by the {backend} backend")]
    Unsupported {
        target: &'static str,
        backend: &'static str,
    },

    /// A batch update failed after some of its subscriptions were applied.
    #[error("update stopped after {applied} applied subscriptions")]
    Partial {
        applied: usize,
        #[source]
        source: Box<Error>,
    },

    /// Failure reported by the kernel, passed through verbatim.
    #[error("{}", io::Error::from_raw_os_error(*code))]
    Os { code: i32 },
}

impl Error {
    /// A kernel failure, kept as is. `EINTR` stays [`Error::Os`] here:
    /// only an unblock request yields [`Error::Interrupted`].
    pub(crate) fn os(code: i32) -> Self {
        Error::Os { code }
    }

    /// Maps a failed allocation (queue, wake primitive, watch instance).
    pub(crate) fn allocation(code: i32) -> Self {
        match code {
            libc::EMFILE | libc::ENFILE | libc::ENOMEM | libc::ENOSPC => {
                Error::ResourceExhausted { code }
            }
            _ => Error::os(code),
        }
    }

    /// Returns the OS error code that describes this error.
    ///
    /// Errors that do not come from the kernel map to the code the OS
    /// documents for the same failure class.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            Error::ResourceExhausted { code } | Error::Os { code } => *code,
            Error::InvalidHandle => libc::EBADF,
            Error::AlreadyWaiting => libc::EBUSY,
            Error::Interrupted => libc::EINTR,
            Error::Unsupported { .. } => libc::EOPNOTSUPP,
            Error::Partial { source, .. } => source.raw_os_error(),
        }
    }

    /// True for conditions that point at a caller bug or a resource limit
    /// rather than a transient fault.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted { .. } | Error::InvalidHandle | Error::AlreadyWaiting
        )
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Interrupted => io::Error::new(io::ErrorKind::Interrupted, error),
            Error::Unsupported { .. } => io::Error::new(io::ErrorKind::Unsupported, error),
            other => io::Error::from_raw_os_error(other.raw_os_error()),
        }
    }
}

thread_local! {
    static LAST_OS_ERROR: Cell<i32> = const { Cell::new(0) };
}

/// Returns the OS error code of the most recent failing operation on this
/// thread, or 0 if none has failed yet.
///
/// Successful operations leave the value untouched.
pub fn last_os_error() -> i32 {
    LAST_OS_ERROR.with(Cell::get)
}

/// Records `error` on the error surface and hands it back.
pub(crate) fn record(error: Error) -> Error {
    LAST_OS_ERROR.with(|last| last.set(error.raw_os_error()));
    error
}

/// Reads the calling thread's `errno`.
///
/// Must run immediately after the failing call, before anything else on
/// this thread can issue another one.
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Turns a `-1`-on-failure return value into a result carrying `errno`.
pub(crate) fn cvt<T: IsMinusOne>(ret: T) -> std::result::Result<T, i32> {
    if ret.is_minus_one() {
        Err(errno())
    } else {
        Ok(ret)
    }
}

pub(crate) trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

macro_rules! impl_is_minus_one {
    ($($t:ident)*) => ($(impl IsMinusOne for $t {
        fn is_minus_one(&self) -> bool {
            *self == -1
        }
    })*)
}

impl_is_minus_one! { i32 i64 isize }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failures_map_to_resource_exhausted() {
        assert_eq!(
            Error::allocation(libc::EMFILE),
            Error::ResourceExhausted { code: libc::EMFILE }
        );
        assert_eq!(
            Error::allocation(libc::EINVAL),
            Error::Os { code: libc::EINVAL }
        );
    }

    #[test]
    fn kernel_eintr_is_not_an_unblock() {
        let error = Error::os(libc::EINTR);
        assert_eq!(error, Error::Os { code: libc::EINTR });
        assert_eq!(error.raw_os_error(), libc::EINTR);
    }

    #[test]
    fn partial_reports_its_source_code() {
        let error = Error::Partial {
            applied: 2,
            source: Box::new(Error::Os { code: libc::ENOENT }),
        };

        assert_eq!(error.raw_os_error(), libc::ENOENT);
    }

    #[test]
    fn record_sets_last_os_error_for_this_thread_only() {
        record(Error::InvalidHandle);
        assert_eq!(last_os_error(), libc::EBADF);

        let other = std::thread::spawn(last_os_error).join().unwrap();
        assert_eq!(other, 0);
    }

    #[test]
    fn cvt_captures_errno() {
        let ret = unsafe { libc::close(-1) };
        assert_eq!(cvt(ret), Err(libc::EBADF));
        assert_eq!(cvt(0i32), Ok(0));
    }
}
