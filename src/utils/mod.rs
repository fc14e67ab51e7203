pub(crate) mod slab;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a bookkeeping mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
