use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock, ignoring poisoning. Only for critical sections which never leave state half-updated.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
