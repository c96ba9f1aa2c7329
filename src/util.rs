//! Shared utility functions.

use std::sync::{Mutex, MutexGuard};

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run a blocking closure on the runtime's blocking thread pool.
///
/// A panic inside `f` surfaces as `Error::TaskJoin`.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate is a short, non-panicking update,
/// so the protected data is consistent even after poisoning.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
