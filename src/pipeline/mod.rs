//! Turn-taking pipeline: queues, shared session state, and the coordinator
//! that runs the dispatcher, turn workers, speaker loop, and sleep watchdog.

pub mod coordinator;
pub mod messages;
pub mod queues;
pub mod session;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Critical sections in the pipeline only do plain field updates, so a
/// poisoned lock still guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
