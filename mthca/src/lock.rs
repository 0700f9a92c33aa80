//! Interruptible device mutex and cancellation token.
//!
//! Lifecycle operations serialize on one lock per device. Acquisition is
//! cancellable: a caller blocked on the lock can be released early and
//! observes `Error::Interrupted` with no partial progress. Once acquired,
//! an operation always runs to a terminal outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// How often a blocked acquirer re-checks its cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Cancellation token for lock waits.
///
/// Cheap to clone; all clones observe the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel. Pending and future waits using this token fail with
    /// `Error::Interrupted`.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Condvar-based mutual exclusion with cancellable acquisition.
#[derive(Debug)]
pub(crate) struct DeviceLock {
    held: Mutex<bool>,
    cv: Condvar,
}

impl DeviceLock {
    pub(crate) fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Acquire the lock, or fail with `Interrupted` once `cancel` fires.
    pub(crate) fn acquire(&self, cancel: &CancelToken) -> Result<DeviceLockGuard<'_>> {
        let mut held = self.held.lock().unwrap();
        while *held {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let (guard, _timeout) = self.cv.wait_timeout(held, CANCEL_POLL).unwrap();
            held = guard;
        }
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        *held = true;
        Ok(DeviceLockGuard { lock: self })
    }
}

/// RAII guard for [`DeviceLock`]; releases on drop.
pub(crate) struct DeviceLockGuard<'a> {
    lock: &'a DeviceLock,
}

impl Drop for DeviceLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.lock.held.lock().unwrap();
        *held = false;
        self.lock.cv.notify_one();
    }
}
