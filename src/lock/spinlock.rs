//! Non-blocking exclusive lock for short bookkeeping sections.
//!
//! Must never be held across an operation that can block: a waiter
//! busy-waits, so sleeping with one of these held stalls every other
//! thread spinning on it.

use spin::{Mutex, MutexGuard};

pub type SpinLockGuard<'a, T> = MutexGuard<'a, T>;

/// A named spinlock. The name shows up in diagnostics and panics.
pub struct SpinLock<T: ?Sized> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Busy-wait until the lock is free, then take it.
    pub fn acquire(&self) -> SpinLockGuard<'_, T> {
        self.inner.lock()
    }

    /// Take the lock only if it is currently free.
    pub fn try_acquire(&self) -> Option<SpinLockGuard<'_, T>> {
        self.inner.try_lock()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
