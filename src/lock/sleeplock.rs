//! Blocking exclusive lock, safe to hold across disk I/O.
//!
//! A short spinlock guards only the `locked` flag; the data itself is held
//! for long stretches (an entire disk transfer) without any spinlock held.
//! A kernel would park the waiting thread on a channel and wake it on
//! release; without a scheduler underneath, a waiter spins politely instead.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};

use spin::Mutex;

pub struct SleepLock<T: ?Sized> {
    /// The long-term hold flag, guarded by a short spin mutex.
    locked: Mutex<bool>,
    name: &'static str,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: Mutex::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Block until the lock is free, then take it.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            let mut locked = self.locked.lock();
            if !*locked {
                *locked = true;
                break;
            }
            drop(locked);
            hint::spin_loop();
        }
        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// Whether some thread currently holds the lock.
    pub fn holding(&self) -> bool {
        *self.locked.lock()
    }

    /// Called by the guard when dropped. Releasing a lock nobody holds is
    /// a caller bug with corruption potential, so it halts.
    fn unlock(&self) {
        let mut locked = self.locked.lock();
        if !*locked {
            panic!("sleeplock {}: release while not held", self.name);
        }
        *locked = false;
    }
}

pub struct SleepLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
