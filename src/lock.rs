// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A typed wrapper that ties the raw lock to the data it protects.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::mrqd::RawMrqdLock;

/// An MRQD lock protecting a value of type `T`.
///
/// Shared access is handed out through [`ReadGuard`]s, exclusive access
/// through [`WriteGuard`]s; dropping a guard releases the corresponding
/// side of the lock. [`delegate`](MrqdLock::delegate) runs a closure against
/// the protected value under the lock without the caller necessarily ever
/// holding it.
///
/// # Example
///
/// ```
/// use mrqd::MrqdLock;
///
/// let lock = MrqdLock::new(0u64);
///
/// *lock.write() += 1;
/// assert_eq!(*lock.read(), 1);
///
/// // Without contention a delegated section runs before delegate() returns.
/// lock.delegate(|v| *v += 1);
/// assert_eq!(*lock.read(), 2);
/// ```
pub struct MrqdLock<T> {
    raw: RawMrqdLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for MrqdLock<T> {}

/// Readers share `&T`; writers and delegated messages get `&mut T` under
/// mutual exclusion.
unsafe impl<T: Send + Sync> Sync for MrqdLock<T> {}

/// Carries the protected-data pointer into a delegated message. Safe to
/// send: the message runs while the session holds the mutex, which is the
/// only path to the data.
struct DataPtr<T>(*mut T);
unsafe impl<T: Send> Send for DataPtr<T> {}

/// Shared access to the protected value; dropping it releases the read
/// side of the lock.
pub struct ReadGuard<'a, T: 'a> {
    lock: &'a MrqdLock<T>,
}

/// Exclusive access to the protected value; dropping it releases the lock.
pub struct WriteGuard<'a, T: 'a> {
    lock: &'a MrqdLock<T>,
}

impl<T> MrqdLock<T> {
    pub fn new(data: T) -> MrqdLock<T> {
        MrqdLock {
            raw: RawMrqdLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Blocks until shared ownership is held.
    pub fn read(&self) -> ReadGuard<'_, T> {
        self.raw.rlock();
        ReadGuard { lock: self }
    }

    /// Blocks until exclusive ownership is held.
    pub fn write(&self) -> WriteGuard<'_, T> {
        self.raw.lock();
        WriteGuard { lock: self }
    }

    /// Makes one attempt at exclusive ownership without blocking.
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(WriteGuard { lock: self })
        } else {
            None
        }
    }

    /// An advisory snapshot of the write side.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Runs `f` against the protected value under the lock, delegating to
    /// the current holder when the lock is contended.
    ///
    /// Returns as soon as `f` has been executed or accepted by a holder;
    /// an accepted closure runs before that holder releases the lock. `f`
    /// must not touch this lock.
    pub fn delegate<F>(&self, f: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
        T: Send + 'static,
    {
        let data = DataPtr(self.data.get());
        self.raw.delegate(move || {
            // The executing session holds the mutex, and the lock must be
            // quiescent before it can be dropped, so the pointer is live
            // and exclusive.
            unsafe { f(&mut *data.0) };
        });
    }
}

impl<T: Default> Default for MrqdLock<T> {
    fn default() -> MrqdLock<T> {
        MrqdLock::new(T::default())
    }
}

impl<T> fmt::Debug for MrqdLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MrqdLock")
    }
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.runlock();
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
