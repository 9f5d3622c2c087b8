// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A test-and-test-and-set spinlock.
//!
//! This is the writer mutex the MRQD lock is built on; the reader and
//! delegation layers live on top of it. It is also usable on its own as the
//! plainest [`Lock`](crate::Lock) variant in the crate.

use core::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::warn;

use crate::{Lock, WARN_THRESHOLD};

/// A test-and-test-and-set spinlock.
///
/// Waiters spin on a plain load of the flag and only attempt the atomic swap
/// once the flag has been observed clear. Every access to the flag is
/// `SeqCst`: `is_locked()` is the writer-side half of the store-load
/// handshake with the read indicator, and neither side may be reordered.
pub struct TatasLock {
    locked: AtomicBool,
}

impl TatasLock {
    pub fn new() -> TatasLock {
        TatasLock {
            locked: AtomicBool::new(false),
        }
    }

    /// Spins until the lock has been acquired, yielding the processor on
    /// every failed round.
    pub fn lock(&self) {
        let mut iter = 0;
        loop {
            if !self.locked.load(Ordering::SeqCst) && !self.locked.swap(true, Ordering::SeqCst) {
                return;
            }
            thread::yield_now();
            iter += 1;
            if iter % WARN_THRESHOLD == 0 {
                warn!("lock() spinning for a long time on the test-and-set flag");
            }
        }
    }

    /// Makes a single acquisition attempt; never spins.
    pub fn try_lock(&self) -> bool {
        !self.locked.load(Ordering::SeqCst) && !self.locked.swap(true, Ordering::SeqCst)
    }

    /// Releases the lock; callers must hold it.
    pub fn unlock(&self) {
        let held = self.locked.swap(false, Ordering::SeqCst);
        debug_assert!(held, "unlock() called without holding the lock");
    }

    /// A snapshot of the flag.
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

impl Default for TatasLock {
    fn default() -> TatasLock {
        TatasLock::new()
    }
}

impl Lock for TatasLock {
    fn lock(&self) {
        TatasLock::lock(self)
    }

    fn unlock(&self) {
        TatasLock::unlock(self)
    }

    fn try_lock(&self) -> bool {
        TatasLock::try_lock(self)
    }

    fn is_locked(&self) -> bool {
        TatasLock::is_locked(self)
    }
}
