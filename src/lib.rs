// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A multiple-reader queue-delegation (MRQD) lock.
//!
//! Readers announce themselves on a striped read indicator instead of a
//! single shared counter, so concurrent readers do not contend on one cache
//! line. Writers serialize on an inner test-and-test-and-set mutex and drain
//! the indicator before entering their critical section. A writer that finds
//! the mutex taken can instead *delegate*: it hands its critical section to
//! the current holder as a message and returns as soon as the message has
//! been accepted. Readers stalled behind a stream of writers raise a write
//! barrier that holds new writers and delegators back until the readers get
//! through.
//!
//! The crate exposes three surfaces:
//!
//! - [`RawMrqdLock`]: the bare protocol
//!   (`lock`/`unlock`/`try_lock`/`is_locked`/`rlock`/`runlock`/`delegate`).
//! - [`MrqdLock`]: an RAII wrapper tying the raw lock to the data it
//!   protects, with read/write guards and typed delegation.
//! - The [`Lock`], [`SharedLock`] and [`DelegationLock`] capability traits,
//!   through which callers can dispatch over different lock variants.

mod indicator;
mod queue;

pub mod lock;
pub mod mrqd;
pub mod tatas;

pub use crate::lock::{MrqdLock, ReadGuard, WriteGuard};
pub use crate::mrqd::{RawMrqdLock, READ_PATIENCE_LIMIT};
pub use crate::tatas::TatasLock;

/// Threshold after how many iterations we log a warning for busy spinning
/// loops.
///
/// This helps with debugging to figure out where things may end up blocking.
/// Should be a power of two to avoid divisions.
pub(crate) const WARN_THRESHOLD: usize = 1 << 28;

/// A critical section handed to the lock holder for deferred execution.
///
/// The message runs exactly once, under the lock, on whichever thread holds
/// the lock when the message is flushed. It must not reacquire the lock it
/// was delegated to.
pub type Deferred = Box<dyn FnOnce() + Send + 'static>;

/// Exclusive acquisition. Every lock variant in this crate offers at least
/// this surface; releasing the storage itself is `Drop`.
pub trait Lock {
    /// Blocks until the lock is held exclusively.
    fn lock(&self);

    /// Releases exclusive ownership. Callers must hold the lock.
    fn unlock(&self);

    /// Makes one acquisition attempt without blocking. Returns true iff the
    /// lock is now held exclusively by the caller.
    fn try_lock(&self) -> bool;

    /// An advisory snapshot of the lock state; it can be stale by the time
    /// the caller looks at it.
    fn is_locked(&self) -> bool;
}

/// Shared (read-side) acquisition on top of [`Lock`].
pub trait SharedLock: Lock {
    /// Blocks until shared ownership is held. Any number of threads can hold
    /// shared ownership at once; none can while a writer is inside.
    fn rlock(&self);

    /// Releases shared ownership. Must pair 1:1 with an `rlock` by the same
    /// thread.
    fn runlock(&self);
}

/// Delegation on top of [`Lock`]: instead of acquiring, hand the critical
/// section to whoever holds the lock.
pub trait DelegationLock: Lock {
    /// Returns once `msg` has been executed, or has been accepted for
    /// execution by the current holder before it releases the lock.
    fn delegate(&self, msg: Deferred);
}
