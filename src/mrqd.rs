// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The multiple-reader queue-delegation lock protocol.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;
use log::warn;

use crate::indicator::ReaderGroups;
use crate::queue::DelegationQueue;
use crate::tatas::TatasLock;
use crate::{Deferred, DelegationLock, Lock, SharedLock, WARN_THRESHOLD};

/// The number of yield cycles a reader tolerates waiting behind a writer
/// before it raises the write barrier. A lower limit throttles writers
/// sooner under contention.
pub const READ_PATIENCE_LIMIT: usize = 1000;

/// A multiple-reader queue-delegation lock.
///
/// Writers serialize on an inner test-and-test-and-set mutex and then drain
/// the read indicator, so an exclusive section never overlaps a read
/// section. Readers publish themselves on the indicator and back off while
/// the mutex is held. A writer unwilling to wait can delegate its critical
/// section to the current holder through a bounded message queue; the holder
/// flushes all accepted messages before releasing the mutex.
///
/// Readers that have waited [`READ_PATIENCE_LIMIT`] yield cycles raise the
/// write barrier, which stalls *new* writers and delegators (never the
/// current holder) until the impatient readers have entered.
///
/// Neither side of the lock is reentrant: a thread inside an exclusive or
/// shared section must not acquire the same lock again, and a delegated
/// message must not touch the lock it was delegated to. The lock must be
/// quiescent (no in-flight operations) when dropped.
///
/// # Example
///
/// ```
/// use mrqd::RawMrqdLock;
///
/// let lock = RawMrqdLock::new();
///
/// lock.rlock();
/// assert!(!lock.is_locked());
/// lock.runlock();
///
/// lock.lock();
/// assert!(lock.is_locked());
/// lock.unlock();
/// ```
pub struct RawMrqdLock {
    mutex: TatasLock,
    queue: DelegationQueue<Deferred>,
    readers: ReaderGroups,
    write_barrier: CachePadded<AtomicUsize>,
}

impl RawMrqdLock {
    pub fn new() -> RawMrqdLock {
        RawMrqdLock {
            mutex: TatasLock::new(),
            queue: DelegationQueue::new(),
            readers: ReaderGroups::new(),
            write_barrier: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Spins while impatient readers hold the barrier up. Checked before any
    /// exclusive-acquisition attempt; never checked by the current holder.
    fn wait_on_write_barrier(&self) {
        let mut iter = 0;
        while self.write_barrier.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
            iter += 1;
            if iter % WARN_THRESHOLD == 0 {
                warn!("writer stalled for a long time behind the write barrier");
            }
        }
    }

    /// Blocks until the lock is held exclusively: no other writer inside,
    /// and every reader drained.
    pub fn lock(&self) {
        self.wait_on_write_barrier();
        self.mutex.lock();
        self.readers.wait_empty();
    }

    /// Releases exclusive ownership; readers and other writers may enter.
    pub fn unlock(&self) {
        self.mutex.unlock();
    }

    /// An advisory snapshot of the writer mutex.
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    /// Makes one attempt at exclusive acquisition. On success the read
    /// indicator is drained before returning true; on failure returns false
    /// immediately without draining.
    pub fn try_lock(&self) -> bool {
        self.wait_on_write_barrier();
        if self.mutex.try_lock() {
            self.readers.wait_empty();
            true
        } else {
            false
        }
    }

    /// Blocks until shared ownership is held.
    pub fn rlock(&self) {
        let mut raised = false;
        let mut patience = 0;
        loop {
            // Publish presence first, then check the mutex; the writer's
            // sequence is the mirror image (lock, then scan the indicator).
            // One of the two must observe the other.
            self.readers.arrive();
            if !self.mutex.is_locked() {
                break;
            }

            // A writer is inside. Retract the claim so its drain can finish,
            // and wait for the mutex to clear before retrying.
            self.readers.depart();
            while self.mutex.is_locked() {
                thread::yield_now();
                if patience == READ_PATIENCE_LIMIT && !raised {
                    self.write_barrier.fetch_add(1, Ordering::SeqCst);
                    raised = true;
                }
                patience += 1;
            }
        }

        if raised {
            self.write_barrier.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Releases shared ownership. Must pair 1:1 with an `rlock` by the same
    /// thread.
    pub fn runlock(&self) {
        self.readers.depart();
    }

    /// Hands a critical section to the lock holder for deferred execution.
    /// See [`delegate_boxed`](RawMrqdLock::delegate_boxed).
    pub fn delegate<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.delegate_boxed(Box::new(f));
    }

    /// Hands `msg` off for execution under the lock and returns as soon as
    /// it has been executed or accepted.
    ///
    /// If the mutex is free, the caller acquires it, drains readers, runs
    /// `msg` itself, then flushes any messages other delegators enqueued in
    /// the meantime. Otherwise the caller tries to enqueue `msg` with the
    /// current holder, and failing that (queue closed or full) yields and
    /// retries. There is no ordering between a delegated message and a
    /// direct writer, nor between messages from different threads.
    pub fn delegate_boxed(&self, msg: Deferred) {
        self.wait_on_write_barrier();
        let mut msg = msg;
        let mut iter = 0;
        loop {
            if self.mutex.try_lock() {
                self.queue.open();
                self.readers.wait_empty();
                msg();
                self.queue.flush(|m| m());
                self.mutex.unlock();
                return;
            }

            match self.queue.enqueue(msg) {
                Ok(()) => return,
                Err(rejected) => msg = rejected,
            }
            thread::yield_now();
            iter += 1;
            if iter % WARN_THRESHOLD == 0 {
                warn!("delegate() spinning for a long time, the holder's queue is not accepting");
            }
        }
    }
}

impl Default for RawMrqdLock {
    fn default() -> RawMrqdLock {
        RawMrqdLock::new()
    }
}

impl fmt::Debug for RawMrqdLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RawMrqdLock")
    }
}

impl Lock for RawMrqdLock {
    fn lock(&self) {
        RawMrqdLock::lock(self)
    }

    fn unlock(&self) {
        RawMrqdLock::unlock(self)
    }

    fn try_lock(&self) -> bool {
        RawMrqdLock::try_lock(self)
    }

    fn is_locked(&self) -> bool {
        RawMrqdLock::is_locked(self)
    }
}

impl SharedLock for RawMrqdLock {
    fn rlock(&self) {
        RawMrqdLock::rlock(self)
    }

    fn runlock(&self) {
        RawMrqdLock::runlock(self)
    }
}

impl DelegationLock for RawMrqdLock {
    fn delegate(&self, msg: Deferred) {
        self.delegate_boxed(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::AtomicBool;
    use std::sync::Arc;

    // Tests a full lock/unlock, rlock/runlock, lock/unlock cycle on one
    // thread; after each pair the lock reports free and all counters are
    // back to zero.
    #[test]
    fn test_single_threaded_sanity() {
        let l = RawMrqdLock::new();

        l.lock();
        assert!(l.is_locked());
        l.unlock();
        assert!(!l.is_locked());
        assert_eq!(l.readers.sum(), 0);
        assert_eq!(l.write_barrier.load(Ordering::SeqCst), 0);

        l.rlock();
        assert!(!l.is_locked());
        assert_eq!(l.readers.sum(), 1);
        l.runlock();
        assert_eq!(l.readers.sum(), 0);
        assert_eq!(l.write_barrier.load(Ordering::SeqCst), 0);

        l.lock();
        l.unlock();
        assert!(!l.is_locked());
        assert_eq!(l.readers.sum(), 0);
    }

    // Tests that try_lock() fails against a held mutex without draining and
    // succeeds once it is free.
    #[test]
    fn test_try_lock() {
        let l = RawMrqdLock::new();

        assert!(l.try_lock());
        assert!(l.is_locked());
        assert!(!l.try_lock());
        l.unlock();
        assert!(l.try_lock());
        l.unlock();
    }

    // Tests that an uncontended delegate() is observationally equivalent to
    // lock(); run; unlock(): executed before the call returns.
    #[test]
    fn test_delegate_uncontended() {
        let l = RawMrqdLock::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        l.delegate(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!l.is_locked());
    }

    // Tests that a delegated message enqueued with a holder runs before the
    // holder releases the lock.
    #[test]
    fn test_delegate_enqueues_with_holder() {
        let l = Arc::new(RawMrqdLock::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));

        let (lh, hh, rh) = (l.clone(), hits.clone(), release.clone());
        let holder = thread::spawn(move || {
            lh.delegate(move || {
                hh.fetch_add(1, Ordering::SeqCst);
                while !rh.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            });
        });

        while !l.is_locked() {
            thread::yield_now();
        }

        // The holder is parked inside its own message with the queue open;
        // this delegate can only return via a successful enqueue.
        let h = hits.clone();
        l.delegate(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        release.store(true, Ordering::SeqCst);

        holder.join().expect("Thread didn't finish successfully.");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!l.is_locked());
    }

    // Tests the write barrier handshake: a writer parks on the mutex until
    // it observes the barrier go up, which only a patient reader can do; the
    // reader then enters and lowers the barrier again.
    #[test]
    fn test_reader_raises_write_barrier() {
        let l = Arc::new(RawMrqdLock::new());

        let w = l.clone();
        let writer = thread::spawn(move || {
            w.lock();
            while w.write_barrier.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }
            w.unlock();
        });

        while !l.is_locked() {
            thread::yield_now();
        }

        l.rlock();
        assert_eq!(l.write_barrier.load(Ordering::SeqCst), 0);
        l.runlock();

        writer.join().expect("Thread didn't finish successfully.");
        assert_eq!(l.readers.sum(), 0);
    }

    // Tests that new writers stall while the barrier is up.
    #[test]
    fn test_barrier_stalls_writers() {
        let l = Arc::new(RawMrqdLock::new());
        l.write_barrier.fetch_add(1, Ordering::SeqCst);

        let entered = Arc::new(AtomicBool::new(false));
        let (lw, ew) = (l.clone(), entered.clone());
        let writer = thread::spawn(move || {
            lw.lock();
            ew.store(true, Ordering::SeqCst);
            lw.unlock();
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        l.write_barrier.fetch_sub(1, Ordering::SeqCst);
        writer.join().expect("Thread didn't finish successfully.");
        assert!(entered.load(Ordering::SeqCst));
    }
}
