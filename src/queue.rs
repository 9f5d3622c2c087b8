// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The delegation queue.
//!
//! A bounded buffer of deferred messages with one consumer, the current
//! mutex holder. The holder `open()`s a session, other threads `enqueue()`
//! messages against it, and the holder `flush()`es every accepted message
//! before it releases the mutex. A message accepted by a session is executed
//! exactly once, within that session.

use core::cell::UnsafeCell;
use core::cmp;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use arr_macro::arr;
use crossbeam_utils::CachePadded;
use static_assertions::const_assert;

/// The number of messages a delegation session can buffer. Delegators that
/// find the buffer exhausted fall back to spinning on the mutex.
///
/// # Important
/// If this number is adjusted due to the use of the `arr_macro::arr` macro we
/// have to adjust the `64` literal in the `new` constructor.
pub(crate) const MAX_PENDING_MSGS: usize = 64;
const_assert!(MAX_PENDING_MSGS >= 1 && (MAX_PENDING_MSGS & (MAX_PENDING_MSGS - 1) == 0));

/// Tail values at or above this sentinel mean no session is open. Far enough
/// below `usize::MAX` that claims bumped past it cannot overflow the tail.
const CLOSED: usize = usize::MAX / 2;

struct Slot<M> {
    /// Stored with `Release` by the producer once the message is in place;
    /// the flusher must not read the slot before observing it.
    ready: AtomicBool,
    msg: UnsafeCell<Option<M>>,
}

impl<M> Slot<M> {
    fn new() -> Slot<M> {
        Slot {
            ready: AtomicBool::new(false),
            msg: UnsafeCell::new(None),
        }
    }
}

/// A bounded single-consumer queue of deferred messages.
pub(crate) struct DelegationQueue<M> {
    /// The next slot index to claim; `CLOSED` when no session is open.
    tail: CachePadded<AtomicUsize>,
    slots: [CachePadded<Slot<M>>; MAX_PENDING_MSGS],
}

/// Each slot is written only by the producer that claimed it and read only
/// by the mutex holder after the `ready` handshake.
unsafe impl<M: Send> Sync for DelegationQueue<M> {}

impl<M> DelegationQueue<M> {
    pub(crate) fn new() -> DelegationQueue<M> {
        DelegationQueue {
            tail: CachePadded::new(AtomicUsize::new(CLOSED)),
            slots: arr![CachePadded::new(Slot::new()); 64],
        }
    }

    /// Starts accepting messages. Only the mutex holder may call this, and
    /// only while no session is open.
    pub(crate) fn open(&self) {
        self.tail.store(0, Ordering::SeqCst);
    }

    /// Attempts to hand `msg` to the current session. On rejection (no open
    /// session, or the session's buffer is exhausted) the message is handed
    /// back to the caller.
    ///
    /// A successful enqueue is final: the session's flush executes the
    /// message before the holder releases the mutex.
    pub(crate) fn enqueue(&self, msg: M) -> Result<(), M> {
        if self.tail.load(Ordering::SeqCst) >= MAX_PENDING_MSGS {
            return Err(msg);
        }

        let slot = self.tail.fetch_add(1, Ordering::SeqCst);
        if slot >= MAX_PENDING_MSGS {
            return Err(msg);
        }

        unsafe { *self.slots[slot].msg.get() = Some(msg) };
        self.slots[slot].ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Executes every accepted message in slot order and closes the session.
    /// Only the mutex holder may call this.
    ///
    /// A producer that has claimed a slot may still be writing it, so each
    /// slot is awaited on its `ready` flag. The session closes by moving the
    /// tail to `CLOSED`, which only succeeds once no claim raced with the
    /// scan; a failed close means new messages arrived and the scan repeats.
    pub(crate) fn flush<F: FnMut(M)>(&self, mut run: F) {
        let mut executed = 0;
        loop {
            let claimed = cmp::min(self.tail.load(Ordering::SeqCst), MAX_PENDING_MSGS);

            while executed < claimed {
                let slot = &self.slots[executed];
                while !slot.ready.load(Ordering::Acquire) {
                    thread::yield_now();
                }
                slot.ready.store(false, Ordering::Relaxed);

                // A ready slot always holds a message (see enqueue()), so
                // calling unwrap() here is safe.
                let msg = unsafe { &mut *slot.msg.get() }.take().unwrap();
                run(msg);
                executed += 1;
            }

            if claimed == MAX_PENDING_MSGS {
                // The session filled up: no claim below the capacity can
                // still succeed, so closing is a plain store.
                self.tail.store(CLOSED, Ordering::SeqCst);
                return;
            }

            if self
                .tail
                .compare_exchange(claimed, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    // Tests that a queue without an open session rejects messages.
    #[test]
    fn test_enqueue_closed() {
        let q = DelegationQueue::<usize>::new();
        assert_eq!(q.enqueue(11), Err(11));
    }

    // Tests that flush() executes each accepted message exactly once, in
    // slot order.
    #[test]
    fn test_open_enqueue_flush() {
        let q = DelegationQueue::<usize>::new();
        q.open();

        for idx in 0..MAX_PENDING_MSGS / 2 {
            assert_eq!(q.enqueue(idx * idx), Ok(()));
        }

        let mut seen = Vec::new();
        q.flush(|m| seen.push(m));

        assert_eq!(seen.len(), MAX_PENDING_MSGS / 2);
        for idx in 0..MAX_PENDING_MSGS / 2 {
            assert_eq!(seen[idx], idx * idx);
        }
    }

    // Tests that the session rejects messages once the buffer is exhausted,
    // handing them back to the caller.
    #[test]
    fn test_enqueue_full() {
        let q = DelegationQueue::<usize>::new();
        q.open();

        for idx in 0..MAX_PENDING_MSGS {
            assert_eq!(q.enqueue(idx), Ok(()));
        }
        assert_eq!(q.enqueue(99), Err(99));

        let mut n = 0;
        q.flush(|_m| n += 1);
        assert_eq!(n, MAX_PENDING_MSGS);
    }

    // Tests that a flushed session is closed again.
    #[test]
    fn test_enqueue_after_flush() {
        let q = DelegationQueue::<usize>::new();
        q.open();
        assert_eq!(q.enqueue(1), Ok(()));
        q.flush(|_m| {});
        assert_eq!(q.enqueue(2), Err(2));
    }

    // Tests that a reopened queue accepts a fresh session.
    #[test]
    fn test_reopen() {
        let q = DelegationQueue::<usize>::new();

        q.open();
        assert_eq!(q.enqueue(1), Ok(()));
        let mut seen = Vec::new();
        q.flush(|m| seen.push(m));

        q.open();
        assert_eq!(q.enqueue(2), Ok(()));
        q.flush(|m| seen.push(m));

        assert_eq!(seen, vec![1, 2]);
    }

    // Tests concurrent producers against a single flushing consumer.
    #[test]
    fn test_concurrent_enqueue() {
        let q = Arc::new(DelegationQueue::<usize>::new());
        q.open();

        let t = 8;
        let mut threads = Vec::new();
        for i in 0..t {
            let q = q.clone();
            threads.push(thread::spawn(move || {
                assert_eq!(q.enqueue(i), Ok(()));
            }));
        }
        for thread in threads {
            thread.join().expect("Thread didn't finish successfully.");
        }

        let mut seen = Vec::new();
        q.flush(|m| seen.push(m));
        seen.sort_unstable();
        assert_eq!(seen, (0..t).collect::<Vec<usize>>());
    }
}
