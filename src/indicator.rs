// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The distributed read indicator.
//!
//! Readers signal their presence on one of a small number of padded group
//! counters, so a crowd of readers is spread over several cache lines
//! instead of hammering one. A writer observes the absence of readers by
//! scanning every group down to zero.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use arr_macro::arr;
use crossbeam_utils::CachePadded;
use log::warn;
use static_assertions::const_assert;

use crate::WARN_THRESHOLD;

/// The number of reader groups. More groups spread readers over more cache
/// lines at the price of a longer writer drain; any value ≥ 1 is correct.
///
/// # Important
/// If this number is adjusted due to the use of the `arr_macro::arr` macro we
/// have to adjust the `4` literal in the `new` constructor.
pub(crate) const READER_GROUPS: usize = 4;
const_assert!(READER_GROUPS >= 1);

/// Hands out sticky group indices, round robin. Distribution does not matter
/// for correctness, only that each thread keeps the group it was given.
static NEXT_GROUP: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static READER_GROUP: usize = NEXT_GROUP.fetch_add(1, Ordering::Relaxed) % READER_GROUPS;
}

#[inline(always)]
fn group() -> usize {
    READER_GROUP.with(|g| *g)
}

/// Striped reader-presence counters.
pub(crate) struct ReaderGroups {
    /// Per-group presence counts. The sum over all groups is the number of
    /// readers currently inside a read critical section.
    groups: [CachePadded<AtomicUsize>; READER_GROUPS],
}

impl ReaderGroups {
    pub(crate) fn new() -> ReaderGroups {
        ReaderGroups {
            groups: arr![CachePadded::new(AtomicUsize::new(0)); 4],
        }
    }

    /// Publishes the calling thread's presence. `SeqCst` so that the caller's
    /// subsequent check of the writer mutex cannot be hoisted above the
    /// increment.
    pub(crate) fn arrive(&self) {
        self.groups[group()].fetch_add(1, Ordering::SeqCst);
    }

    /// Retracts a presence previously published by `arrive()` on the same
    /// thread.
    pub(crate) fn depart(&self) {
        let prev = self.groups[group()].fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "depart() without a matching arrive()");
    }

    /// Spins until every group has been observed empty once, in index order.
    /// The scan does not revisit earlier groups: a reader re-entering one
    /// will see the writer mutex held and back off.
    pub(crate) fn wait_empty(&self) {
        for (i, grp) in self.groups.iter().enumerate() {
            let mut iter = 0;
            while grp.load(Ordering::SeqCst) > 0 {
                thread::yield_now();
                iter += 1;
                if iter % WARN_THRESHOLD == 0 {
                    warn!("wait_empty() stuck draining reader group {}", i);
                }
            }
        }
    }

    /// The number of readers currently present. Only meaningful at quiescent
    /// points; used by tests.
    pub(crate) fn sum(&self) -> usize {
        self.groups.iter().map(|g| g.load(Ordering::SeqCst)).sum()
    }
}
