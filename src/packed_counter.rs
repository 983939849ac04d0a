use crate::fifo::CacheAligned;
use crate::invariants::debug_assert_worker_bound;
use std::sync::atomic::{AtomicU32, Ordering};

/// Number of bits reserved for `request_count` in the packed word.
const REQUEST_COUNT_BITS: u32 = 20;
const REQUEST_COUNT_MASK: u32 = (1 << REQUEST_COUNT_BITS) - 1;
const ACTIVE_WORKERS_SHIFT: u32 = REQUEST_COUNT_BITS;

/// Largest value `active_workers` can hold (12 bits).
pub const ACTIVE_WORKERS_MAX: u32 = (1 << (32 - REQUEST_COUNT_BITS)) - 1;

/// A point-in-time read of the packed word, used to drive the CAS loops below.
///
/// Holding both `active_workers` and `request_count` together — rather than
/// as two independent atomics — is what lets the protocol observe and update
/// them jointly: a caller that CASes on `raw` either sees both fields as they
/// stood at the same instant, or the CAS fails and it re-reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    raw: u32,
    pub active_workers: u32,
    pub request_count: u32,
}

fn decode(raw: u32) -> Snapshot {
    Snapshot {
        raw,
        active_workers: raw >> ACTIVE_WORKERS_SHIFT,
        request_count: raw & REQUEST_COUNT_MASK,
    }
}

fn encode(active_workers: u32, request_count: u32) -> u32 {
    (active_workers << ACTIVE_WORKERS_SHIFT) | (request_count & REQUEST_COUNT_MASK)
}

/// A single 32-bit word jointly holding `active_workers` (bits 20..32) and
/// `request_count` (bits 0..20), updated only via compare-and-swap.
///
/// Splitting these into two independent atomics would let a producer observe
/// `active == target` on one word while a worker retires on the other,
/// leaving `request_count > 0` with no worker left to drain it. A single
/// word closes that race: every transition that must see both fields
/// together CASes the whole word at once.
///
/// Cache-line padded: this is the one word every producer and worker CASes
/// on the hot path, so it gets its own line for the same reason the FIFO's
/// indices do (see `CacheAligned` in `fifo.rs`).
pub struct PackedCounter {
    word: CacheAligned<AtomicU32>,
}

impl PackedCounter {
    pub const fn new() -> Self {
        Self {
            word: CacheAligned::new(AtomicU32::new(0)),
        }
    }

    /// Reads the current state. Not linearizable with any subsequent CAS —
    /// callers must retry on CAS failure rather than trust a stale snapshot.
    #[inline]
    pub fn snapshot(&self) -> Snapshot {
        decode(self.word.load(Ordering::Acquire))
    }

    /// Attempts to move `active_workers` from `snapshot.active_workers` to
    /// `+ 1`, only if it is still below `target`. Returns `false` if another
    /// thread updated the word first or the target is already met; callers
    /// should re-snapshot and retry if they still want to reserve a worker.
    pub fn try_reserve_worker(&self, snapshot: Snapshot, target: u32) -> bool {
        if snapshot.active_workers >= target {
            return false;
        }
        debug_assert_worker_bound!(snapshot.active_workers + 1, target);
        let new_raw = encode(snapshot.active_workers + 1, snapshot.request_count);
        self.word
            .compare_exchange(snapshot.raw, new_raw, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Attempts `request_count += 1`, but only if `active_workers == target`
    /// in `snapshot` — this is the guard that prevents a producer from
    /// queuing a request for a worker pool that is concurrently retiring its
    /// last worker.
    pub fn try_increment_requests(&self, snapshot: Snapshot, target: u32) -> bool {
        if snapshot.active_workers != target {
            return false;
        }
        let new_raw = encode(snapshot.active_workers, snapshot.request_count + 1);
        self.word
            .compare_exchange(snapshot.raw, new_raw, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Attempts `active_workers += 1` while leaving `request_count`
    /// untouched. Used when a producer discovers, after enqueueing, that the
    /// worker pool has dropped below target and it must become a worker
    /// itself rather than increment `request_count`.
    pub fn try_reserve_worker_and_keep_requests(&self, snapshot: Snapshot, target: u32) -> bool {
        if snapshot.active_workers >= target {
            return false;
        }
        let new_raw = encode(snapshot.active_workers + 1, snapshot.request_count);
        self.word
            .compare_exchange(snapshot.raw, new_raw, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Attempts `request_count -= n`. Fails if `n` exceeds the snapshot's
    /// `request_count` or the word has changed since the snapshot.
    pub fn try_decrement_requests(&self, snapshot: Snapshot, n: u32) -> bool {
        if n > snapshot.request_count {
            return false;
        }
        let new_raw = encode(snapshot.active_workers, snapshot.request_count - n);
        self.word
            .compare_exchange(snapshot.raw, new_raw, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Attempts `active_workers -= 1`, only if `request_count == 0` in
    /// `snapshot` — a worker may only retire once it has confirmed there is
    /// nothing left queued for it to pick up.
    pub fn try_retire_worker(&self, snapshot: Snapshot) -> bool {
        if snapshot.request_count != 0 || snapshot.active_workers == 0 {
            return false;
        }
        let new_raw = encode(snapshot.active_workers - 1, snapshot.request_count);
        self.word
            .compare_exchange(snapshot.raw, new_raw, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for PackedCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PackedCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("PackedCounter")
            .field("active_workers", &s.active_workers)
            .field("request_count", &s.request_count)
            .finish()
    }
}
