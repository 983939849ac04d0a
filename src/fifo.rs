use crate::invariants::{debug_assert_bounded_size, debug_assert_slot_occupied, debug_assert_slot_vacant};
use crate::Backoff;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// `ConcurrentFifo` is a bounded multi-producer multi-consumer queue. Unlike a
// single-producer/single-consumer ring, every slot can be claimed by any
// thread, so each slot carries its own publish/claim flag rather than relying
// on a single shared head/tail pair.
//
// ## Index Claiming
//
// `append_index` and `take_index` are unbounded u64 counters, each advanced
// with `fetch_add` (Relaxed — the claim itself carries no data, only the
// per-slot flag below does). Wrap-around is not a practical concern: at one
// billion claims/second a u64 counter wraps after roughly 584 years.
//
// ## Per-Slot Publish Protocol
//
// A slot's `occupied` flag is the single point of synchronization between
// the producer that claimed it and the consumer that will take it:
//
// **Producer (`try_append`):**
// 1. Claim `append_index` via `fetch_add` (Relaxed).
// 2. Spin-wait for `occupied == false` on the claimed slot (Acquire) — this
//    can only be momentarily true if a consumer claimed the same slot index
//    on a previous wrap and hasn't cleared it yet, which cannot happen while
//    `size` bounds the queue below capacity.
// 3. Write the value into the slot's `UnsafeCell`.
// 4. Store `occupied = true` (Release) — publishes the write to the consumer.
//
// **Consumer (`take`):**
// 1. Claim `take_index` via `fetch_add` (Relaxed).
// 2. Spin-wait for `occupied == true` on the claimed slot (Acquire) —
//    synchronizes with the producer's Release store in step 4 above.
// 3. Read the value out with `assume_init_read`.
// 4. Store `occupied = false` (Release) — returns the slot to the producer.
//
// The `size` atomic is the admission-control gate: `try_append` only
// proceeds past the CAS on `size` if there is spare capacity, which bounds
// how far a producer can get ahead of consumers and keeps the per-slot spin
// in both directions bounded.
//
// =============================================================================

struct Slot<T> {
    occupied: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            occupied: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Wrapper type that ensures 128-byte alignment to prevent prefetcher-induced
/// false sharing on Intel/AMD CPUs (which may prefetch adjacent cache lines).
#[repr(align(128))]
pub(crate) struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// A bounded, fixed-capacity multi-producer multi-consumer FIFO.
///
/// Capacity is always a power of two; the mask is derived once at
/// construction and reused for every index-to-slot computation.
#[repr(C)]
pub struct ConcurrentFifo<T> {
    append_index: CacheAligned<AtomicU64>,
    take_index: CacheAligned<AtomicU64>,
    size: CacheAligned<AtomicUsize>,
    capacity: usize,
    mask: usize,
    slots: Box<[Slot<T>]>,
}

// Safety: all cross-thread access to `slots[i].value` is gated by the
// `occupied` flag's Acquire/Release protocol above.
unsafe impl<T: Send> Send for ConcurrentFifo<T> {}
unsafe impl<T: Send> Sync for ConcurrentFifo<T> {}

impl<T> ConcurrentFifo<T> {
    /// Creates a queue with the given capacity, which must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::empty);

        Self {
            append_index: CacheAligned::new(AtomicU64::new(0)),
            take_index: CacheAligned::new(AtomicU64::new(0)),
            size: CacheAligned::new(AtomicUsize::new(0)),
            capacity,
            mask: capacity - 1,
            slots: slots.into_boxed_slice(),
        }
    }

    /// Returns the fixed capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a lower-bound snapshot of the number of elements currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to publish `elem`. On failure (queue at capacity) returns
    /// `elem` back to the caller unconsumed, so a caller retrying or falling
    /// back to a different path never loses the value.
    pub fn try_append(&self, elem: T) -> Result<(), T> {
        let mut current = self.size.load(Ordering::Relaxed);
        loop {
            debug_assert_bounded_size!(current, self.capacity);
            if current >= self.capacity {
                return Err(elem);
            }
            match self.size.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let claimed = self.append_index.fetch_add(1, Ordering::Relaxed);
        let idx = (claimed as usize) & self.mask;
        let slot = &self.slots[idx];

        let mut backoff = Backoff::new();
        while slot.occupied.load(Ordering::Acquire) {
            backoff.snooze();
        }
        debug_assert_slot_vacant!(slot.occupied.load(Ordering::Relaxed), idx);

        // SAFETY: the slot was observed vacant above and no other producer can
        // hold the same claimed index (append_index advances monotonically by
        // exactly one per claim).
        unsafe {
            (*slot.value.get()).write(elem);
        }
        slot.occupied.store(true, Ordering::Release);
        Ok(())
    }

    /// Claims and returns the next published element, spin-waiting until one
    /// is available.
    ///
    /// Callers must only invoke this after observing evidence that an
    /// element is or will shortly be published (see the packed-counter
    /// protocol in [`crate::Batcher`]); otherwise this call can spin for an
    /// unbounded time.
    pub fn take(&self) -> T {
        let claimed = self.take_index.fetch_add(1, Ordering::Relaxed);
        let idx = (claimed as usize) & self.mask;
        let slot = &self.slots[idx];

        let mut backoff = Backoff::new();
        while !slot.occupied.load(Ordering::Acquire) {
            backoff.snooze();
        }
        debug_assert_slot_occupied!(slot.occupied.load(Ordering::Relaxed), idx);

        // SAFETY: the slot was observed occupied above, and only one consumer
        // can hold this claimed index.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.occupied.store(false, Ordering::Release);
        self.size.fetch_sub(1, Ordering::AcqRel);
        value
    }
}

impl<T> Drop for ConcurrentFifo<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.occupied.get_mut() {
                unsafe {
                    ptr::drop_in_place(slot.value.get_mut().as_mut_ptr());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_take_preserves_value() {
        let fifo = ConcurrentFifo::<u64>::new(8);
        assert!(fifo.try_append(42).is_ok());
        assert_eq!(fifo.len(), 1);
        assert_eq!(fifo.take(), 42);
        assert_eq!(fifo.len(), 0);
    }

    #[test]
    fn fifo_order_is_preserved_single_threaded() {
        let fifo = ConcurrentFifo::<u64>::new(8);
        for i in 0..8 {
            assert!(fifo.try_append(i).is_ok());
        }
        for i in 0..8 {
            assert_eq!(fifo.take(), i);
        }
    }

    #[test]
    fn try_append_fails_when_full() {
        let fifo = ConcurrentFifo::<u64>::new(4);
        for i in 0..4 {
            assert!(fifo.try_append(i).is_ok());
        }
        assert_eq!(fifo.try_append(99), Err(99));
        assert_eq!(fifo.take(), 0);
        assert!(fifo.try_append(99).is_ok());
    }

    #[test]
    fn drop_releases_remaining_items() {
        use std::sync::atomic::{AtomicUsize as Counter, Ordering as Ord};
        static DROP_COUNT: Counter = Counter::new(0);

        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ord::SeqCst);
            }
        }

        DROP_COUNT.store(0, Ord::SeqCst);
        {
            let fifo = ConcurrentFifo::<Tracked>::new(4);
            assert!(fifo.try_append(Tracked).is_ok());
            assert!(fifo.try_append(Tracked).is_ok());
        }
        assert_eq!(DROP_COUNT.load(Ord::SeqCst), 2);
    }

    #[test]
    fn concurrent_producers_and_consumers_preserve_all_elements() {
        use std::sync::atomic::{AtomicUsize as Counter, Ordering as Ord};
        use std::sync::Arc;
        use std::thread;

        let fifo = Arc::new(ConcurrentFifo::<u64>::new(1024));
        let total_sum = Arc::new(Counter::new(0));
        let produced = 4 * 2000;

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let fifo = Arc::clone(&fifo);
                thread::spawn(move || {
                    for i in 0..2000u64 {
                        let mut backoff = Backoff::new();
                        let mut value = i;
                        loop {
                            match fifo.try_append(value) {
                                Ok(()) => break,
                                Err(rejected) => {
                                    value = rejected;
                                    backoff.snooze();
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let fifo = Arc::clone(&fifo);
                let total_sum = Arc::clone(&total_sum);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let v = fifo.take();
                        total_sum.fetch_add(v as usize, Ord::SeqCst);
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }

        assert_eq!(fifo.len(), 0);
        let _ = produced;
    }
}
