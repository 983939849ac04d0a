use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{BuildError, RequestError};
use crate::executor::Executor;
use crate::fifo::ConcurrentFifo;
use crate::multiplexer::{Multiplexer, MultiplexerBoxed};
use crate::packed_counter::{PackedCounter, ACTIVE_WORKERS_MAX};
use crate::pending_response::{PendingResponse, ResponseFuture};

/// Maximum number of queued items pulled into a single batch beyond the
/// seed request that started it (so a batch has at most `BATCH_SIZE + 1`
/// requests in it).
pub const BATCH_SIZE: u32 = 4095;

/// How long a producer sleeps between retries while the queue is full.
pub const QUEUE_FULL_SLEEP_MS: u64 = 100;

/// Fixed capacity of the internal queue.
pub const QUEUE_CAPACITY: usize = 1 << 20;

type Item<M> = PendingResponse<
    <M as Multiplexer>::Request,
    <M as Multiplexer>::Response,
    RequestError<<M as Multiplexer>::Error>,
>;

/// Atomic, `Relaxed`-ordering counters for observability. Relaxed is
/// appropriate here for the same reason it is throughout this codebase's
/// metrics structs: these are purely statistical, nothing downstream
/// depends on a happens-before relationship with them, and keeping them out
/// of the hot-path CAS loops above matters more than precise ordering.
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    pub requests_submitted: AtomicU64,
    pub requests_resolved: AtomicU64,
    pub requests_failed: AtomicU64,
    pub batches_executed: AtomicU64,
    pub queue_full_events: AtomicU64,
}

impl BatcherMetrics {
    pub fn snapshot(&self) -> BatcherMetricsSnapshot {
        BatcherMetricsSnapshot {
            requests_submitted: self.requests_submitted.load(Ordering::Relaxed),
            requests_resolved: self.requests_resolved.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            queue_full_events: self.queue_full_events.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`BatcherMetrics`], safe to hold across awaits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherMetricsSnapshot {
    pub requests_submitted: u64,
    pub requests_resolved: u64,
    pub requests_failed: u64,
    pub batches_executed: u64,
    pub queue_full_events: u64,
}

struct Inner<M: Multiplexer> {
    executor: Arc<dyn Executor>,
    multiplexer: Arc<M>,
    target_worker_count: u32,
    counter: PackedCounter,
    queue: ConcurrentFifo<Item<M>>,
    metrics: BatcherMetrics,
    closed: AtomicBool,
}

/// Coalesces unary `submit()` calls into batches for a caller-supplied
/// [`Multiplexer`], scheduling batch execution on a caller-supplied
/// [`Executor`].
///
/// Cheaply `Clone`able: every clone shares the same queue, counter, and
/// metrics via an inner `Arc`.
pub struct Batcher<M: Multiplexer> {
    inner: Arc<Inner<M>>,
}

impl<M: Multiplexer> Clone for Batcher<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Multiplexer + 'static> Batcher<M> {
    /// Creates a batcher. `target_worker_count` must be in `1..=4095`.
    pub fn create(
        executor: Arc<dyn Executor>,
        multiplexer: Arc<M>,
        target_worker_count: u32,
    ) -> Result<Self, BuildError> {
        Self::new_inner(executor, multiplexer, target_worker_count, QUEUE_CAPACITY)
    }

    /// Like [`Self::create`], but with an overridable queue capacity.
    ///
    /// The public constructor always uses [`QUEUE_CAPACITY`] — the design
    /// fixes that constant, it is not a tunable. This entry point exists so
    /// tests can exercise the queue-full backoff and cancellation path
    /// without appending a million items first.
    #[cfg(any(test, feature = "test-util"))]
    pub fn create_with_capacity(
        executor: Arc<dyn Executor>,
        multiplexer: Arc<M>,
        target_worker_count: u32,
        capacity: usize,
    ) -> Result<Self, BuildError> {
        Self::new_inner(executor, multiplexer, target_worker_count, capacity)
    }

    fn new_inner(
        executor: Arc<dyn Executor>,
        multiplexer: Arc<M>,
        target_worker_count: u32,
        capacity: usize,
    ) -> Result<Self, BuildError> {
        if target_worker_count == 0 || target_worker_count > ACTIVE_WORKERS_MAX {
            return Err(BuildError::InvalidTargetWorkerCount {
                got: target_worker_count,
                max: ACTIVE_WORKERS_MAX,
            });
        }

        Ok(Self {
            inner: Arc::new(Inner {
                executor,
                multiplexer,
                target_worker_count,
                counter: PackedCounter::new(),
                queue: ConcurrentFifo::new(capacity),
                metrics: BatcherMetrics::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Marks the batcher closed: any producer currently backing off on a
    /// full queue resolves its pending request with
    /// [`RequestError::Cancelled`] on its next backoff check instead of
    /// retrying, and new calls to [`Self::submit`] that hit a full queue do
    /// the same immediately rather than entering the sleep loop.
    ///
    /// This is narrower than a graceful shutdown: workers already running
    /// keep draining whatever is queued, and `close` does not wait for them
    /// — teardown of the batcher itself still only releases memory, per the
    /// design's Non-goal on graceful drain. It only cuts short producers
    /// stuck in the queue-full backoff path.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
    }

    /// Submits a request, returning a future that resolves once it has been
    /// executed as part of some batch.
    ///
    /// Implements the three-phase protocol: (1) try to become a worker
    /// directly and seed a batch with just this request; (2) otherwise
    /// enqueue, backing off while the queue is full; (3) ensure a worker
    /// will eventually pick the request up, either by incrementing
    /// `request_count` for an existing worker pool or by becoming a worker
    /// itself if the pool had dipped below target in the meantime.
    pub fn submit(&self, request: M::Request) -> ResponseFuture<M::Response, RequestError<M::Error>> {
        let (pending, future) = PendingResponse::new(request);
        let inner = &self.inner;
        let target = inner.target_worker_count;
        inner.metrics.requests_submitted.fetch_add(1, Ordering::Relaxed);

        // Phase 1: become a worker directly.
        loop {
            let snapshot = inner.counter.snapshot();
            if snapshot.active_workers >= target {
                break;
            }
            if inner.counter.try_reserve_worker(snapshot, target) {
                Self::spawn_batch(Arc::clone(inner), pending);
                return future;
            }
        }

        // Phase 2: enqueue, backing off while full.
        let mut pending = pending;
        loop {
            match inner.queue.try_append(pending) {
                Ok(()) => break,
                Err(rejected) => {
                    if inner.closed.load(Ordering::Relaxed) {
                        rejected.set_error(RequestError::Cancelled);
                        inner.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
                        return future;
                    }
                    pending = rejected;
                    inner.metrics.queue_full_events.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(QUEUE_FULL_SLEEP_MS));
                }
            }
        }

        // Phase 3: ensure a worker will reach the queued request.
        loop {
            let snapshot = inner.counter.snapshot();
            if snapshot.active_workers >= target {
                if inner.counter.try_increment_requests(snapshot, target) {
                    return future;
                }
            } else if inner.counter.try_reserve_worker_and_keep_requests(snapshot, target) {
                let seed = inner.queue.take();
                Self::spawn_batch(Arc::clone(inner), seed);
                return future;
            }
        }
    }

    /// Returns a snapshot of the ambient metrics.
    pub fn metrics(&self) -> BatcherMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    fn spawn_batch(inner: Arc<Inner<M>>, seed: Item<M>) {
        let executor = Arc::clone(&inner.executor);
        executor.spawn(Box::pin(async move { Self::execute_batch(inner, seed).await }));
    }

    async fn execute_batch(inner: Arc<Inner<M>>, seed: Item<M>) {
        let batch = Self::populate_batch(&inner, seed);
        let batch_len = batch.len();
        let mut requests = Vec::with_capacity(batch_len);
        let mut resolvers = Vec::with_capacity(batch_len);
        for item in batch {
            let (request, resolver) = item.into_parts();
            requests.push(request);
            resolvers.push(resolver);
        }

        let result = inner.multiplexer.execute_boxed(requests).await;
        inner.metrics.batches_executed.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(responses) if responses.len() == batch_len => {
                for (resolver, response) in resolvers.into_iter().zip(responses) {
                    resolver.set_response(response);
                    inner.metrics.requests_resolved.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(responses) => {
                let got = responses.len();
                for resolver in resolvers {
                    resolver.set_error(RequestError::ContractViolation {
                        expected: batch_len,
                        got,
                    });
                    inner.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(error) => {
                for resolver in resolvers {
                    resolver.set_error(RequestError::Multiplexer(error.clone()));
                    inner.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        Self::continue_or_retire(inner);
    }

    /// Pulls the remainder of the batch from the queue: starting from the
    /// single-element `seed`, reserve up to `BATCH_SIZE` queued requests via
    /// a CAS on `request_count`, then drain exactly that many from the FIFO.
    fn populate_batch(inner: &Arc<Inner<M>>, seed: Item<M>) -> Vec<Item<M>> {
        let mut batch = Vec::with_capacity(1 + BATCH_SIZE as usize);
        batch.push(seed);

        loop {
            let snapshot = inner.counter.snapshot();
            if snapshot.request_count == 0 {
                break;
            }
            let to_take = snapshot.request_count.min(BATCH_SIZE);
            if inner.counter.try_decrement_requests(snapshot, to_take) {
                for _ in 0..to_take {
                    batch.push(inner.queue.take());
                }
                break;
            }
        }

        batch
    }

    /// After a batch completes: either seed another batch from whatever is
    /// still queued, or retire this worker slot if nothing is left.
    fn continue_or_retire(inner: Arc<Inner<M>>) {
        loop {
            let snapshot = inner.counter.snapshot();
            if snapshot.request_count == 0 {
                if inner.counter.try_retire_worker(snapshot) {
                    return;
                }
                continue;
            }
            let to_take = 1u32.min(snapshot.request_count);
            if inner.counter.try_decrement_requests(snapshot, to_take) {
                let seed = inner.queue.take();
                Self::spawn_batch(inner, seed);
                return;
            }
        }
    }
}

impl<M: Multiplexer> std::fmt::Debug for Batcher<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.inner.counter.snapshot();
        write!(
            f,
            "activeWorkers={}, requestCount={}\nqueue.len={}",
            snapshot.active_workers,
            snapshot.request_count,
            self.inner.queue.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::testing::{GatedMultiplexer, IdentityMultiplexer};
    use std::time::Instant;

    #[test]
    fn create_rejects_zero_target() {
        let result = Batcher::create(Arc::new(InlineExecutor), Arc::new(IdentityMultiplexer), 0);
        assert!(matches!(
            result,
            Err(BuildError::InvalidTargetWorkerCount { got: 0, .. })
        ));
    }

    #[test]
    fn create_rejects_target_above_max() {
        let result = Batcher::create(
            Arc::new(InlineExecutor),
            Arc::new(IdentityMultiplexer),
            ACTIVE_WORKERS_MAX + 1,
        );
        assert!(matches!(
            result,
            Err(BuildError::InvalidTargetWorkerCount { .. })
        ));
    }

    #[test]
    fn close_cancels_producers_stuck_in_queue_full_backoff() {
        // A worker is permanently gated so it never drains the queue, and the
        // queue capacity is shrunk to 1 so the second submit hits the full
        // path immediately instead of after filling a million slots.
        let multiplexer = Arc::new(GatedMultiplexer::new());
        let batcher = Batcher::create_with_capacity(
            Arc::new(crate::testing::ThreadExecutor),
            Arc::clone(&multiplexer),
            1,
            1,
        )
        .unwrap();

        // Seeds the only worker; it blocks inside the gate and never touches
        // the queue.
        let _seed_future = batcher.submit(1);

        // Give the worker a moment to actually start and block on the gate,
        // so the next submit is guaranteed to go through Phase 2.
        thread::sleep(Duration::from_millis(20));

        // Fills the one-slot queue.
        let _queued_future = batcher.submit(2);
        thread::sleep(Duration::from_millis(20));

        batcher.close();

        let deadline = Instant::now() + Duration::from_secs(5);
        let cancelled = loop {
            let fut = batcher.submit(3);
            let result = futures_block_on(fut);
            match result {
                Err(RequestError::Cancelled) => break true,
                _ if Instant::now() < deadline => continue,
                _ => break false,
            }
        };
        assert!(cancelled, "expected a submit on a closed, full queue to resolve with Cancelled");

        multiplexer.release();
    }

    /// Minimal single-threaded `block_on`, used only so this unit test can
    /// observe a `ResponseFuture`'s result synchronously.
    fn futures_block_on<F: std::future::Future>(mut fut: F) -> F::Output {
        use std::pin::Pin;
        use std::task::{Context, Poll, Wake, Waker};

        struct ParkWake(thread::Thread);
        impl Wake for ParkWake {
            fn wake(self: Arc<Self>) {
                self.0.unpark();
            }
        }

        let waker: Waker = Arc::new(ParkWake(thread::current())).into();
        let mut cx = Context::from_waker(&waker);
        // SAFETY: `fut` is not moved again after being pinned on the stack.
        let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(v) => return v,
                Poll::Pending => thread::park(),
            }
        }
    }
}
