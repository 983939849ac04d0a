use std::future::Future;
use std::pin::Pin;

/// Where a [`crate::Batcher`] schedules batch-continuation work: the future
/// that drives the multiplexer call and fans responses back out.
///
/// Already object-safe (it takes an already-boxed future), so a `Batcher`
/// can hold `Arc<dyn Executor>` directly without threading an executor type
/// parameter through every call site — mirroring how this codebase bridges
/// its lock-free core into async Rust at the edges rather than baking a
/// runtime into the core itself.
pub trait Executor: Send + Sync {
    /// Schedules `future` to run to completion. Must not block the calling
    /// thread; implementations that run inline (e.g. for tests) are only
    /// correct when nothing upstream is waiting on forward progress from a
    /// different worker.
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Runs the future to completion on the current OS thread before returning.
///
/// Useful when the multiplexer and downstream IO are themselves
/// synchronous; for anything that actually awaits, prefer
/// [`crate::testing::ThreadExecutor`] or the `tokio-executor` feature's
/// `TokioExecutor`.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        block_on_current_thread(future);
    }
}

/// Minimal single-threaded executor for driving a boxed future to
/// completion without pulling in an async runtime dependency. Good enough
/// for a multiplexer whose future never actually yields (it resolves
/// immediately or only touches non-async I/O), which is all `InlineExecutor`
/// promises to support.
fn block_on_current_thread(mut future: Pin<Box<dyn Future<Output = ()> + Send>>) {
    use std::sync::Arc;
    use std::task::{Context, Poll, Wake, Waker};

    struct NoopWake;
    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    let waker: Waker = Arc::new(NoopWake).into();
    let mut cx = Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => return,
            Poll::Pending => std::thread::yield_now(),
        }
    }
}

#[cfg(feature = "tokio-executor")]
mod tokio_executor {
    use super::Executor;
    use std::future::Future;
    use std::pin::Pin;

    /// An [`Executor`] that schedules continuations onto a `tokio` runtime
    /// via `tokio::spawn`, matching how `span_collector`'s async bridge
    /// layer hands export futures to tokio while keeping its own core
    /// synchronous.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TokioExecutor;

    impl Executor for TokioExecutor {
        fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
            tokio::spawn(future);
        }
    }
}

#[cfg(feature = "tokio-executor")]
pub use tokio_executor::TokioExecutor;
