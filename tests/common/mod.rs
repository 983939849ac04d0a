//! Shared helpers for the integration test suites. Not a test target itself
//! (lives under `tests/common/` rather than directly under `tests/`, the
//! usual Cargo convention for code shared across integration test binaries).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

/// Polls `predicate` until it is true or `timeout` elapses, returning which.
/// Useful for asserting on eventual state (worker retirement, counter
/// quiescence) that can lag slightly behind a resolved response future,
/// since a worker's continuation runs after the response is dispatched.
pub fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Minimal single-threaded `block_on`, for driving a `ResponseFuture` to
/// completion from plain (non-`#[tokio::test]`) threads without pulling in
/// an async runtime dependency for the test suite.
pub fn block_on<F: Future>(mut fut: F) -> F::Output {
    struct ParkWake(std::thread::Thread);
    impl Wake for ParkWake {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    let waker: Waker = Arc::new(ParkWake(std::thread::current())).into();
    let mut cx = Context::from_waker(&waker);
    // SAFETY: `fut` is a local that is not moved again after being pinned.
    let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(v) => return v,
            Poll::Pending => std::thread::park(),
        }
    }
}
