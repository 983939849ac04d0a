//! Test doubles for `Multiplexer` and `Executor`, exposed outside `cfg(test)`
//! behind the `test-util` feature so integration tests under `tests/` can use
//! them, mirroring `TestExporter`/`SlowExporter` in this codebase's span
//! collector crate.

use crate::executor::Executor;
use crate::multiplexer::Multiplexer;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// An error type with no variants, for multiplexers that never fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Never(());

impl fmt::Display for Never {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unreachable")
    }
}

impl std::error::Error for Never {}

/// Returns every request unchanged as its own response.
pub struct IdentityMultiplexer;

impl Multiplexer for IdentityMultiplexer {
    type Request = u64;
    type Response = u64;
    type Error = Never;

    async fn execute(&self, requests: Vec<u64>) -> Result<Vec<u64>, Never> {
        Ok(requests)
    }
}

/// A multiplexer whose error variant carries a fixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure(pub String);

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Failure {}

/// Always fails every batch it receives with the configured message.
pub struct FailingMultiplexer {
    message: String,
}

impl FailingMultiplexer {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Multiplexer for FailingMultiplexer {
    type Request = u64;
    type Response = u64;
    type Error = Failure;

    async fn execute(&self, _requests: Vec<u64>) -> Result<Vec<u64>, Failure> {
        Err(Failure(self.message.clone()))
    }
}

/// Always returns one fewer response than requests, to exercise the
/// contract-violation path deliberately.
pub struct MismatchMultiplexer;

impl Multiplexer for MismatchMultiplexer {
    type Request = u64;
    type Response = u64;
    type Error = Never;

    async fn execute(&self, requests: Vec<u64>) -> Result<Vec<u64>, Never> {
        Ok(requests.into_iter().skip(1).collect())
    }
}

/// An identity multiplexer that blocks every call until `release()` is
/// called, for exercising the batching-under-load scenario: enqueue many
/// requests while a batch is in flight, then release it and observe they
/// land in a single follow-on batch.
pub struct GatedMultiplexer {
    gate: Mutex<bool>,
    condvar: Condvar,
    calls: AtomicUsize,
}

impl Default for GatedMultiplexer {
    fn default() -> Self {
        Self {
            gate: Mutex::new(false),
            condvar: Condvar::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl GatedMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let mut open = self.gate.lock().unwrap();
        *open = true;
        self.condvar.notify_all();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn wait_for_release(&self) {
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.condvar.wait(open).unwrap();
        }
    }
}

impl Multiplexer for GatedMultiplexer {
    type Request = u64;
    type Response = u64;
    type Error = Never;

    async fn execute(&self, requests: Vec<u64>) -> Result<Vec<u64>, Never> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        // Blocking wait is deliberate: this double stands in for a
        // synchronous downstream call and is only ever driven by
        // `ThreadExecutor`, never by an async-aware executor.
        self.wait_for_release();
        Ok(requests)
    }
}

/// Spawns each continuation on its own OS thread, driving it to completion
/// with a busy poll loop. Adequate for tests where the multiplexer future
/// may block a thread (e.g. [`GatedMultiplexer`]) rather than yield.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
        thread::spawn(move || block_on(future));
    }
}

fn block_on(mut future: Pin<Box<dyn Future<Output = ()> + Send>>) {
    use std::task::{Context, Poll, Wake, Waker};

    struct ThreadWake(thread::Thread);
    impl Wake for ThreadWake {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    let waker: Waker = Arc::new(ThreadWake(thread::current())).into();
    let mut cx = Context::from_waker(&waker);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => return,
            Poll::Pending => thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_executor_runs_future_to_completion() {
        use std::sync::atomic::{AtomicBool, Ordering as Ord};
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        ThreadExecutor.spawn(Box::pin(async move {
            ran2.store(true, Ord::SeqCst);
        }));
        // Give the spawned thread a moment; in real use the Batcher never
        // needs to observe completion synchronously.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(ran.load(Ord::SeqCst));
    }
}
