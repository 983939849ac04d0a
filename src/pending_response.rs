use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

enum SlotState<Resp, E> {
    Pending(Option<Waker>),
    Resolved(Result<Resp, E>),
    Taken,
}

struct Slot<Resp, E> {
    state: Mutex<SlotState<Resp, E>>,
}

/// A single-request handle owned by one in-flight batch at a time.
///
/// Created by `Batcher::submit`, it holds the caller's request immutably and
/// a completion slot that is written exactly once. The request is never
/// mutated after construction; the only shared mutable state is the
/// completion slot, guarded by a plain `Mutex` (this is the one lock the
/// core takes — everywhere else, coordination runs through the packed
/// counter and the FIFO's own atomics).
pub struct PendingResponse<Req, Resp, E> {
    request: Req,
    slot: Arc<Slot<Resp, E>>,
}

/// The future half of a [`PendingResponse`], returned to the caller of
/// `submit`.
pub struct ResponseFuture<Resp, E> {
    slot: Arc<Slot<Resp, E>>,
}

impl<Req, Resp, E> PendingResponse<Req, Resp, E> {
    /// Constructs an unresolved handle paired with its future.
    pub fn new(request: Req) -> (Self, ResponseFuture<Resp, E>) {
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState::Pending(None)),
        });
        let pending = Self {
            request,
            slot: Arc::clone(&slot),
        };
        let future = ResponseFuture { slot };
        (pending, future)
    }

    /// Borrows the request, e.g. to assemble a batch for the multiplexer.
    pub fn request(&self) -> &Req {
        &self.request
    }

    /// Resolves the handle with a success value. Returns `false` if it was
    /// already resolved (a programmer error upstream, never triggered by the
    /// protocol described in [`crate::Batcher`]).
    pub fn set_response(&self, value: Resp) -> bool {
        Resolver::resolve(&self.slot, Ok(value))
    }

    /// Resolves the handle with an error.
    pub fn set_error(&self, error: E) -> bool {
        Resolver::resolve(&self.slot, Err(error))
    }

    /// Splits the handle into the owned request (to hand to the
    /// multiplexer) and a [`Resolver`] (to resolve once a response comes
    /// back), so a batcher can move the request out without losing the
    /// ability to complete the caller's future afterwards.
    pub fn into_parts(self) -> (Req, Resolver<Resp, E>) {
        (self.request, Resolver { slot: self.slot })
    }
}

/// The resolving half of a [`PendingResponse`] after [`PendingResponse::into_parts`]
/// has moved the request out of it.
pub struct Resolver<Resp, E> {
    slot: Arc<Slot<Resp, E>>,
}

impl<Resp, E> Resolver<Resp, E> {
    pub fn set_response(&self, value: Resp) -> bool {
        Self::resolve(&self.slot, Ok(value))
    }

    pub fn set_error(&self, error: E) -> bool {
        Self::resolve(&self.slot, Err(error))
    }

    fn resolve(slot: &Arc<Slot<Resp, E>>, result: Result<Resp, E>) -> bool {
        let mut guard = slot.state.lock().unwrap();
        match &*guard {
            SlotState::Pending(_) => {
                let waker = match std::mem::replace(&mut *guard, SlotState::Resolved(result)) {
                    SlotState::Pending(waker) => waker,
                    _ => unreachable!(),
                };
                drop(guard);
                if let Some(waker) = waker {
                    waker.wake();
                }
                true
            }
            _ => false,
        }
    }
}

impl<Resp, E> Future for ResponseFuture<Resp, E> {
    type Output = Result<Resp, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.slot.state.lock().unwrap();
        match &mut *guard {
            SlotState::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            SlotState::Resolved(_) => {
                let result = match std::mem::replace(&mut *guard, SlotState::Taken) {
                    SlotState::Resolved(result) => result,
                    _ => unreachable!(),
                };
                Poll::Ready(result)
            }
            SlotState::Taken => panic!("ResponseFuture polled after completion"),
        }
    }
}
