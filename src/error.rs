use thiserror::Error;

/// Precondition failures surfaced at [`crate::Batcher::create`] time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuildError {
    /// `target_worker_count` was zero or exceeded [`crate::ACTIVE_WORKERS_MAX`].
    #[error("target_worker_count must be in 1..={max}, got {got}")]
    InvalidTargetWorkerCount { got: u32, max: u32 },
}

/// The error resolved into a [`crate::PendingResponse`] when a request does
/// not complete successfully.
///
/// Requires `E: std::error::Error + Send + Sync + 'static` so this type
/// itself implements `std::error::Error` via `#[source]`.
#[derive(Debug, Error)]
pub enum RequestError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The multiplexer's batched call returned an error; propagated verbatim
    /// to every request in that batch.
    #[error("multiplexer call failed: {0}")]
    Multiplexer(#[source] E),

    /// The multiplexer returned a response list whose length did not match
    /// the batch it was given.
    #[error("multiplexer returned {got} responses for a batch of {expected}")]
    ContractViolation { expected: usize, got: usize },

    /// The producer received a cooperative cancellation signal while backing
    /// off on a full queue; the request was never enqueued.
    #[error("request was cancelled before it reached the queue")]
    Cancelled,
}

impl<E> Clone for RequestError<E>
where
    E: std::error::Error + Send + Sync + Clone + 'static,
{
    fn clone(&self) -> Self {
        match self {
            Self::Multiplexer(e) => Self::Multiplexer(e.clone()),
            Self::ContractViolation { expected, got } => Self::ContractViolation {
                expected: *expected,
                got: *got,
            },
            Self::Cancelled => Self::Cancelled,
        }
    }
}
