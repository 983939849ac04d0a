//! A lock-free request batcher: coalesces unary `submit()` calls into
//! batches for a caller-supplied, multiplexed executor.
//!
//! The core coordination primitive is [`PackedCounter`], a single atomic
//! word jointly holding the active-worker count and a lower bound on queued
//! requests, paired with [`ConcurrentFifo`], a bounded multi-producer
//! multi-consumer queue. [`Batcher`] drives the submit/batch/dispatch
//! protocol on top of those two; everything else in this crate (errors,
//! metrics, the `Executor`/`Multiplexer` seams) is the ambient stack around
//! that core.

mod backoff;
mod batcher;
mod error;
mod executor;
mod fifo;
mod invariants;
mod multiplexer;
mod packed_counter;
mod pending_response;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub(crate) use backoff::Backoff;

pub use batcher::{Batcher, BatcherMetrics, BatcherMetricsSnapshot, BATCH_SIZE, QUEUE_CAPACITY, QUEUE_FULL_SLEEP_MS};
pub use error::{BuildError, RequestError};
pub use executor::{Executor, InlineExecutor};
pub use fifo::ConcurrentFifo;
pub use multiplexer::{Multiplexer, MultiplexerBoxed};
pub use packed_counter::{PackedCounter, ACTIVE_WORKERS_MAX};
pub use pending_response::{PendingResponse, Resolver, ResponseFuture};

#[cfg(feature = "tokio-executor")]
pub use executor::TokioExecutor;
