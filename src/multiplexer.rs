use std::future::Future;
use std::pin::Pin;

/// The batched executor a [`crate::Batcher`] hands assembled batches to.
///
/// Uses a native `async fn` in the trait rather than `#[async_trait]`. This
/// form is not object-safe (it returns `impl Future`); for dynamic dispatch
/// across a `Batcher<Req, Resp, M>`'s generic parameter, downstream code can
/// go through [`MultiplexerBoxed`] instead — every `Multiplexer` gets a
/// blanket impl of it for free.
pub trait Multiplexer: Send + Sync {
    /// The error type returned when a batch fails end-to-end.
    type Error: std::error::Error + Send + Sync + Clone + 'static;

    /// Executes a batch of requests, returning exactly one response per
    /// request, in the same order.
    fn execute(
        &self,
        requests: Vec<Self::Request>,
    ) -> impl Future<Output = Result<Vec<Self::Response>, Self::Error>> + Send;

    /// The request type this multiplexer accepts.
    type Request: Send + 'static;
    /// The response type this multiplexer produces.
    type Response: Send + 'static;
}

/// Object-safe counterpart of [`Multiplexer`], used internally by
/// [`crate::Batcher`] so it can hold `Arc<dyn MultiplexerBoxed<...>>` without
/// a generic parameter for every concrete multiplexer type.
pub trait MultiplexerBoxed: Send + Sync {
    type Request: Send + 'static;
    type Response: Send + 'static;
    type Error: std::error::Error + Send + Sync + Clone + 'static;

    fn execute_boxed(
        &self,
        requests: Vec<Self::Request>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Self::Response>, Self::Error>> + Send + '_>>;
}

impl<T> MultiplexerBoxed for T
where
    T: Multiplexer,
{
    type Request = T::Request;
    type Response = T::Response;
    type Error = T::Error;

    fn execute_boxed(
        &self,
        requests: Vec<Self::Request>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Self::Response>, Self::Error>> + Send + '_>> {
        Box::pin(self.execute(requests))
    }
}
