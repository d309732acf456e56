//! The handler abstraction shared by backends, interceptors and the dispatcher.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::dispatch::call::{Call, MessageSink};
use crate::rpc::Status;

/// Something that serves a call.
///
/// A handler reads requests from the `Call`, writes responses to the sink and
/// returns the terminal status. `Ok(())` is reported as `OK`.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, call: Call, sink: MessageSink) -> BoxFuture<'static, Result<(), Status>>;
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Call, MessageSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn call(&self, call: Call, sink: MessageSink) -> BoxFuture<'static, Result<(), Status>> {
        Box::pin((self.f)(call, sink))
    }
}

/// Turn an async closure into a `BoxHandler`.
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
    F: Fn(Call, MessageSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(HandlerFn { f })
}
