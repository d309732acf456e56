//! Interceptor composition.
//!
//! # Design Decisions
//! - An interceptor wraps the next handler and returns a new one, so it can
//!   act before, after or instead of the rest of the chain
//! - The first interceptor in the list is the outermost
//! - Composition is pure; the live pipeline is swapped atomically

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;

use crate::dispatch::{BoxHandler, Call, Handler, MessageSink};
use crate::rpc::Status;

/// Wraps a handler with cross-cutting behaviour.
pub trait Interceptor: Send + Sync + 'static {
    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

struct InterceptorFn<F> {
    f: Arc<F>,
}

struct Intercepted<F> {
    f: Arc<F>,
    next: BoxHandler,
}

impl<F, Fut> Handler for Intercepted<F>
where
    F: Fn(Call, MessageSink, BoxHandler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn call(&self, call: Call, sink: MessageSink) -> BoxFuture<'static, Result<(), Status>> {
        Box::pin((self.f)(call, sink, Arc::clone(&self.next)))
    }
}

impl<F, Fut> Interceptor for InterceptorFn<F>
where
    F: Fn(Call, MessageSink, BoxHandler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(Intercepted {
            f: Arc::clone(&self.f),
            next,
        })
    }
}

/// Build an interceptor from `async fn(call, sink, next)`.
pub fn interceptor_fn<F, Fut>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(Call, MessageSink, BoxHandler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(InterceptorFn { f: Arc::new(f) })
}

/// Compose `interceptors` around `terminal`. The first one runs first.
pub fn compose(terminal: BoxHandler, interceptors: &[Arc<dyn Interceptor>]) -> BoxHandler {
    interceptors
        .iter()
        .rev()
        .fold(terminal, |next, interceptor| interceptor.wrap(next))
}

/// The composed handler new calls enter through.
#[derive(Clone)]
pub struct CallPipeline {
    current: Arc<ArcSwap<BoxHandler>>,
}

impl CallPipeline {
    pub fn new(handler: BoxHandler) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(handler)),
        }
    }

    /// Handler for a call starting now. The call keeps it even if the
    /// pipeline is replaced meanwhile.
    pub fn handler(&self) -> BoxHandler {
        let current = self.current.load();
        Arc::clone(&**current)
    }

    pub fn replace(&self, handler: BoxHandler) {
        self.current.store(Arc::new(handler));
    }
}

impl std::fmt::Debug for CallPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPipeline").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{handler_fn, RequestContext};
    use crate::rpc::Streaming;
    use parking_lot::Mutex;

    fn recording(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Interceptor> {
        interceptor_fn(move |call, sink, next: BoxHandler| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{} in", name));
                let result = next.call(call, sink).await;
                log.lock().push(format!("{} out", name));
                result
            }
        })
    }

    async fn run(handler: &BoxHandler) -> Result<(), Status> {
        let (sink, _rx) = MessageSink::channel(1);
        let call = Call::new(RequestContext::new("svc", "M"), Streaming::empty());
        handler.call(call, sink).await
    }

    #[tokio::test]
    async fn first_interceptor_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = {
            let log = Arc::clone(&log);
            handler_fn(move |_, _| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push("handler".to_string());
                    Ok(())
                }
            })
        };
        let chain = vec![recording("a", log.clone()), recording("b", log.clone())];

        let handler = compose(terminal, &chain);
        run(&handler).await.unwrap();

        assert_eq!(*log.lock(), vec!["a in", "b in", "handler", "b out", "a out"]);
    }

    #[tokio::test]
    async fn interceptor_can_short_circuit() {
        let terminal = handler_fn(|_, _| async {
            if true {
                panic!("must not run");
            }
            Ok(())
        });
        let deny = interceptor_fn(|_, _, _| async { Err(Status::unauthenticated("no token")) });

        let handler = compose(terminal, &[deny]);
        assert_eq!(run(&handler).await.unwrap_err().message(), "no token");
    }

    #[tokio::test]
    async fn pipeline_swap_keeps_taken_handler() {
        let pipeline = CallPipeline::new(handler_fn(|_, _| async { Ok(()) }));
        let taken = pipeline.handler();
        pipeline.replace(handler_fn(|_, _| async { Err(Status::unavailable("new")) }));

        assert!(run(&taken).await.is_ok());
        assert!(run(&pipeline.handler()).await.is_err());
    }
}
