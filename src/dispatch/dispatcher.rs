//! Call resolution and invocation against the live routing generation.
//!
//! # Design Decisions
//! - The active table sits behind an `ArcSwap`; resolution is one atomic load
//! - A resolved route pins its generation until the call ends, so a reset
//!   never retargets an in-flight call
//! - The built-in health table is consulted first and is never swapped
//! - Handler panics are caught at this boundary and become `INTERNAL`

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::dispatch::call::{Call, MessageSink, ResetEpoch};
use crate::dispatch::handler::Handler;
use crate::dispatch::table::{Route, RoutingTable};
use crate::rpc::{Status, Streaming};

/// A published routing table and its epoch.
#[derive(Debug)]
pub struct RoutingGeneration {
    epoch: ResetEpoch,
    table: RoutingTable,
}

impl RoutingGeneration {
    pub fn epoch(&self) -> ResetEpoch {
        self.epoch
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }
}

/// A route bound to the generation it was resolved from.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    route: Route,
    generation: Arc<RoutingGeneration>,
}

impl ResolvedRoute {
    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn epoch(&self) -> ResetEpoch {
        self.generation.epoch
    }
}

/// Resolves (service, method) and runs the handler.
#[derive(Clone)]
pub struct Dispatcher {
    current: Arc<ArcSwap<RoutingGeneration>>,
    builtin: Arc<RoutingTable>,
}

impl Dispatcher {
    /// `builtin` is served ahead of every published table.
    pub fn new(builtin: RoutingTable, initial: RoutingTable) -> Self {
        let generation = RoutingGeneration {
            epoch: ResetEpoch::INITIAL,
            table: initial,
        };
        Self {
            current: Arc::new(ArcSwap::from_pointee(generation)),
            builtin: Arc::new(builtin),
        }
    }

    /// The generation new calls resolve against.
    pub fn current(&self) -> Arc<RoutingGeneration> {
        self.current.load_full()
    }

    pub fn epoch(&self) -> ResetEpoch {
        self.current.load().epoch
    }

    /// Atomically replace the active table. Returns the new epoch and the
    /// retired generation. Callers serialise publishes.
    pub(crate) fn publish(&self, table: RoutingTable) -> (ResetEpoch, Arc<RoutingGeneration>) {
        let epoch = self.current.load().epoch.next();
        let retired = self.current.swap(Arc::new(RoutingGeneration { epoch, table }));
        (epoch, retired)
    }

    /// Find the handler for a method.
    pub fn resolve(&self, service: &str, method: &str) -> Result<ResolvedRoute, Status> {
        let generation = self.current.load_full();
        let route = self
            .builtin
            .lookup(service, method)
            .or_else(|| generation.table.lookup(service, method))
            .cloned()
            .ok_or_else(|| Status::not_found(format!("unknown method /{}/{}", service, method)))?;
        Ok(ResolvedRoute { route, generation })
    }

    /// Run a resolved handler, enforcing its message cardinality.
    pub async fn invoke(&self, resolved: ResolvedRoute, mut call: Call, sink: MessageSink) -> Result<(), Status> {
        let kind = resolved.route.kind();
        call.context_mut().set_epoch(resolved.epoch());

        if kind.single_request() {
            let message = call.inbound_mut().single().await?;
            call.replace_inbound(Streaming::from_messages([message]));
        }

        let sink = if kind.single_response() { sink.with_limit(1) } else { sink };
        let sent = sink.sent_counter();
        let handler = Arc::clone(resolved.route.handler());

        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(call, sink))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        let result = match outcome {
            Ok(Ok(())) if kind.single_response() && sent.load(Ordering::Acquire) == 0 => {
                Err(Status::internal("handler completed without a response message"))
            }
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(
                    service = %resolved.route.service(),
                    method = %resolved.route.method(),
                    panic = %reason,
                    "Handler panicked"
                );
                crate::observability::metrics::record_handler_panic(resolved.route.service());
                Err(Status::internal("handler panicked"))
            }
        };

        drop(resolved);
        result
    }
}

impl Handler for Dispatcher {
    fn call(&self, call: Call, sink: MessageSink) -> BoxFuture<'static, Result<(), Status>> {
        let dispatcher = self.clone();
        Box::pin(async move {
            let resolved = dispatcher.resolve(call.context().service(), call.context().method())?;
            dispatcher.invoke(resolved, call, sink).await
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("epoch", &self.epoch())
            .field("builtin", &self.builtin.services())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::call::RequestContext;
    use crate::rpc::Code;
    use bytes::Bytes;

    fn call(service: &str, method: &str, messages: &[&'static str]) -> Call {
        Call::new(
            RequestContext::new(service, method),
            Streaming::from_messages(messages.iter().map(|m| Bytes::from_static(m.as_bytes()))),
        )
    }

    fn echo_table() -> RoutingTable {
        RoutingTable::builder()
            .unary("service.Echo", "Ping", |_, req| async move { Ok(req) })
            .unary("service.Echo", "Boom", |_, _| async move {
                if true {
                    panic!("backend exploded");
                }
                Ok(Bytes::new())
            })
            .route(
                "service.Echo",
                "Silent",
                crate::dispatch::CallKind::Unary,
                crate::dispatch::handler_fn(|_, _| async { Ok(()) }),
            )
            .build()
            .unwrap()
    }

    async fn run(dispatcher: &Dispatcher, call: Call) -> (Vec<Bytes>, Result<(), Status>) {
        let (sink, rx) = MessageSink::channel(8);
        let result = Handler::call(dispatcher, call, sink).await;
        let (messages, _) = rx.collect().await;
        (messages, result)
    }

    #[tokio::test]
    async fn unary_echo() {
        let dispatcher = Dispatcher::new(RoutingTable::default(), echo_table());
        let (messages, result) = run(&dispatcher, call("service.Echo", "Ping", &["TOST"])).await;
        assert!(result.is_ok());
        assert_eq!(messages, vec![Bytes::from_static(b"TOST")]);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let dispatcher = Dispatcher::new(RoutingTable::default(), echo_table());
        let err = dispatcher.resolve("service.Echo", "Nope").unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        let err = dispatcher.resolve("service.Missing", "Ping").unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn unary_rejects_extra_request_messages() {
        let dispatcher = Dispatcher::new(RoutingTable::default(), echo_table());
        let (messages, result) = run(&dispatcher, call("service.Echo", "Ping", &["a", "b"])).await;
        assert_eq!(result.unwrap_err().code(), Code::Internal);
        assert!(messages.is_empty());

        let (_, result) = run(&dispatcher, call("service.Echo", "Ping", &[])).await;
        assert_eq!(result.unwrap_err().code(), Code::Internal);
    }

    #[tokio::test]
    async fn unary_without_response_is_internal() {
        let dispatcher = Dispatcher::new(RoutingTable::default(), echo_table());
        let (_, result) = run(&dispatcher, call("service.Echo", "Silent", &["x"])).await;
        assert_eq!(result.unwrap_err().code(), Code::Internal);
    }

    #[tokio::test]
    async fn panic_becomes_internal() {
        let dispatcher = Dispatcher::new(RoutingTable::default(), echo_table());
        let (_, result) = run(&dispatcher, call("service.Echo", "Boom", &["x"])).await;
        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::Internal);

        // The dispatcher keeps serving.
        let (messages, result) = run(&dispatcher, call("service.Echo", "Ping", &["ok"])).await;
        assert!(result.is_ok());
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn publish_advances_epoch_and_pins_old_generation() {
        let dispatcher = Dispatcher::new(RoutingTable::default(), echo_table());
        let pinned = dispatcher.resolve("service.Echo", "Ping").unwrap();
        assert_eq!(pinned.epoch(), ResetEpoch::INITIAL);

        let (epoch, retired) = dispatcher.publish(RoutingTable::default());
        assert_eq!(epoch, ResetEpoch::new(1));
        assert_eq!(dispatcher.epoch(), epoch);
        assert_eq!(retired.epoch(), ResetEpoch::INITIAL);

        // Resolved before the swap, still served by the old generation.
        let (sink, rx) = MessageSink::channel(1);
        dispatcher
            .invoke(pinned, call("service.Echo", "Ping", &["TOST"]), sink)
            .await
            .unwrap();
        assert_eq!(rx.collect().await.0, vec![Bytes::from_static(b"TOST")]);

        assert_eq!(
            dispatcher.resolve("service.Echo", "Ping").unwrap_err().code(),
            Code::NotFound
        );
    }

    #[tokio::test]
    async fn builtin_routes_survive_publish() {
        let builtin = RoutingTable::builder()
            .unary("builtin.Svc", "Get", |_, _| async { Ok(Bytes::from_static(b"builtin")) })
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(builtin, echo_table());
        dispatcher.publish(RoutingTable::default());
        let (messages, result) = run(&dispatcher, call("builtin.Svc", "Get", &[""])).await;
        assert!(result.is_ok());
        assert_eq!(messages, vec![Bytes::from_static(b"builtin")]);
    }
}
