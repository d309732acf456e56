//! Routing tables: immutable maps from (service, method) to handler.
//!
//! # Design Decisions
//! - Tables are built completely before anyone can see them
//! - `build` reports every problem at once, like config validation
//! - The health service name is reserved for the built-in table

use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;

use crate::dispatch::call::{MessageSink, RequestContext};
use crate::dispatch::handler::{handler_fn, BoxHandler};
use crate::health::HEALTH_SERVICE;
use crate::rpc::{Status, Streaming};

/// Streaming shape of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Streaming,
}

impl CallKind {
    /// Exactly one request message.
    pub fn single_request(&self) -> bool {
        matches!(self, CallKind::Unary | CallKind::ServerStreaming)
    }

    /// Exactly one response message.
    pub fn single_response(&self) -> bool {
        matches!(self, CallKind::Unary | CallKind::ClientStreaming)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Unary => "unary",
            CallKind::ServerStreaming => "server_streaming",
            CallKind::ClientStreaming => "client_streaming",
            CallKind::Streaming => "streaming",
        }
    }
}

/// One registered method.
#[derive(Clone)]
pub struct Route {
    service: String,
    method: String,
    kind: CallKind,
    handler: BoxHandler,
}

impl Route {
    pub fn new(service: impl Into<String>, method: impl Into<String>, kind: CallKind, handler: BoxHandler) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind,
            handler,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn handler(&self) -> &BoxHandler {
        &self.handler
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("service", &self.service)
            .field("method", &self.method)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A single problem found while building a table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteIssue {
    #[error("route /{service}/{method} registered more than once")]
    Duplicate { service: String, method: String },

    #[error("route /{service}/{method} has an empty or malformed name")]
    InvalidName { service: String, method: String },

    #[error("service {0} is reserved")]
    Reserved(String),

    #[error("{0}")]
    Rejected(String),
}

/// Table construction failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("routing table rejected: {}", join_issues(.0))]
pub struct RoutingError(pub Vec<RouteIssue>);

fn join_issues(issues: &[RouteIssue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Immutable (service, method) → route map.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    services: HashMap<String, HashMap<String, Route>>,
}

impl RoutingTable {
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::new()
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<&Route> {
        self.services.get(service)?.get(method)
    }

    /// Service names, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Collects routes and validates them into a `RoutingTable`.
#[derive(Default)]
pub struct RoutingTableBuilder {
    routes: Vec<Route>,
    rejections: Vec<String>,
    allow_reserved: bool,
}

impl RoutingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reserved() -> Self {
        Self {
            allow_reserved: true,
            ..Self::default()
        }
    }

    /// Register a handler with an explicit call kind.
    pub fn route(mut self, service: impl Into<String>, method: impl Into<String>, kind: CallKind, handler: BoxHandler) -> Self {
        self.routes.push(Route::new(service, method, kind, handler));
        self
    }

    /// One request, one response.
    pub fn unary<F, Fut>(self, service: impl Into<String>, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        let f = std::sync::Arc::new(f);
        let handler = handler_fn(move |call, mut sink| {
            let f = std::sync::Arc::clone(&f);
            async move {
                let (ctx, mut inbound) = call.into_parts();
                let request = inbound.single().await?;
                let response = f(ctx, request).await?;
                sink.send(response).await
            }
        });
        self.route(service, method, CallKind::Unary, handler)
    }

    /// One request, any number of responses.
    pub fn server_streaming<F, Fut>(self, service: impl Into<String>, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestContext, Bytes, MessageSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = std::sync::Arc::new(f);
        let handler = handler_fn(move |call, sink| {
            let f = std::sync::Arc::clone(&f);
            async move {
                let (ctx, mut inbound) = call.into_parts();
                let request = inbound.single().await?;
                f(ctx, request, sink).await
            }
        });
        self.route(service, method, CallKind::ServerStreaming, handler)
    }

    /// Any number of requests, one response.
    pub fn client_streaming<F, Fut>(self, service: impl Into<String>, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestContext, Streaming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        let f = std::sync::Arc::new(f);
        let handler = handler_fn(move |call, mut sink| {
            let f = std::sync::Arc::clone(&f);
            async move {
                let (ctx, inbound) = call.into_parts();
                let response = f(ctx, inbound).await?;
                sink.send(response).await
            }
        });
        self.route(service, method, CallKind::ClientStreaming, handler)
    }

    /// Independent request and response sequences.
    pub fn streaming<F, Fut>(self, service: impl Into<String>, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestContext, Streaming, MessageSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let f = std::sync::Arc::new(f);
        let handler = handler_fn(move |call, sink| {
            let f = std::sync::Arc::clone(&f);
            async move {
                let (ctx, inbound) = call.into_parts();
                f(ctx, inbound, sink).await
            }
        });
        self.route(service, method, CallKind::Streaming, handler)
    }

    /// Make `build` fail, e.g. when backend state could not be prepared.
    pub fn reject(mut self, reason: impl Into<String>) -> Self {
        self.rejections.push(reason.into());
        self
    }

    /// Validate and freeze. Returns every issue found.
    pub fn build(self) -> Result<RoutingTable, RoutingError> {
        let mut issues: Vec<RouteIssue> = self.rejections.into_iter().map(RouteIssue::Rejected).collect();
        let mut services: HashMap<String, HashMap<String, Route>> = HashMap::new();

        for route in self.routes {
            if !is_valid_name(&route.service) || !is_valid_name(&route.method) {
                issues.push(RouteIssue::InvalidName {
                    service: route.service,
                    method: route.method,
                });
                continue;
            }
            if !self.allow_reserved && route.service == HEALTH_SERVICE {
                let reserved = RouteIssue::Reserved(route.service);
                if !issues.contains(&reserved) {
                    issues.push(reserved);
                }
                continue;
            }
            let methods = services.entry(route.service.clone()).or_default();
            if methods.contains_key(&route.method) {
                issues.push(RouteIssue::Duplicate {
                    service: route.service,
                    method: route.method,
                });
                continue;
            }
            methods.insert(route.method.clone(), route);
        }

        if issues.is_empty() {
            Ok(RoutingTable { services })
        } else {
            Err(RoutingError(issues))
        }
    }
}

impl std::fmt::Debug for RoutingTableBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTableBuilder")
            .field("routes", &self.routes)
            .field("rejections", &self.rejections)
            .finish()
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.chars().any(|c| c.is_whitespace() || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> RoutingTableBuilder {
        RoutingTable::builder().unary("service.Echo", "Ping", |_, req| async move { Ok(req) })
    }

    #[test]
    fn lookup_finds_registered_routes() {
        let table = echo()
            .streaming("service.Echo", "PingStream", |_, _, _| async { Ok(()) })
            .build()
            .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.services(), vec!["service.Echo"]);
        assert_eq!(table.lookup("service.Echo", "Ping").unwrap().kind(), CallKind::Unary);
        assert_eq!(
            table.lookup("service.Echo", "PingStream").unwrap().kind(),
            CallKind::Streaming
        );
        assert!(table.lookup("service.Echo", "Missing").is_none());
        assert!(table.lookup("service.Other", "Ping").is_none());
    }

    #[test]
    fn build_collects_every_issue() {
        let err = echo()
            .unary("service.Echo", "Ping", |_, req| async move { Ok(req) })
            .unary("", "Ping", |_, req| async move { Ok(req) })
            .unary("grpc.health.v1.Health", "Check", |_, req| async move { Ok(req) })
            .reject("backend warm-up failed")
            .build()
            .unwrap_err();

        assert_eq!(err.0.len(), 4);
        assert!(err.0.contains(&RouteIssue::Rejected("backend warm-up failed".into())));
        assert!(err.0.contains(&RouteIssue::Reserved("grpc.health.v1.Health".into())));
        assert!(err.0.contains(&RouteIssue::Duplicate {
            service: "service.Echo".into(),
            method: "Ping".into()
        }));
        assert!(err.to_string().contains("registered more than once"));
    }

    #[test]
    fn call_kind_cardinality() {
        assert!(CallKind::Unary.single_request() && CallKind::Unary.single_response());
        assert!(CallKind::ServerStreaming.single_request() && !CallKind::ServerStreaming.single_response());
        assert!(!CallKind::ClientStreaming.single_request() && CallKind::ClientStreaming.single_response());
        assert!(!CallKind::Streaming.single_request() && !CallKind::Streaming.single_response());
    }
}
