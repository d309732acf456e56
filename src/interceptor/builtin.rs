//! Interceptors shipped with the server, selectable from configuration.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use tracing::Instrument;

use crate::config::schema::{InterceptorConfig, InterceptorKind};
use crate::dispatch::{BoxHandler, Handler};
use crate::interceptor::chain::{interceptor_fn, Interceptor};
use crate::interceptor::registry::InterceptorRegistry;
use crate::rpc::{Code, Status};

pub const REQUEST_ID: &str = "x-request-id";

/// Request ID of a call, stored in the request context extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error building interceptors from configuration.
#[derive(Debug, thiserror::Error)]
pub enum BuiltinError {
    #[error("interceptor {0}: auth requires a token")]
    MissingToken(String),
}

/// Ensure every call carries an `x-request-id`.
pub fn request_id() -> Arc<dyn Interceptor> {
    interceptor_fn(|mut call, sink, next: BoxHandler| {
        let ctx = call.context_mut();
        let existing = ctx
            .metadata()
            .get(REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let id = match existing {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    ctx.metadata_mut().insert(REQUEST_ID, value);
                }
                id
            }
        };
        ctx.extensions_mut().insert(RequestId(id));
        next.call(call, sink)
    })
}

/// One span per call, plus a completion event.
pub fn logging() -> Arc<dyn Interceptor> {
    interceptor_fn(|call, sink, next: BoxHandler| {
        let ctx = call.context();
        let request_id = ctx
            .extensions()
            .get::<RequestId>()
            .map(ToString::to_string)
            .unwrap_or_default();
        let span = tracing::info_span!(
            "rpc_call",
            service = %ctx.service(),
            method = %ctx.method(),
            request_id = %request_id,
        );
        let started = std::time::Instant::now();
        async move {
            tracing::debug!("Call started");
            let result = next.call(call, sink).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(()) => tracing::info!(code = %Code::Ok, latency_ms, "Call completed"),
                Err(status) => tracing::warn!(
                    code = %status.code(),
                    message = %status.message(),
                    latency_ms,
                    "Call failed"
                ),
            }
            result
        }
        .instrument(span)
    })
}

/// Call counters and latency histogram.
pub fn metrics() -> Arc<dyn Interceptor> {
    interceptor_fn(|call, sink, next: BoxHandler| {
        let service = call.context().service().to_string();
        let method = call.context().method().to_string();
        let started = std::time::Instant::now();
        async move {
            let result = next.call(call, sink).await;
            let code = result.as_ref().err().map(Status::code).unwrap_or(Code::Ok);
            crate::observability::metrics::record_call(&service, &method, code, started);
            result
        }
    })
}

/// Apply `default_timeout` to calls without a deadline and refuse calls
/// whose deadline has already passed.
pub fn deadline(default_timeout: Option<Duration>) -> Arc<dyn Interceptor> {
    interceptor_fn(move |mut call, sink, next: BoxHandler| {
        if call.context().deadline().is_none() {
            if let Some(timeout) = default_timeout {
                call.context_mut().set_deadline(tokio::time::Instant::now() + timeout);
            }
        }
        async move {
            let Some(deadline) = call.context().deadline() else {
                return next.call(call, sink).await;
            };
            if deadline <= tokio::time::Instant::now() {
                return Err(Status::deadline_exceeded("deadline expired before the call started"));
            }
            let cancel = call.context().cancel_signal().clone();
            match tokio::time::timeout_at(deadline, next.call(call, sink)).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(Status::deadline_exceeded("deadline exceeded"))
                }
            }
        }
    })
}

/// Require `authorization: Bearer <token>`.
pub fn auth(token: impl Into<String>) -> Arc<dyn Interceptor> {
    let expected = format!("Bearer {}", token.into());
    interceptor_fn(move |call, sink, next: BoxHandler| {
        let authorized = call
            .context()
            .metadata()
            .get(http::header::AUTHORIZATION)
            .map(|value| value.as_bytes() == expected.as_bytes())
            .unwrap_or(false);
        async move {
            if !authorized {
                return Err(Status::unauthenticated("missing or invalid bearer token"));
            }
            next.call(call, sink).await
        }
    })
}

/// Build one configured interceptor.
pub fn from_config(config: &InterceptorConfig) -> Result<Arc<dyn Interceptor>, BuiltinError> {
    Ok(match config.kind {
        InterceptorKind::RequestId => request_id(),
        InterceptorKind::Logging => logging(),
        InterceptorKind::Metrics => metrics(),
        InterceptorKind::Deadline => deadline(config.default_timeout_ms.map(Duration::from_millis)),
        InterceptorKind::Auth => match &config.token {
            Some(token) => auth(token.clone()),
            None => return Err(BuiltinError::MissingToken(config.name().to_string())),
        },
    })
}

/// Registry holding the configured interceptors, in configuration order
/// within each priority.
pub fn registry_from_config(configs: &[InterceptorConfig]) -> Result<InterceptorRegistry, BuiltinError> {
    let mut registry = InterceptorRegistry::new();
    for config in configs {
        registry.register(config.name(), config.priority, from_config(config)?);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{handler_fn, Call, MessageSink, RequestContext};
    use crate::interceptor::chain::compose;
    use crate::rpc::Streaming;
    use http::HeaderMap;

    async fn run(interceptors: &[Arc<dyn Interceptor>], ctx: RequestContext, terminal: BoxHandler) -> Result<(), Status> {
        let handler = compose(terminal, interceptors);
        let (sink, _rx) = MessageSink::channel(1);
        handler.call(Call::new(ctx, Streaming::empty()), sink).await
    }

    fn ok() -> BoxHandler {
        handler_fn(|_, _| async { Ok(()) })
    }

    #[tokio::test]
    async fn request_id_is_generated_and_visible_downstream() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let terminal = {
            let seen = Arc::clone(&seen);
            handler_fn(move |call, _| {
                *seen.lock() = call.context().extensions().get::<RequestId>().cloned();
                async { Ok(()) }
            })
        };
        run(&[request_id()], RequestContext::new("s", "m"), terminal).await.unwrap();
        let id = seen.lock().clone().expect("request id set");
        assert!(uuid::Uuid::parse_str(&id.0).is_ok());
    }

    #[tokio::test]
    async fn request_id_keeps_client_value() {
        let mut metadata = HeaderMap::new();
        metadata.insert(REQUEST_ID, HeaderValue::from_static("client-chosen"));
        let terminal = handler_fn(|call, _| {
            let value = call.context().metadata().get(REQUEST_ID).cloned();
            async move {
                assert_eq!(value.unwrap(), "client-chosen");
                Ok(())
            }
        });
        run(&[request_id()], RequestContext::new("s", "m").with_metadata(metadata), terminal)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auth_rejects_missing_token() {
        let err = run(&[auth("secret")], RequestContext::new("s", "m"), ok()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);

        let mut metadata = HeaderMap::new();
        metadata.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        run(&[auth("secret")], RequestContext::new("s", "m").with_metadata(metadata), ok())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deadline_cancels_slow_calls() {
        let slow = handler_fn(|call, _| async move {
            call.context().cancel_signal().cancelled().await;
            Ok(())
        });
        let ctx = RequestContext::new("s", "m");
        let cancel = ctx.cancel_signal().clone();
        let err = run(&[deadline(Some(Duration::from_millis(20)))], ctx, slow)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn expired_deadline_skips_handler() {
        let ctx = RequestContext::new("s", "m").with_deadline(tokio::time::Instant::now());
        let terminal = handler_fn(|_, _| async {
            if true {
                panic!("handler must not run");
            }
            Ok(())
        });
        let err = run(&[deadline(None)], ctx, terminal).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn auth_without_token_is_a_config_error() {
        let config = InterceptorConfig {
            kind: InterceptorKind::Auth,
            name: None,
            priority: 0,
            token: None,
            default_timeout_ms: None,
        };
        assert!(matches!(from_config(&config), Err(BuiltinError::MissingToken(_))));
    }

    #[test]
    fn registry_from_config_keeps_order() {
        let configs: Vec<InterceptorConfig> = serde_json::from_str(
            r#"[
                {"kind": "metrics", "priority": 10},
                {"kind": "logging"},
                {"kind": "request_id", "priority": -10},
                {"kind": "deadline", "name": "default-deadline", "default_timeout_ms": 500}
            ]"#,
        )
        .unwrap();
        let registry = registry_from_config(&configs).unwrap();
        assert_eq!(registry.names(), vec!["request_id", "logging", "default-deadline", "metrics"]);
    }
}
