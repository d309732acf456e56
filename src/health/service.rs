//! `grpc.health.v1.Health` served from the registry.

use futures_util::StreamExt;

use crate::dispatch::{RoutingTable, RoutingTableBuilder};
use crate::health::proto;
use crate::health::registry::HealthRegistry;
use crate::health::HEALTH_SERVICE;

/// Built-in routing table with `Check` and `Watch`.
pub fn routes(registry: HealthRegistry) -> RoutingTable {
    let check_registry = registry.clone();
    let builder = RoutingTableBuilder::reserved()
        .unary(HEALTH_SERVICE, "Check", move |_, request| {
            let registry = check_registry.clone();
            async move {
                let service = proto::decode_request(&request)?;
                Ok(proto::encode_response(registry.check(&service)))
            }
        })
        .server_streaming(HEALTH_SERVICE, "Watch", move |ctx, request, mut sink| {
            let registry = registry.clone();
            async move {
                let service = proto::decode_request(&request)?;
                let mut watch = registry.watch(&service);
                tracing::debug!(service = %service, "Health watch started");
                loop {
                    tokio::select! {
                        _ = ctx.cancel_signal().cancelled() => break,
                        status = watch.next() => match status {
                            Some(status) => sink.send(proto::encode_response(status)).await?,
                            None => break,
                        },
                    }
                }
                tracing::debug!(service = %service, "Health watch ended");
                Ok(())
            }
        });

    // Fixed, valid names: construction cannot fail.
    builder.build().unwrap_or_default()
}
