//! Reference echo service.
//!
//! `service.Echo/Ping` answers with the request message, `PingStream`
//! answers every inbound message in order.

use futures_util::StreamExt;

use crate::dispatch::RoutingTableBuilder;

pub const SERVICE: &str = "service.Echo";

/// Routes of the echo service.
pub fn routes() -> RoutingTableBuilder {
    crate::dispatch::RoutingTable::builder()
        .unary(SERVICE, "Ping", |_, request| async move { Ok(request) })
        .streaming(SERVICE, "PingStream", |_, mut inbound, mut sink| async move {
            while let Some(message) = inbound.next().await {
                sink.send(message?).await?;
            }
            Ok(())
        })
}
