//! Pluggable pub/sub seam between hub instances.

use crate::error::WsError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Callback invoked for every message delivered on a subscribed channel.
///
/// The broker's consumer awaits the returned future before taking the next
/// message, so slow handling backpressures delivery. Handlers must be safe
/// to invoke from any task.
pub type SubscriptionHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// External pub/sub facility connecting all nodes on shared channels.
///
/// Implementations must deliver published messages to every subscriber on
/// the channel at least once under normal operation (loss across a broker
/// disconnect is acceptable), **including the publisher itself** — the hub
/// relies on self-delivery to keep local and remote fan-out on one code
/// path. Reconnecting after a broker outage is the implementation's
/// responsibility.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe `handler` to `channel`. Errors here are startup failures
    /// and propagate to the caller.
    async fn subscribe(&self, channel: &str, handler: SubscriptionHandler)
        -> Result<(), WsError>;

    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), WsError>;

    /// Stop consumers and release broker resources.
    async fn close(&self) -> Result<(), WsError>;
}
