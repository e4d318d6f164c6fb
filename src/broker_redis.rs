//! Redis pub/sub adapter for the [`Broker`] seam.

use crate::{
    broker::{Broker, SubscriptionHandler},
    error::WsError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

/// [`Broker`] backed by Redis pub/sub.
///
/// Publishes over one shared multiplexed connection; each subscription gets
/// its own pub/sub connection and consumer task, stopped by
/// [`Broker::close`].
pub struct RedisBroker {
    client: redis::Client,
    publisher: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    shutdown: CancellationToken,
    consumers: TaskTracker,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect lazily to the Redis instance at `url`
    /// (e.g. `redis://127.0.0.1:6379/0`).
    pub fn new(url: &str) -> Result<Self, WsError> {
        Ok(Self::with_client(
            redis::Client::open(url).map_err(WsError::upstream)?,
        ))
    }

    /// Build from an existing client, e.g. one shared with other subsystems.
    pub fn with_client(client: redis::Client) -> Self {
        Self {
            client,
            publisher: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            consumers: TaskTracker::new(),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(
        &self,
        channel: &str,
        handler: SubscriptionHandler,
    ) -> Result<(), WsError> {
        if self.shutdown.is_cancelled() {
            return Err(WsError::Closed);
        }

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(WsError::upstream)?;
        pubsub.subscribe(channel).await.map_err(WsError::upstream)?;

        let shutdown = self.shutdown.clone();
        let channel = channel.to_owned();
        self.consumers.spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    message = messages.next() => {
                        let Some(message) = message else {
                            debug!(%channel, "redis subscription stream ended");
                            break;
                        };
                        let payload = Bytes::copy_from_slice(message.get_payload_bytes());
                        handler(payload).await;
                    }
                }
            }
        });

        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), WsError> {
        if self.shutdown.is_cancelled() {
            return Err(WsError::Closed);
        }

        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            *guard = Some(
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(WsError::upstream)?,
            );
        }
        let Some(connection) = guard.as_mut() else {
            return Err(WsError::Closed);
        };

        let published = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(connection)
            .await;
        if let Err(err) = published {
            // Drop the broken connection; the next publish redials.
            warn!(%err, %channel, "redis publish failed");
            *guard = None;
            return Err(WsError::upstream(err));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), WsError> {
        self.shutdown.cancel();
        self.consumers.close();
        self.consumers.wait().await;
        *self.publisher.lock().await = None;
        Ok(())
    }
}
