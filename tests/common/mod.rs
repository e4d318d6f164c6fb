//! Shared fixtures: an in-memory broker standing in for Redis, and
//! address/startup helpers.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use wsx::{Broker, SubscriptionHandler, WsError};

/// In-process broker: publishing fans out to every subscriber on the
/// channel, the publisher included, from a spawned task to mimic network
/// delivery.
#[derive(Default)]
#[allow(dead_code)]
pub struct MemoryBroker {
    subscribers: Mutex<Vec<(String, SubscriptionHandler)>>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(
        &self,
        channel: &str,
        handler: SubscriptionHandler,
    ) -> Result<(), WsError> {
        self.subscribers.lock().push((channel.to_owned(), handler));
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), WsError> {
        let payload = Bytes::copy_from_slice(payload);
        let handlers: Vec<SubscriptionHandler> = self
            .subscribers
            .lock()
            .iter()
            .filter(|(subscribed, _)| subscribed == channel)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            let payload = payload.clone();
            tokio::spawn(async move { handler(payload).await });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), WsError> {
        Ok(())
    }
}

/// Reserve a free loopback address for a test server.
#[allow(dead_code)]
pub fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind to any port");
    let addr = listener.local_addr().expect("local addr");
    format!("127.0.0.1:{}", addr.port())
}

/// Block until the server accepts TCP connections.
#[allow(dead_code)]
pub async fn wait_listening(addr: &str) {
    for _ in 0..200 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server at {addr} did not start listening");
}

/// Channel-backed on_message callback: returns the callback and the
/// receiving end collecting every payload.
#[allow(dead_code)]
pub fn message_channel() -> (
    impl Fn(wsx::FrameKind, Bytes) + Send + Sync + 'static,
    tokio::sync::mpsc::UnboundedReceiver<Bytes>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (
        move |_kind, payload: Bytes| {
            let _ = tx.send(payload);
        },
        rx,
    )
}

/// `MemoryBroker` as the trait object the hub builder takes.
#[allow(dead_code)]
pub fn memory_broker() -> Arc<dyn Broker> {
    Arc::new(MemoryBroker::default())
}
