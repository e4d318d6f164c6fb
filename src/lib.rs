//! wsx: a real-time messaging core for horizontally scaled services.
//!
//! This crate provides the WebSocket plumbing of a service fleet: a
//! [`Server`] that upgrades and drives connections, a [`Client`] with
//! auto-reconnect, and a [`Hub`] that indexes live [`Connection`]s (by
//! connection, by user, by room) and fans messages out across every node
//! through a pluggable [`Broker`]. A bounded worker [`Pool`] backs the
//! per-connection handlers.
//!
//! ## Serving
//!
//! The server owns the HTTP surface: the upgrade endpoint (default `/ws`),
//! `GET /healthz`, and the Prometheus exposition at `GET /metrics`. Each
//! accepted connection runs the configured hooks and then your handler:
//!
//! ```no_run
//! use std::sync::Arc;
//! use wsx::{Connection, Hub, Server};
//!
//! # async fn _main() -> Result<(), wsx::WsError> {
//! let hub = Hub::builder().build().await?;
//!
//! let server = Server::builder("0.0.0.0:8080")
//!     .on_connect(|conn, _request| {
//!         conn.set_id("user-from-auth-claim");
//!         Ok(())
//!     })
//!     .hub(hub.clone())
//!     .build();
//!
//! server
//!     .start(move |conn: Arc<Connection>| {
//!         let hub = hub.clone();
//!         async move {
//!             hub.register(&conn);
//!             while let Ok((_kind, frame)) = conn.read().await {
//!                 hub.broadcast(frame.to_vec()).await;
//!             }
//!             hub.unregister(&conn);
//!         }
//!     })
//!     .await
//! # }
//! ```
//!
//! ## Scaling out
//!
//! With a [`Broker`] configured, hub requests are serialized into a JSON
//! envelope and published on one shared channel; every node (the originator
//! included) receives the envelope and performs the local fan-out. Delivery
//! is at-most-once per local connection, best effort, unordered across
//! nodes. The `redis` feature ships a Redis pub/sub adapter:
//!
//! ```no_run
//! # #[cfg(feature = "redis")]
//! # async fn _main() -> Result<(), wsx::WsError> {
//! # use std::sync::Arc;
//! use wsx::{Hub, RedisBroker};
//!
//! let broker = Arc::new(RedisBroker::new("redis://127.0.0.1:6379")?);
//! let hub = Hub::builder().broker(broker).build().await?;
//! hub.broadcast("fleet-wide announcement").await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Dialing
//!
//! ```no_run
//! use wsx::Client;
//!
//! # async fn _main() -> Result<(), wsx::WsError> {
//! let client = Client::builder("ws://127.0.0.1:8080/ws")
//!     .header("X-Token", "secret-token")
//!     .on_message(|_kind, payload| println!("{payload:?}"))
//!     .build();
//! client.connect().await?;
//! client.connection().expect("just connected").send_text("hello").await?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    rustdoc::all
)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod broker;
pub use broker::{Broker, SubscriptionHandler};

#[cfg(feature = "redis")]
mod broker_redis;
#[cfg(feature = "redis")]
pub use broker_redis::RedisBroker;

mod client;
pub use client::{Client, ClientBuilder, OnClose, OnConnect, OnMessage};

mod connection;
pub use connection::{Connection, ConnectionConfig};

mod error;
pub use error::{BoxError, WsError};

mod hub;
pub use hub::{Hub, HubBuilder};

mod metrics;
pub use metrics::{register_metrics, render_metrics};

mod pool;
pub use pool::{PanicHandler, Pool, PoolBuilder};

mod server;
pub use server::{BeforeUpgradeHook, CheckOriginHook, OnConnectHook, Server, ServerBuilder};

mod socket;
pub use socket::{Frame, FrameKind};
