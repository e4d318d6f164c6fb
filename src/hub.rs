//! In-process registry and fan-out coordinator.
//!
//! The hub indexes local connections three ways (by connection, by user id,
//! by room) and routes broadcast / unicast / kick / room-cast requests. With
//! a [`Broker`] configured, requests are serialized into a JSON envelope and
//! published on one shared channel; every node — the originator included —
//! receives the envelope through its subscription and performs the local
//! fan-out, so cross-node and single-node delivery share one code path.
//!
//! Trace context is injected into the envelope via the globally installed
//! text-map propagator and extracted on receipt, so fan-out on a remote
//! node shows up as a continuation of the originating span.

use crate::{
    broker::{Broker, SubscriptionHandler},
    connection::Connection,
    error::WsError,
    metrics,
};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, trace, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

const DEFAULT_CHANNEL: &str = "ws:global";
const DEFAULT_MAX_ROOMS_PER_CONNECTION: usize = 50;

/// Admission budget for each target of a fan-out. One consumer with a full
/// queue must not stall delivery to the rest.
const FANOUT_SEND_BUDGET: Duration = Duration::from_millis(5);

const KIND_BROADCAST: &str = "broadcast";
const KIND_UNICAST: &str = "unicast";
const KIND_KICK: &str = "kick";
const KIND_ROOM_CAST: &str = "room_cast";

/// Wire format exchanged between hub instances over the broker channel.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    payload: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace_header: Option<HashMap<String, String>>,
}

impl Envelope {
    fn decode(data: &[u8]) -> Result<Self, WsError> {
        serde_json::from_slice(data).map_err(|err| WsError::Protocol(err.to_string()))
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<u64, Arc<Connection>>,
    user_index: HashMap<String, HashSet<u64>>,
    rooms: HashMap<String, HashSet<u64>>,
}

struct HubInner {
    state: RwLock<HubState>,
    broker: Option<Arc<dyn Broker>>,
    channel: String,
    max_rooms_per_connection: usize,
}

/// Registry of all local connections and originator of fan-out requests.
///
/// Cheap to clone; clones share one registry. Built with [`Hub::builder`].
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.count())
            .field("channel", &self.inner.channel)
            .field("distributed", &self.inner.broker.is_some())
            .finish_non_exhaustive()
    }
}

/// Configuration for a [`Hub`].
pub struct HubBuilder {
    broker: Option<Arc<dyn Broker>>,
    channel: String,
    max_rooms_per_connection: usize,
}

impl std::fmt::Debug for HubBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubBuilder")
            .field("channel", &self.channel)
            .field("max_rooms_per_connection", &self.max_rooms_per_connection)
            .field("distributed", &self.broker.is_some())
            .finish_non_exhaustive()
    }
}

impl HubBuilder {
    /// Route broadcast / unicast / kick / room-cast through `broker` so every
    /// node in the fleet applies them. Without a broker the hub fans out to
    /// local connections only.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Broker channel shared by all hub instances. Default `ws:global`.
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Cap on rooms a single connection may join. Default 50.
    pub fn max_rooms_per_connection(mut self, max: usize) -> Self {
        self.max_rooms_per_connection = max;
        self
    }

    /// Build the hub and, when a broker is configured, subscribe to the
    /// shared channel. Subscription failures propagate.
    pub async fn build(self) -> Result<Hub, WsError> {
        metrics::touch();
        let inner = Arc::new(HubInner {
            state: RwLock::new(HubState::default()),
            broker: self.broker,
            channel: self.channel,
            max_rooms_per_connection: self.max_rooms_per_connection,
        });

        if let Some(broker) = inner.broker.clone() {
            let weak = Arc::downgrade(&inner);
            let handler: SubscriptionHandler = Arc::new(move |payload| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_envelope(&payload).await;
                    }
                })
            });
            broker.subscribe(&inner.channel, handler).await?;
        }

        Ok(Hub { inner })
    }
}

impl Hub {
    /// Start configuring a hub.
    pub fn builder() -> HubBuilder {
        HubBuilder {
            broker: None,
            channel: DEFAULT_CHANNEL.to_owned(),
            max_rooms_per_connection: DEFAULT_MAX_ROOMS_PER_CONNECTION,
        }
    }

    /// Add `conn` to the registry. A non-empty id (set before this call)
    /// also indexes the connection by user; setting the id afterwards does
    /// not re-index.
    pub fn register(&self, conn: &Arc<Connection>) {
        let mut state = self.inner.state.write();
        state.connections.insert(conn.serial(), conn.clone());

        let id = conn.id();
        if !id.is_empty() {
            state.user_index.entry(id).or_default().insert(conn.serial());
        }
    }

    /// Remove `conn` from the registry, the user index, and every room it
    /// joined. The connection's own rooms set is the authoritative list.
    pub fn unregister(&self, conn: &Arc<Connection>) {
        let mut state = self.inner.state.write();
        if state.connections.remove(&conn.serial()).is_none() {
            return;
        }

        let id = conn.id();
        if !id.is_empty() {
            if let Some(serials) = state.user_index.get_mut(&id) {
                serials.remove(&conn.serial());
                if serials.is_empty() {
                    state.user_index.remove(&id);
                }
            }
        }

        for room in conn.rooms_snapshot() {
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(&conn.serial());
                if members.is_empty() {
                    state.rooms.remove(&room);
                }
            }
        }
        conn.clear_rooms();
    }

    /// Add every local connection of `user_id` to `room`, best effort per
    /// device: already-joined connections are skipped, and a connection at
    /// the room cap is skipped and counted, without failing the others.
    pub fn join(&self, user_id: &str, room: &str) {
        let mut state = self.inner.state.write();
        let Some(serials) = state.user_index.get(user_id).cloned() else {
            return;
        };

        for serial in serials {
            let Some(conn) = state.connections.get(&serial).cloned() else {
                continue;
            };
            if conn.in_room(room) {
                continue;
            }
            if conn.room_count() >= self.inner.max_rooms_per_connection {
                metrics::LIMIT_EXCEEDED
                    .with_label_values(&["max_rooms"])
                    .inc();
                continue;
            }
            state.rooms.entry(room.to_owned()).or_default().insert(serial);
            conn.add_room(room);
            metrics::HUB_ROOM_OPS.with_label_values(&["join"]).inc();
        }
    }

    /// Remove every local connection of `user_id` from `room`. The room
    /// entry is deleted once its last member leaves.
    pub fn leave(&self, user_id: &str, room: &str) {
        let mut state = self.inner.state.write();
        let Some(serials) = state.user_index.get(user_id).cloned() else {
            return;
        };
        if !state.rooms.contains_key(room) {
            return;
        }

        for serial in serials {
            let Some(members) = state.rooms.get_mut(room) else {
                break;
            };
            if !members.remove(&serial) {
                continue;
            }
            if let Some(conn) = state.connections.get(&serial) {
                conn.remove_room(room);
            }
            metrics::HUB_ROOM_OPS.with_label_values(&["leave"]).inc();
        }

        if state.rooms.get(room).is_some_and(HashSet::is_empty) {
            state.rooms.remove(room);
        }
    }

    /// Deliver `payload` to every connection in the fleet.
    pub async fn broadcast(&self, payload: impl Into<Vec<u8>>) {
        metrics::HUB_BROADCAST.inc();
        self.inner
            .dispatch(Envelope {
                kind: KIND_BROADCAST.to_owned(),
                target: None,
                payload: Some(payload.into()),
                trace_header: None,
            })
            .await;
    }

    /// Deliver `payload` to every connection of `user_id`, on any node.
    pub async fn send_to(&self, user_id: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.inner
            .dispatch(Envelope {
                kind: KIND_UNICAST.to_owned(),
                target: Some(user_id.into()),
                payload: Some(payload.into()),
                trace_header: None,
            })
            .await;
    }

    /// Force-close every connection of `user_id`, on any node.
    pub async fn kick(&self, user_id: impl Into<String>) {
        metrics::HUB_KICK.inc();
        self.inner
            .dispatch(Envelope {
                kind: KIND_KICK.to_owned(),
                target: Some(user_id.into()),
                payload: None,
                trace_header: None,
            })
            .await;
    }

    /// Deliver `payload` to every member of `room`, on any node.
    pub async fn broadcast_to_room(
        &self,
        room: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) {
        self.inner
            .dispatch(Envelope {
                kind: KIND_ROOM_CAST.to_owned(),
                target: Some(room.into()),
                payload: Some(payload.into()),
                trace_header: None,
            })
            .await;
    }

    /// Number of connections registered locally.
    pub fn count(&self) -> usize {
        self.inner.state.read().connections.len()
    }

    /// Close every local connection, clear the indexes, and close the broker
    /// subscription.
    pub async fn close(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.inner.state.write();
            let connections = state.connections.drain().map(|(_, conn)| conn).collect();
            state.user_index.clear();
            state.rooms.clear();
            connections
        };
        for conn in connections {
            conn.close();
        }

        if let Some(broker) = &self.inner.broker {
            if let Err(err) = broker.close().await {
                warn!(%err, "broker close failed");
            }
        }
    }
}

impl HubInner {
    /// Publish the envelope when a broker is configured, otherwise apply it
    /// locally. With a broker, local delivery happens in the subscription
    /// handler when the envelope comes back — never here, or local
    /// connections would see the message twice.
    async fn dispatch(&self, mut envelope: Envelope) {
        envelope.trace_header = current_trace_header();

        let Some(broker) = &self.broker else {
            self.apply(envelope).await;
            return;
        };

        let data = match serde_json::to_vec(&envelope) {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "failed to encode hub envelope");
                return;
            }
        };
        if let Err(err) = broker.publish(&self.channel, &data).await {
            metrics::HUB_PUBLISH_ERRORS.inc();
            warn!(%err, channel = %self.channel, "broker publish failed, envelope dropped");
        }
    }

    async fn handle_envelope(&self, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(%err, "ignoring malformed hub envelope");
                return;
            }
        };

        let span = tracing::debug_span!("hub.envelope", kind = %envelope.kind);
        if let Some(header) = &envelope.trace_header {
            let context = opentelemetry::global::get_text_map_propagator(|propagator| {
                propagator.extract(header)
            });
            span.set_parent(context);
        }

        self.apply(envelope).instrument(span).await;
    }

    async fn apply(&self, envelope: Envelope) {
        let payload = Bytes::from(envelope.payload.unwrap_or_default());
        match (envelope.kind.as_str(), envelope.target) {
            (KIND_BROADCAST, _) => {
                let targets = self.snapshot_all();
                self.fan_out(targets, payload).await;
            }
            (KIND_UNICAST, Some(user_id)) => {
                let targets = self.snapshot_user(&user_id);
                self.fan_out(targets, payload).await;
            }
            (KIND_KICK, Some(user_id)) => {
                for conn in self.snapshot_user(&user_id) {
                    conn.close();
                }
            }
            (KIND_ROOM_CAST, Some(room)) => {
                let targets = self.snapshot_room(&room);
                self.fan_out(targets, payload).await;
            }
            (kind, _) => trace!(kind, "ignoring hub envelope"),
        }
    }

    fn snapshot_all(&self) -> Vec<Arc<Connection>> {
        self.state.read().connections.values().cloned().collect()
    }

    fn snapshot_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let state = self.state.read();
        state
            .user_index
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|serial| state.connections.get(serial).cloned())
            .collect()
    }

    fn snapshot_room(&self, room: &str) -> Vec<Arc<Connection>> {
        let state = self.state.read();
        state
            .rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|serial| state.connections.get(serial).cloned())
            .collect()
    }

    /// Best-effort delivery to a snapshot taken outside the lock. Per-target
    /// failures are already counted by the connection; none abort the rest.
    async fn fan_out(&self, targets: Vec<Arc<Connection>>, payload: Bytes) {
        for conn in targets {
            let _ = conn
                .send_binary_timeout(payload.clone(), FANOUT_SEND_BUDGET)
                .await;
        }
    }
}

fn current_trace_header() -> Option<HashMap<String, String>> {
    let context = tracing::Span::current().context();
    let mut carrier = HashMap::new();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut carrier)
    });
    (!carrier.is_empty()).then_some(carrier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{stub, ConnectionConfig};

    fn quiet_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::ZERO,
            skip_observability: true,
            ..ConnectionConfig::default()
        }
    }

    async fn local_hub() -> Hub {
        Hub::builder().build().await.unwrap()
    }

    #[tokio::test]
    async fn registration_round_trip() {
        let hub = local_hub().await;
        let conns: Vec<_> = (0..4).map(|_| stub(quiet_config())).collect();

        for conn in &conns {
            hub.register(conn);
        }
        assert_eq!(hub.count(), 4);

        // Re-registration is a no-op for the count.
        hub.register(&conns[0]);
        assert_eq!(hub.count(), 4);

        for conn in &conns {
            hub.unregister(conn);
        }
        assert_eq!(hub.count(), 0);

        // Unregistering an unknown connection is harmless.
        hub.unregister(&conns[0]);
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn user_index_tracks_identified_connections() {
        let hub = local_hub().await;

        let phone = stub(quiet_config());
        phone.set_id("alice");
        let laptop = stub(quiet_config());
        laptop.set_id("alice");
        let anonymous = stub(quiet_config());

        hub.register(&phone);
        hub.register(&laptop);
        hub.register(&anonymous);

        {
            let state = hub.inner.state.read();
            let serials = state.user_index.get("alice").unwrap();
            assert_eq!(serials.len(), 2);
            assert!(serials.contains(&phone.serial()));
            assert!(serials.contains(&laptop.serial()));
            // Identity set after register is not indexed.
            assert_eq!(state.user_index.len(), 1);
        }

        hub.unregister(&phone);
        {
            let state = hub.inner.state.read();
            assert_eq!(state.user_index.get("alice").unwrap().len(), 1);
        }

        hub.unregister(&laptop);
        assert!(hub.inner.state.read().user_index.is_empty());
        hub.unregister(&anonymous);
    }

    #[tokio::test]
    async fn room_membership_stays_symmetric() {
        let hub = local_hub().await;
        let conn = stub(quiet_config());
        conn.set_id("bob");
        hub.register(&conn);

        hub.join("bob", "lobby");
        hub.join("bob", "lobby"); // repeat join is a no-op
        hub.join("bob", "ops");

        assert!(conn.in_room("lobby"));
        assert!(conn.in_room("ops"));
        {
            let state = hub.inner.state.read();
            assert_eq!(state.rooms.len(), 2);
            assert!(state.rooms.get("lobby").unwrap().contains(&conn.serial()));
        }

        hub.leave("bob", "lobby");
        assert!(!conn.in_room("lobby"));
        assert!(hub.inner.state.read().rooms.get("lobby").is_none());

        // Unregister purges the remaining membership from both sides.
        hub.unregister(&conn);
        assert_eq!(conn.room_count(), 0);
        assert!(hub.inner.state.read().rooms.is_empty());
    }

    #[tokio::test]
    async fn join_respects_room_cap_per_device() {
        let hub = Hub::builder()
            .max_rooms_per_connection(2)
            .build()
            .await
            .unwrap();

        let phone = stub(quiet_config());
        phone.set_id("carol");
        let tablet = stub(quiet_config());
        tablet.set_id("carol");
        hub.register(&phone);
        hub.register(&tablet);

        hub.join("carol", "a");
        hub.join("carol", "b");
        assert_eq!(phone.room_count(), 2);
        assert_eq!(tablet.room_count(), 2);

        let exceeded_before = metrics::LIMIT_EXCEEDED
            .with_label_values(&["max_rooms"])
            .get();
        hub.join("carol", "c");
        // Both devices are at the cap: two rejections counted, no joins.
        assert_eq!(phone.room_count(), 2);
        assert_eq!(tablet.room_count(), 2);
        assert_eq!(
            metrics::LIMIT_EXCEEDED
                .with_label_values(&["max_rooms"])
                .get(),
            exceeded_before + 2
        );
    }

    #[tokio::test]
    async fn kick_closes_every_connection_of_the_user() {
        let hub = local_hub().await;
        let phone = stub(quiet_config());
        phone.set_id("dave");
        let laptop = stub(quiet_config());
        laptop.set_id("dave");
        let bystander = stub(quiet_config());
        bystander.set_id("erin");

        hub.register(&phone);
        hub.register(&laptop);
        hub.register(&bystander);

        hub.kick("dave").await;

        assert!(phone.is_closed());
        assert!(laptop.is_closed());
        assert!(!bystander.is_closed());
    }

    #[tokio::test]
    async fn close_clears_registry_and_closes_connections() {
        let hub = local_hub().await;
        let conn = stub(quiet_config());
        conn.set_id("frank");
        hub.register(&conn);
        hub.join("frank", "lobby");

        hub.close().await;

        assert!(conn.is_closed());
        assert_eq!(hub.count(), 0);
        assert!(hub.inner.state.read().rooms.is_empty());
        assert!(hub.inner.state.read().user_index.is_empty());
    }

    #[tokio::test]
    async fn envelope_round_trips_with_base64_payload() {
        let envelope = Envelope {
            kind: KIND_ROOM_CAST.to_owned(),
            target: Some("lobby".to_owned()),
            payload: Some(b"\x00\x01binary".to_vec()),
            trace_header: None,
        };
        let data = serde_json::to_vec(&envelope).unwrap();

        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.contains("\"type\":\"room_cast\""));
        // Payload bytes travel base64-encoded, never as a JSON array.
        assert!(!text.contains("[0,1"));

        let decoded: Envelope = serde_json::from_slice(&data).unwrap();
        assert_eq!(decoded.kind, KIND_ROOM_CAST);
        assert_eq!(decoded.target.as_deref(), Some("lobby"));
        assert_eq!(decoded.payload.as_deref(), Some(&b"\x00\x01binary"[..]));
    }

    #[tokio::test]
    async fn unknown_envelope_kind_is_ignored() {
        let hub = local_hub().await;
        let conn = stub(quiet_config());
        hub.register(&conn);

        hub.inner
            .handle_envelope(br#"{"type":"compact","target":"x"}"#)
            .await;
        hub.inner.handle_envelope(b"not json").await;

        assert_eq!(hub.count(), 1);
        assert!(!conn.is_closed());
    }
}
