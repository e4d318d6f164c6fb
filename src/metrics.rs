use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::LazyLock;

/// Current number of active websocket connections.
pub(crate) static CONN_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "ws_connections_active",
        "Current number of active websocket connections",
    )
    .expect("valid metric definition")
});

/// Total number of messages received from peers.
pub(crate) static MSG_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ws_messages_received_total",
        "Total number of messages received from peers",
    )
    .expect("valid metric definition")
});

/// Total number of messages sent to peers, by outcome.
pub(crate) static MSG_SENT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ws_messages_sent_total",
            "Total number of messages sent to peers",
        ),
        &["status"],
    )
    .expect("valid metric definition")
});

/// Broadcast operations initiated through the hub.
pub(crate) static HUB_BROADCAST: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ws_hub_broadcast_total",
        "Total number of broadcast operations initiated through the hub",
    )
    .expect("valid metric definition")
});

/// Kick operations initiated through the hub.
pub(crate) static HUB_KICK: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ws_hub_kick_total",
        "Total number of kick operations initiated through the hub",
    )
    .expect("valid metric definition")
});

/// Room membership changes applied by the hub, by operation.
pub(crate) static HUB_ROOM_OPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ws_hub_room_ops_total",
            "Room membership changes applied by the hub",
        ),
        &["op"],
    )
    .expect("valid metric definition")
});

/// Requests rejected because a configured limit was reached, by reason.
pub(crate) static LIMIT_EXCEEDED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "ws_limit_exceeded_total",
            "Requests rejected because a configured limit was reached",
        ),
        &["reason"],
    )
    .expect("valid metric definition")
});

/// Envelopes that could not be published to the broker.
pub(crate) static HUB_PUBLISH_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "ws_hub_publish_errors_total",
        "Total number of hub envelopes that could not be published to the broker",
    )
    .expect("valid metric definition")
});

/// One-time registration into the Prometheus default registry. Forced by
/// every constructor that touches a collector, so plain
/// [`prometheus::gather`] sees the full set without any setup by the caller.
static DEFAULT_REGISTRATION: LazyLock<()> = LazyLock::new(|| {
    if let Err(err) = register_metrics(prometheus::default_registry()) {
        tracing::warn!(%err, "default metrics registration failed");
    }
});

pub(crate) fn touch() {
    LazyLock::force(&DEFAULT_REGISTRATION);
}

/// Register every collector of this crate into `registry`.
///
/// The collectors are process-global; the same instances back the default
/// registry and any custom registry passed here.
pub fn register_metrics(registry: &Registry) -> Result<(), prometheus::Error> {
    registry.register(Box::new(CONN_ACTIVE.clone()))?;
    registry.register(Box::new(MSG_RECEIVED.clone()))?;
    registry.register(Box::new(MSG_SENT.clone()))?;
    registry.register(Box::new(HUB_BROADCAST.clone()))?;
    registry.register(Box::new(HUB_KICK.clone()))?;
    registry.register(Box::new(HUB_ROOM_OPS.clone()))?;
    registry.register(Box::new(LIMIT_EXCEEDED.clone()))?;
    registry.register(Box::new(HUB_PUBLISH_ERRORS.clone()))?;
    Ok(())
}

/// Render the default registry in the Prometheus text exposition format.
/// Backs the server's `/metrics` endpoint.
pub fn render_metrics() -> String {
    touch();
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
