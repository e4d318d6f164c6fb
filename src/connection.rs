//! One live WebSocket session.
//!
//! A [`Connection`] owns the socket halves and a bounded outbound queue
//! drained by exactly one writer task. Producers enqueue concurrently; the
//! writer serializes wire access, sends heartbeat pings, and closes the
//! socket when the session ends. Reads are pulled by the caller and bounded
//! by the configured read-timeout.

use crate::{
    error::WsError,
    metrics,
    socket::{Frame, FrameKind, FrameSink, FrameStream},
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    future::pending,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{interval_at, timeout, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Per-connection tunables.
///
/// A zero `heartbeat_interval` disables pings; a zero `read_timeout` lets
/// reads block until a frame arrives or the connection closes.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between outbound pings. Default 30 s.
    pub heartbeat_interval: Duration,
    /// Upper bound on a single [`Connection::read`] call. Default 60 s.
    pub read_timeout: Duration,
    /// Upper bound on a single wire write. Default 10 s.
    pub write_timeout: Duration,
    /// Capacity of the outbound frame queue. Default 256.
    pub send_buffer: usize,
    /// Suppress the per-connection counters and gauge. Set by the server for
    /// endpoints on the observability skip list.
    pub skip_observability: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            send_buffer: 256,
            skip_observability: false,
        }
    }
}

#[derive(Default)]
struct Meta {
    id: String,
    bag: HashMap<String, serde_json::Value>,
}

/// One upgraded WebSocket session.
///
/// Sends enqueue into a bounded queue and never touch the wire directly; the
/// `*_timeout` variants bound queue admission and fail with
/// [`WsError::DeadlineExceeded`] when the peer is not draining. After
/// [`Connection::close`] every operation fails with [`WsError::Closed`] and
/// queued frames are abandoned.
///
/// The rooms set is maintained by the [`Hub`](crate::Hub); user code must
/// not assume membership changes outside of hub calls.
pub struct Connection {
    serial: u64,
    meta: RwLock<Meta>,
    rooms: Mutex<HashSet<String>>,
    outbound: mpsc::Sender<Frame>,
    reader: tokio::sync::Mutex<Box<dyn FrameStream>>,
    closed: CancellationToken,
    read_timeout: Duration,
    skip_observability: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.serial)
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        metrics::touch();
        let (outbound, queue) = mpsc::channel(config.send_buffer.max(1));
        let closed = CancellationToken::new();

        if !config.skip_observability {
            metrics::CONN_ACTIVE.inc();
        }

        tokio::spawn(write_loop(
            sink,
            queue,
            closed.clone(),
            config.heartbeat_interval,
            config.write_timeout,
            config.skip_observability,
        ));

        Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            meta: RwLock::new(Meta::default()),
            rooms: Mutex::new(HashSet::new()),
            outbound,
            reader: tokio::sync::Mutex::new(stream),
            closed,
            read_timeout: config.read_timeout,
            skip_observability: config.skip_observability,
        })
    }

    /// Queue a text frame, waiting for a slot if the queue is full.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), WsError> {
        self.enqueue(Frame::Text(text.into()), None).await
    }

    /// Queue a text frame, waiting at most `limit` for a slot.
    pub async fn send_text_timeout(
        &self,
        text: impl Into<String>,
        limit: Duration,
    ) -> Result<(), WsError> {
        self.enqueue(Frame::Text(text.into()), Some(limit)).await
    }

    /// Queue a binary frame, waiting for a slot if the queue is full.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), WsError> {
        self.enqueue(Frame::Binary(data.into()), None).await
    }

    /// Queue a binary frame, waiting at most `limit` for a slot.
    pub async fn send_binary_timeout(
        &self,
        data: impl Into<Bytes>,
        limit: Duration,
    ) -> Result<(), WsError> {
        self.enqueue(Frame::Binary(data.into()), Some(limit)).await
    }

    /// Serialize `value` and queue it as a text frame.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), WsError> {
        self.enqueue(Frame::Text(serde_json::to_string(value)?), None)
            .await
    }

    /// Serialize `value` and queue it as a text frame, waiting at most
    /// `limit` for a slot.
    pub async fn send_json_timeout<T: Serialize>(
        &self,
        value: &T,
        limit: Duration,
    ) -> Result<(), WsError> {
        self.enqueue(Frame::Text(serde_json::to_string(value)?), Some(limit))
            .await
    }

    async fn enqueue(&self, frame: Frame, limit: Option<Duration>) -> Result<(), WsError> {
        if self.closed.is_cancelled() {
            return Err(WsError::Closed);
        }
        match limit {
            None => tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(WsError::Closed),
                sent = self.outbound.send(frame) => sent.map_err(|_| WsError::Closed),
            },
            Some(limit) => tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(WsError::Closed),
                sent = timeout(limit, self.outbound.send(frame)) => match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(WsError::Closed),
                    Err(_) => {
                        if !self.skip_observability {
                            metrics::MSG_SENT.with_label_values(&["dropped"]).inc();
                        }
                        Err(WsError::DeadlineExceeded)
                    }
                },
            },
        }
    }

    /// Wait for the next data frame from the peer.
    ///
    /// Fails with [`WsError::Closed`] when the session ends (locally or by
    /// the peer) and [`WsError::DeadlineExceeded`] when the read-timeout
    /// elapses first.
    pub async fn read(&self) -> Result<(FrameKind, Bytes), WsError> {
        let next = async {
            let mut reader = self.reader.lock().await;
            match reader.next_frame().await {
                Some(Ok(Frame::Text(text))) => Ok((FrameKind::Text, Bytes::from(text))),
                Some(Ok(Frame::Binary(data))) => Ok((FrameKind::Binary, data)),
                Some(Ok(_)) => Err(WsError::Closed),
                Some(Err(err)) => Err(err),
                None => Err(WsError::Closed),
            }
        };

        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(WsError::Closed),
            read = maybe_timeout(self.read_timeout, next) => read,
        };

        if result.is_ok() && !self.skip_observability {
            metrics::MSG_RECEIVED.inc();
        }
        result
    }

    /// Close the session. Idempotent. Signals the writer to exit, which sends
    /// a normal-closure frame, closes the socket, and releases the
    /// active-connections gauge exactly once.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Identifier bound to this session, usually a user id. Empty until
    /// [`Connection::set_id`] is called.
    pub fn id(&self) -> String {
        self.meta.read().id.clone()
    }

    /// Bind an identifier to this session.
    ///
    /// The hub indexes by id at registration time; set the id before
    /// registering (the server's on-connect hook is the natural place).
    pub fn set_id(&self, id: impl Into<String>) {
        self.meta.write().id = id.into();
    }

    /// Read a metadata value.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.meta.read().bag.get(key).cloned()
    }

    /// Store a metadata value.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.meta.write().bag.insert(key.into(), value);
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn add_room(&self, room: &str) {
        self.rooms.lock().insert(room.to_owned());
    }

    pub(crate) fn remove_room(&self, room: &str) {
        self.rooms.lock().remove(room);
    }

    pub(crate) fn in_room(&self, room: &str) -> bool {
        self.rooms.lock().contains(room)
    }

    pub(crate) fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub(crate) fn rooms_snapshot(&self) -> Vec<String> {
        self.rooms.lock().iter().cloned().collect()
    }

    pub(crate) fn clear_rooms(&self) {
        self.rooms.lock().clear();
    }
}

/// The single writer for one connection: drains the outbound queue, sends
/// heartbeat pings, and ends the session on any wire error.
async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut queue: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    heartbeat_interval: Duration,
    write_timeout: Duration,
    skip_observability: bool,
) {
    let mut heartbeat = (!heartbeat_interval.is_zero()).then(|| {
        let mut ticker = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                // A close must not wait out a slow write.
                let written = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    written = timeout(write_timeout, sink.send_frame(frame)) => written,
                };
                match written {
                    Ok(Ok(())) => {
                        if !skip_observability {
                            metrics::MSG_SENT.with_label_values(&["success"]).inc();
                        }
                    }
                    Ok(Err(err)) => {
                        debug!(%err, "write failed, closing connection");
                        if !skip_observability {
                            metrics::MSG_SENT.with_label_values(&["error"]).inc();
                        }
                        closed.cancel();
                        break;
                    }
                    Err(_) => {
                        debug!("write timed out, closing connection");
                        if !skip_observability {
                            metrics::MSG_SENT.with_label_values(&["error"]).inc();
                        }
                        closed.cancel();
                        break;
                    }
                }
            }
            _ = tick(&mut heartbeat) => {
                let ping = tokio::select! {
                    biased;
                    _ = closed.cancelled() => break,
                    ping = timeout(write_timeout, sink.send_frame(Frame::Ping)) => ping,
                };
                if !matches!(ping, Ok(Ok(()))) {
                    debug!("heartbeat failed, closing connection");
                    closed.cancel();
                    break;
                }
            }
        }
    }

    sink.close_normal().await;
    if !skip_observability {
        metrics::CONN_ACTIVE.dec();
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn maybe_timeout<T>(
    limit: Duration,
    work: impl std::future::Future<Output = Result<T, WsError>>,
) -> Result<T, WsError> {
    if limit.is_zero() {
        work.await
    } else {
        match timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(WsError::DeadlineExceeded),
        }
    }
}

#[cfg(test)]
pub(crate) fn stub(config: ConnectionConfig) -> Arc<Connection> {
    use crate::socket::testing::{DiscardSink, SilentStream};
    Connection::new(Box::new(DiscardSink), Box::new(SilentStream), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::{SilentStream, StalledSink};

    /// Serializes the tests that assert on the process-global collectors.
    static METRICS_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn quiet_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::ZERO,
            skip_observability: true,
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let conn = stub(quiet_config());
        conn.close();
        assert!(matches!(conn.send_text("late").await, Err(WsError::Closed)));
        assert!(matches!(
            conn.send_binary(vec![1, 2, 3]).await,
            Err(WsError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_gauge_once() {
        let _guard = METRICS_LOCK.lock().unwrap();

        let config = ConnectionConfig {
            heartbeat_interval: Duration::ZERO,
            ..ConnectionConfig::default()
        };
        let before = metrics::CONN_ACTIVE.get();
        let conn = Connection::new(Box::new(StalledSink), Box::new(SilentStream), config);
        assert_eq!(metrics::CONN_ACTIVE.get(), before + 1);

        for _ in 0..3 {
            conn.close();
        }
        // Writer exit releases the gauge; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics::CONN_ACTIVE.get(), before);
    }

    #[tokio::test]
    async fn full_queue_send_times_out_and_counts_drop() {
        let _guard = METRICS_LOCK.lock().unwrap();

        let config = ConnectionConfig {
            heartbeat_interval: Duration::ZERO,
            send_buffer: 2,
            ..ConnectionConfig::default()
        };
        let conn = Connection::new(Box::new(StalledSink), Box::new(SilentStream), config);

        // The writer pulls one frame and stalls in the wire write; let it.
        conn.send_text("first").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Two more fit in the queue.
        conn.send_text("second").await.unwrap();
        conn.send_text("third").await.unwrap();

        let dropped_before = metrics::MSG_SENT.with_label_values(&["dropped"]).get();
        let result = conn
            .send_text_timeout("fourth", Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(WsError::DeadlineExceeded)));
        assert_eq!(
            metrics::MSG_SENT.with_label_values(&["dropped"]).get(),
            dropped_before + 1
        );

        // Let the writer release the gauge before the lock is dropped, so
        // the gauge assertions in the close test stay undisturbed.
        conn.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn metadata_bag_round_trips() {
        let conn = stub(quiet_config());
        assert_eq!(conn.id(), "");
        conn.set_id("user-7");
        assert_eq!(conn.id(), "user-7");

        assert!(conn.get("topic").is_none());
        conn.set("topic", serde_json::json!("/orders/7"));
        assert_eq!(conn.get("topic"), Some(serde_json::json!("/orders/7")));
        conn.close();
    }

    #[tokio::test]
    async fn read_respects_timeout() {
        let config = ConnectionConfig {
            read_timeout: Duration::from_millis(20),
            ..quiet_config()
        };
        let conn = Connection::new(
            Box::new(StalledSink),
            Box::new(SilentStream),
            config,
        );
        assert!(matches!(
            conn.read().await,
            Err(WsError::DeadlineExceeded)
        ));
        conn.close();
    }
}
