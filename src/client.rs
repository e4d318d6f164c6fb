//! Dialing WebSocket client with auto-reconnect.

use crate::{
    connection::{Connection, ConnectionConfig},
    error::WsError,
    socket::{FrameKind, TungsteniteSink, TungsteniteStream},
};
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Callback invoked with the live [`Connection`] after every successful dial.
pub type OnConnect = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// Callback invoked for every inbound data frame.
pub type OnMessage = Arc<dyn Fn(FrameKind, Bytes) + Send + Sync>;

/// Callback invoked on read errors and failed redials.
pub type OnClose = Arc<dyn Fn(&WsError) + Send + Sync>;

struct ClientInner {
    url: String,
    headers: Vec<(String, String)>,
    dial_timeout: Duration,
    reconnect_interval: Duration,
    /// Negative means retry forever.
    max_reconnect_attempts: i64,
    connection: ConnectionConfig,
    on_connect: Option<OnConnect>,
    on_message: Option<OnMessage>,
    on_close: Option<OnClose>,
    closed: CancellationToken,
    current: Mutex<Option<Arc<Connection>>>,
}

/// WebSocket client for one endpoint.
///
/// [`Client::connect`] performs the first dial inline and returns its
/// outcome; afterwards a background loop reads frames and redials on
/// failure. The first dial is never retried — its error belongs to the
/// caller.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &self.inner.url)
            .field("closed", &self.inner.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Configuration for a [`Client`].
pub struct ClientBuilder {
    url: String,
    headers: Vec<(String, String)>,
    dial_timeout: Duration,
    reconnect_interval: Duration,
    max_reconnect_attempts: i64,
    connection: ConnectionConfig,
    on_connect: Option<OnConnect>,
    on_message: Option<OnMessage>,
    on_close: Option<OnClose>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("dial_timeout", &self.dial_timeout)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish_non_exhaustive()
    }
}

impl ClientBuilder {
    /// Add a header to the handshake request (e.g. an auth token).
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Upper bound on a single dial. Default 5 s.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Pause between redials. Default 2 s.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Redial budget after a lost connection; the counter resets to zero on
    /// every successful reconnect. Negative means retry forever (the
    /// default); zero gives up after the first failed redial.
    pub fn max_reconnect_attempts(mut self, attempts: i64) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Tunables for the underlying connection.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Invoked with the live connection after every successful dial.
    pub fn on_connect(mut self, callback: impl Fn(Arc<Connection>) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    /// Invoked for every inbound data frame.
    pub fn on_message(
        mut self,
        callback: impl Fn(FrameKind, Bytes) + Send + Sync + 'static,
    ) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    /// Invoked on read errors and failed redials.
    pub fn on_close(mut self, callback: impl Fn(&WsError) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(callback));
        self
    }

    /// Finish configuration.
    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                url: self.url,
                headers: self.headers,
                dial_timeout: self.dial_timeout,
                reconnect_interval: self.reconnect_interval,
                max_reconnect_attempts: self.max_reconnect_attempts,
                connection: self.connection,
                on_connect: self.on_connect,
                on_message: self.on_message,
                on_close: self.on_close,
                closed: CancellationToken::new(),
                current: Mutex::new(None),
            }),
        }
    }
}

impl Client {
    /// Start configuring a client for `url` (e.g. `ws://127.0.0.1:8080/ws`).
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            url: url.into(),
            headers: Vec::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: -1,
            connection: ConnectionConfig::default(),
            on_connect: None,
            on_message: None,
            on_close: None,
        }
    }

    /// Dial the endpoint. The first dial's outcome is returned to the caller
    /// and never retried; on success the read/reconnect loop runs until
    /// [`Client::close`].
    pub async fn connect(&self) -> Result<(), WsError> {
        let conn = self.inner.dial().await?;
        self.inner.install(&conn);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(conn).await });
        Ok(())
    }

    /// The connection from the most recent successful dial, for sending
    /// outside the callbacks.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.current.lock().clone()
    }

    /// Stop reconnecting and close the current connection. Idempotent.
    pub fn close(&self) {
        self.inner.closed.cancel();
        if let Some(conn) = self.inner.current.lock().take() {
            conn.close();
        }
    }
}

impl ClientInner {
    async fn dial(&self) -> Result<Arc<Connection>, WsError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(WsError::transport)?;
        for (name, value) in &self.headers {
            let name =
                HeaderName::from_bytes(name.as_bytes()).map_err(WsError::transport)?;
            let value = HeaderValue::from_str(value).map_err(WsError::transport)?;
            request.headers_mut().insert(name, value);
        }

        let dialed = tokio::time::timeout(self.dial_timeout, connect_async(request))
            .await
            .map_err(|_| WsError::DeadlineExceeded)?
            .map_err(WsError::transport)?;

        let (socket, _response) = dialed;
        let (sink, stream) = socket.split();
        Ok(Connection::new(
            Box::new(TungsteniteSink(sink)),
            Box::new(TungsteniteStream(stream)),
            self.connection.clone(),
        ))
    }

    fn install(&self, conn: &Arc<Connection>) {
        *self.current.lock() = Some(conn.clone());
        if let Some(callback) = &self.on_connect {
            callback(conn.clone());
        }
    }

    async fn run(self: Arc<Self>, mut conn: Arc<Connection>) {
        let mut attempts: i64 = 0;
        loop {
            // Read until the connection dies.
            loop {
                tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => {
                        conn.close();
                        return;
                    }
                    read = conn.read() => match read {
                        Ok((kind, payload)) => {
                            if let Some(callback) = &self.on_message {
                                callback(kind, payload);
                            }
                        }
                        Err(err) => {
                            self.report(&err);
                            conn.close();
                            break;
                        }
                    }
                }
            }

            // Redial with the configured pause, up to the attempt budget.
            loop {
                tokio::select! {
                    biased;
                    _ = self.closed.cancelled() => return,
                    _ = tokio::time::sleep(self.reconnect_interval) => {}
                }
                match self.dial().await {
                    Ok(redialed) => {
                        attempts = 0;
                        self.install(&redialed);
                        conn = redialed;
                        break;
                    }
                    Err(err) => {
                        self.report(&err);
                        attempts += 1;
                        if self.max_reconnect_attempts >= 0
                            && attempts > self.max_reconnect_attempts
                        {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn report(&self, err: &WsError) {
        match &self.on_close {
            Some(callback) => callback(err),
            None => debug!(%err, url = %self.url, "ws client connection error"),
        }
    }
}
