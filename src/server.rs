//! WebSocket server surface.
//!
//! An [`axum`] application with the upgrade endpoint (default `/ws`), a
//! `/healthz` probe, and the Prometheus `/metrics` exposition. The upgrade
//! pipeline runs the auth and origin hooks, builds a [`Connection`], and
//! hands it to the per-connection handler on the server's worker pool.

use crate::{
    connection::{Connection, ConnectionConfig},
    error::{BoxError, WsError},
    hub::Hub,
    metrics,
    pool::Pool,
    socket::{AxumSink, AxumStream},
};
use axum::{
    extract::{ws::WebSocket, Request, State, WebSocketUpgrade},
    http::{header, request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

const DEFAULT_PATH: &str = "/ws";
const DEFAULT_SKIP_PATHS: &[&str] = &["/healthz", "/metrics"];
const DEFAULT_POOL_SIZE: usize = 128;

/// Hook run before the upgrade handshake; an error rejects the request with
/// `401 Unauthorized`.
pub type BeforeUpgradeHook = Arc<dyn Fn(&Parts) -> Result<(), BoxError> + Send + Sync>;

/// Origin check run before the upgrade; `false` rejects with `403 Forbidden`.
pub type CheckOriginHook = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

/// Hook run right after the upgrade, before the per-connection handler; the
/// natural place to bind an authenticated user id via
/// [`Connection::set_id`]. An error closes the connection.
pub type OnConnectHook = Arc<dyn Fn(&Arc<Connection>, &Parts) -> Result<(), BoxError> + Send + Sync>;

type ConnectionHandler = Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

struct ServerState {
    path: String,
    skip_paths: Vec<String>,
    before_upgrade: Option<BeforeUpgradeHook>,
    check_origin: Option<CheckOriginHook>,
    on_connect: Option<OnConnectHook>,
    connection: ConnectionConfig,
    hub: Option<Hub>,
    pool: Pool,
    disable_tracing: bool,
}

/// WebSocket server bound to one address.
///
/// Built with [`Server::builder`]; [`Server::start`] serves until
/// [`Server::shutdown`].
pub struct Server {
    addr: String,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    started: AtomicBool,
    exited: watch::Sender<bool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("path", &self.state.path)
            .finish_non_exhaustive()
    }
}

/// Configuration for a [`Server`].
pub struct ServerBuilder {
    addr: String,
    path: String,
    skip_paths: Vec<String>,
    before_upgrade: Option<BeforeUpgradeHook>,
    check_origin: Option<CheckOriginHook>,
    on_connect: Option<OnConnectHook>,
    connection: ConnectionConfig,
    hub: Option<Hub>,
    pool_size: usize,
    disable_tracing: bool,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("addr", &self.addr)
            .field("path", &self.path)
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    /// Path of the upgrade endpoint. Default `/ws`.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Add a path that metrics, counters, and tracing skip. `/healthz` and
    /// `/metrics` are always skipped.
    pub fn observability_skip_path(mut self, path: impl Into<String>) -> Self {
        self.skip_paths.push(path.into());
        self
    }

    /// Authentication hook run before the upgrade handshake.
    pub fn before_upgrade(
        mut self,
        hook: impl Fn(&Parts) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.before_upgrade = Some(Arc::new(hook));
        self
    }

    /// Origin check run before the upgrade handshake.
    pub fn check_origin(mut self, hook: impl Fn(&Parts) -> bool + Send + Sync + 'static) -> Self {
        self.check_origin = Some(Arc::new(hook));
        self
    }

    /// Hook run on every new connection before the handler.
    pub fn on_connect(
        mut self,
        hook: impl Fn(&Arc<Connection>, &Parts) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Defaults applied to every accepted connection.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Hub owned by this server; closed during [`Server::shutdown`].
    pub fn hub(mut self, hub: Hub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Worker count of the pool that runs per-connection handlers; it bounds
    /// the number of concurrently served connections. Default 128.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Skip the span-per-request middleware entirely.
    pub fn disable_tracing(mut self) -> Self {
        self.disable_tracing = true;
        self
    }

    /// Build the server. Must be called within a tokio runtime (the worker
    /// pool spawns here).
    pub fn build(self) -> Server {
        metrics::touch();
        let mut skip_paths: Vec<String> =
            DEFAULT_SKIP_PATHS.iter().map(|path| (*path).to_owned()).collect();
        skip_paths.extend(self.skip_paths);

        let (exited, _) = watch::channel(false);
        Server {
            addr: self.addr,
            state: Arc::new(ServerState {
                path: self.path,
                skip_paths,
                before_upgrade: self.before_upgrade,
                check_origin: self.check_origin,
                on_connect: self.on_connect,
                connection: self.connection,
                hub: self.hub,
                pool: Pool::builder(self.pool_size).build(),
                disable_tracing: self.disable_tracing,
            }),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            exited,
        }
    }
}

struct UpgradeCtx {
    state: Arc<ServerState>,
    handler: ConnectionHandler,
}

impl Server {
    /// Start configuring a server listening on `addr`
    /// (e.g. `127.0.0.1:8080`).
    pub fn builder(addr: impl Into<String>) -> ServerBuilder {
        ServerBuilder {
            addr: addr.into(),
            path: DEFAULT_PATH.to_owned(),
            skip_paths: Vec::new(),
            before_upgrade: None,
            check_origin: None,
            on_connect: None,
            connection: ConnectionConfig::default(),
            hub: None,
            pool_size: DEFAULT_POOL_SIZE,
            disable_tracing: false,
        }
    }

    /// Build the axum application serving this server's endpoints: the
    /// upgrade path, `GET /healthz`, and `GET /metrics`. Useful on its own
    /// for embedding into an existing router; [`Server::start`] serves it.
    pub fn router<H, Fut>(&self, handler: H) -> Router
    where
        H: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ConnectionHandler = Arc::new(move |conn| Box::pin(handler(conn)));
        let ctx = Arc::new(UpgradeCtx {
            state: self.state.clone(),
            handler,
        });

        let mut router = Router::new()
            .route(&self.state.path, any(upgrade))
            .route("/healthz", get(healthz))
            .route("/metrics", get(serve_metrics))
            .with_state(ctx);

        if !self.state.disable_tracing {
            let skip_paths = Arc::new(self.state.skip_paths.clone());
            router = router.layer(middleware::from_fn_with_state(skip_paths, trace_http));
        }
        router
    }

    /// Bind the listener and serve until [`Server::shutdown`]. Bind failures
    /// are fatal and returned immediately.
    pub async fn start<H, Fut>(&self, handler: H) -> Result<(), WsError>
    where
        H: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let app = self.router(handler);
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        self.started.store(true, Ordering::Release);
        info!(addr = %self.addr, "ws server starting");

        let shutdown = self.shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(WsError::from);

        let _ = self.exited.send(true);
        served
    }

    /// Close the owned hub (if any), stop accepting, and wait up to `grace`
    /// for in-flight connections to finish. On expiry returns
    /// [`WsError::DeadlineExceeded`] and leaves the workers to finish on
    /// their own.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), WsError> {
        if let Some(hub) = &self.state.hub {
            hub.close().await;
        }
        info!(addr = %self.addr, "ws server shutting down");
        self.shutdown.cancel();

        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut exited = self.exited.subscribe();
        let result = tokio::time::timeout(grace, exited.wait_for(|done| *done)).await;
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(WsError::DeadlineExceeded),
        }
    }
}

async fn healthz() -> &'static str {
    "OK"
}

async fn serve_metrics() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
        .into_response()
}

async fn trace_http(
    State(skip_paths): State<Arc<Vec<String>>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    if skip_paths.iter().any(|skipped| *skipped == path) {
        return next.run(request).await;
    }
    let span = tracing::info_span!(
        "http.request",
        method = %request.method(),
        path = %path,
        "otel.kind" = "server",
    );
    next.run(request).instrument(span).await
}

async fn upgrade(
    State(ctx): State<Arc<UpgradeCtx>>,
    parts: Parts,
    ws: WebSocketUpgrade,
) -> Response {
    // Recovery barrier: a panicking hook must not take the listener down.
    let verdict = catch_unwind(AssertUnwindSafe(|| run_upgrade_hooks(&ctx.state, &parts)));
    match verdict {
        Ok(Ok(())) => {}
        Ok(Err(response)) => return response,
        Err(_) => {
            error!(path = %parts.uri.path(), "panic in upgrade hook");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(ctx, parts, socket))
}

fn run_upgrade_hooks(state: &ServerState, parts: &Parts) -> Result<(), Response> {
    if let Some(hook) = &state.before_upgrade {
        if let Err(err) = hook(parts) {
            debug!(%err, path = %parts.uri.path(), "upgrade rejected");
            return Err((StatusCode::UNAUTHORIZED, err.to_string()).into_response());
        }
    }
    if let Some(hook) = &state.check_origin {
        if !hook(parts) {
            return Err((StatusCode::FORBIDDEN, "origin not allowed").into_response());
        }
    }
    Ok(())
}

async fn handle_socket(ctx: Arc<UpgradeCtx>, parts: Parts, socket: WebSocket) {
    let (sink, stream) = socket.split();

    let mut config = ctx.state.connection.clone();
    if ctx
        .state
        .skip_paths
        .iter()
        .any(|skipped| *skipped == parts.uri.path())
    {
        config.skip_observability = true;
    }
    let conn = Connection::new(Box::new(AxumSink(sink)), Box::new(AxumStream(stream)), config);
    debug!(path = %parts.uri.path(), conn = ?conn, "ws connection accepted");

    if let Some(hook) = &ctx.state.on_connect {
        match catch_unwind(AssertUnwindSafe(|| hook(&conn, &parts))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(%err, "on_connect rejected connection");
                conn.close();
                return;
            }
            Err(_) => {
                error!("panic in on_connect hook");
                conn.close();
                return;
            }
        }
    }

    let handler = ctx.handler.clone();
    let handler_conn = conn.clone();
    let submitted = ctx
        .state
        .pool
        .submit(async move {
            let served = AssertUnwindSafe(handler(handler_conn.clone()))
                .catch_unwind()
                .await;
            if served.is_err() {
                error!("panic in connection handler");
            }
            // The connection ends with its handler, panicking or not.
            handler_conn.close();
        })
        .await;
    if submitted.is_err() {
        debug!("worker pool rejected connection handler");
        conn.close();
    }
}
