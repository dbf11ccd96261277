//! Server facade: socket registry, lifecycle and the HTTP surface.
//!
//! The facade owns the backend transports and exposes a single base URL with
//! two routes: `<base>ws` (GET, WebSocket upgrade) and `<base>ajax` (POST,
//! long-poll transport). New backend connections become sockets unless the
//! server is blocking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, UnixListener};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::values::{remote_address, user_agent};
use crate::core::{Error, Result};
use crate::socket::Socket;
use crate::transport::ajax::AjaxServer;
use crate::transport::websocket::WebSocketBackend;
use crate::transport::BackendSocket;

const WS_ROUTE_SUFFIX: &str = "ws";
const AJAX_ROUTE_SUFFIX: &str = "ajax";

/// Grace period in [`Server::release`] so in-flight new-socket handlers can
/// add themselves to the registry before everything is closed.
const RELEASE_GRACE: Duration = Duration::from_millis(200);

/// Which listener the HTTP server uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpSocketType {
    /// Don't run an HTTP server; the router is still available via
    /// [`Server::router`].
    None,
    #[default]
    Tcp,
    Unix,
}

/// Custom origin-check callback. Return `true` to accept the request.
pub type CheckOriginFn = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

type OnNewSocketFn = dyn Fn(Arc<Socket>) + Send + Sync;

/// Server options.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Which socket type to use for the HTTP server. Default: TCP.
    pub socket_type: HttpSocketType,

    /// The address to listen on: `host:port` for TCP (default `0.0.0.0:80`,
    /// a bare `:port` is accepted), a filesystem path for Unix.
    pub listen_address: String,

    /// Base URL handling socket requests. Coerced to a leading and trailing
    /// slash. Default: `/glue/`.
    pub handle_url: String,

    /// Reply with CORS headers echoing the request origin.
    pub enable_cors: bool,

    /// Custom origin check. When unset, requests are accepted if the Origin
    /// header is absent or shares its host with the request.
    pub check_origin: Option<CheckOriginFn>,
}

impl ServerOptions {
    fn normalize(&mut self) -> Result<()> {
        if self.listen_address.is_empty() {
            self.listen_address = match self.socket_type {
                HttpSocketType::Unix => {
                    return Err(Error::Config(
                        "a unix socket path must be configured".into(),
                    ))
                }
                _ => "0.0.0.0:80".to_string(),
            };
        }
        if self.socket_type != HttpSocketType::Unix && self.listen_address.starts_with(':') {
            self.listen_address = format!("0.0.0.0{}", self.listen_address);
        }

        if self.handle_url.is_empty() {
            self.handle_url = "/glue/".to_string();
        }
        if !self.handle_url.starts_with('/') {
            self.handle_url.insert(0, '/');
        }
        if !self.handle_url.ends_with('/') {
            self.handle_url.push('/');
        }

        Ok(())
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("socket_type", &self.socket_type)
            .field("listen_address", &self.listen_address)
            .field("handle_url", &self.handle_url)
            .field("enable_cors", &self.enable_cors)
            .field("check_origin", &self.check_origin.is_some())
            .finish()
    }
}

/// A server handling incoming socket connections.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    options: ServerOptions,
    pub(crate) sockets: Mutex<HashMap<String, Arc<Socket>>>,
    on_new_socket: RwLock<Arc<OnNewSocketFn>>,
    block: AtomicBool,
    ajax: Arc<AjaxServer>,
}

impl Server {
    /// Create a new server with the given options.
    pub fn new(mut options: ServerOptions) -> Result<Server> {
        options.normalize()?;

        let inner = Arc::new_cyclic(|weak: &Weak<ServerInner>| {
            let weak = weak.clone();
            let ajax = AjaxServer::new(move |backend| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_new_connection(backend);
                }
            });

            ServerInner {
                options,
                sockets: Mutex::new(HashMap::new()),
                on_new_socket: RwLock::new(Arc::new(|_socket| {})),
                block: AtomicBool::new(false),
                ajax,
            }
        });

        Ok(Server { inner })
    }

    /// Set the event function triggered once per initialized socket. The
    /// socket is added to the registry before this function is called; the
    /// function must not block.
    pub fn on_new_socket(&self, f: impl Fn(Arc<Socket>) + Send + Sync + 'static) {
        *self.inner.on_new_socket.write() = Arc::new(f);
    }

    /// Obtain a socket by its id.
    pub fn get_socket(&self, id: &str) -> Option<Arc<Socket>> {
        self.inner.sockets.lock().get(id).cloned()
    }

    /// A snapshot of all currently registered sockets. Sockets are
    /// registered before their init handshake completes; check
    /// [`Socket::is_initialized`] if that matters.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.inner.sockets.lock().values().cloned().collect()
    }

    /// Block or unblock new incoming connections.
    pub fn block(&self, block: bool) {
        self.inner.block.store(block, Ordering::SeqCst);
    }

    /// Block new connections and close every registered socket.
    pub async fn release(&self) {
        self.block(true);

        // Let in-flight new-socket handlers register themselves first.
        time::sleep(RELEASE_GRACE).await;

        for socket in self.sockets() {
            socket.close();
        }
    }

    /// The HTTP router serving `<handle_url>ws` and `<handle_url>ajax`.
    pub fn router(&self) -> Router {
        let base = &self.inner.options.handle_url;
        let state = AppState {
            inner: self.inner.clone(),
        };

        Router::new()
            .route(&format!("{base}{WS_ROUTE_SUFFIX}"), get(ws_handler))
            .route(&format!("{base}{AJAX_ROUTE_SUFFIX}"), any(ajax_handler))
            .with_state(state)
    }

    /// Start serving on a TCP listener and return a handle holding the bound
    /// address and a shutdown signal.
    pub async fn start(&self) -> Result<ServerHandle> {
        if self.inner.options.socket_type != HttpSocketType::Tcp {
            return Err(Error::Config(
                "start() requires the TCP socket type".into(),
            ));
        }

        let listener = TcpListener::bind(&self.inner.options.listen_address)
            .await
            .map_err(|err| Error::transport("listen", err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| Error::transport("listen", err))?;

        info!(addr = %local_addr, "socket server started");

        let router = self.router();
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(err) = serve.await {
                warn!("http server terminated: {err}");
            }
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    /// Run the server and listen for incoming socket connections. This
    /// method blocks.
    pub async fn run(&self) -> Result<()> {
        match self.inner.options.socket_type {
            HttpSocketType::None => {
                // No HTTP listener; sockets can still arrive through an
                // externally mounted router.
                std::future::pending::<()>().await;
                Ok(())
            }
            HttpSocketType::Tcp => {
                let handle = self.start().await?;
                handle
                    .task
                    .await
                    .map_err(|err| Error::transport("serve", err))
            }
            HttpSocketType::Unix => self.run_unix().await,
        }
    }

    async fn run_unix(&self) -> Result<()> {
        let listener = UnixListener::bind(&self.inner.options.listen_address)
            .map_err(|err| Error::transport("listen", err))?;

        info!(path = %self.inner.options.listen_address, "socket server started");

        let router = self.router();
        loop {
            let (stream, _addr) = listener
                .accept()
                .await
                .map_err(|err| Error::transport("accept", err))?;

            let service = TowerToHyperService::new(router.clone());
            tokio::spawn(async move {
                let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                if let Err(err) = conn.await {
                    debug!("unix connection terminated: {err}");
                }
            });
        }
    }
}

/// Handle for a started server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections and shut the listener down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the listener task to finish after [`ServerHandle::shutdown`].
    pub async fn drained(self) {
        let _ = self.task.await;
    }
}

impl ServerInner {
    pub(crate) fn handle_new_connection(self: &Arc<Self>, backend: Arc<dyn BackendSocket>) {
        if self.block.load(Ordering::SeqCst) {
            backend.close();
            return;
        }
        Socket::spawn(self, backend);
    }

    pub(crate) fn on_new_socket_fn(&self) -> Arc<OnNewSocketFn> {
        self.on_new_socket.read().clone()
    }

    fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        if let Some(check) = &self.options.check_origin {
            return check(headers);
        }

        let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return true;
        };
        let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
            return false;
        };

        let authority = origin
            .split_once("://")
            .map(|(_, rest)| rest.split('/').next().unwrap_or(rest))
            .unwrap_or(origin);
        authority.eq_ignore_ascii_case(host)
    }

    fn apply_cors(&self, headers: &HeaderMap, mut response: Response) -> Response {
        if self.options.enable_cors {
            if let Some(origin) = headers.get(header::ORIGIN) {
                response
                    .headers_mut()
                    .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
                response.headers_mut().insert(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("POST,GET"),
                );
            }
        }
        response
    }
}

#[derive(Clone)]
struct AppState {
    inner: Arc<ServerInner>,
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let inner = state.inner;

    if !inner.origin_allowed(&headers) {
        let response = (StatusCode::FORBIDDEN, "Forbidden").into_response();
        return inner.apply_cors(&headers, response);
    }

    let remote_addr = remote_address(&headers, connect_info.map(|info| info.0));
    let user_agent = user_agent(&headers);

    let upgrade_inner = inner.clone();
    let response = ws.on_upgrade(move |socket| async move {
        let backend = WebSocketBackend::spawn(socket, remote_addr, user_agent);
        upgrade_inner.handle_new_connection(backend);
    });

    inner.apply_cors(&headers, response)
}

async fn ajax_handler(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: String,
) -> Response {
    let inner = state.inner;

    if !inner.origin_allowed(&headers) {
        let response = (StatusCode::FORBIDDEN, "Forbidden").into_response();
        return inner.apply_cors(&headers, response);
    }

    let remote_addr = remote_address(&headers, connect_info.map(|info| info.0));
    let user_agent = user_agent(&headers);

    if method != Method::POST {
        warn!(
            remote_addr,
            user_agent,
            method = %method,
            "client accessed the ajax interface with an invalid http method"
        );
        let response = (StatusCode::BAD_REQUEST, "Bad Request").into_response();
        return inner.apply_cors(&headers, response);
    }

    let (status, body) = inner.ajax.handle(&body, &remote_addr, &user_agent).await;
    inner.apply_cors(&headers, (status, body).into_response())
}
