//! Client runtime: transport selection with fallback, reconnect loop, send
//! buffering, event emission and the channel multiplexer.
//!
//! The runtime owns one connection at a time. A connect cycle task drives
//! the state machine from disconnected through connecting or reconnecting to
//! connected; the session loop inside it handles frames and the keep-alive
//! timers. Application sends are buffered while no initialized connection
//! exists and flushed in FIFO order once the handshake completes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::protocol::{
    split_frame, ClientInitData, ServerInitData, CMD_CHANNEL_DATA, CMD_CLOSE,
    CMD_DONT_AUTO_RECONNECT, CMD_INIT, CMD_INVALID, CMD_PING, CMD_PONG, MAIN_CHANNEL_NAME,
    PROTOCOL_VERSION,
};
use crate::core::types::panic_message;
use crate::core::values::{marshal_values, unmarshal_values};
use crate::core::{Error, Result, SocketType};

mod events;
mod options;
mod send_buffer;
mod transport;

pub use events::ClientEvent;
pub use options::ClientOptions;

use send_buffer::{DiscardFn, SendBuffer};
use transport::{AjaxTransport, ClientConn, ClientTransport, WebSocketTransport};

/// Pause between writing the close command and tearing the connection down,
/// so the frame has a chance to reach the server.
const CLOSE_FLUSH_PAUSE: Duration = Duration::from_millis(50);

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum SendStatus {
    /// Delivered to the active connection.
    Sent = 1,
    /// Queued in a send buffer, flushed once the connection is ready.
    Queued = 0,
    /// Dropped: the disconnect window's buffer timeout already fired.
    Discarded = -1,
}

impl SendStatus {
    /// Numeric return code: 1 sent, 0 queued, -1 discarded.
    pub fn code(self) -> i8 {
        self as i8
    }
}

/// Connection state surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
}

type MessageFn = Arc<dyn Fn(String) + Send + Sync>;

struct ActiveConn {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

struct RuntimeState {
    status: ClientStatus,
    /// Init handshake completed on the current connection.
    ready: bool,
    socket_id: Option<String>,
    connected_once: bool,
    last_success_kind: Option<SocketType>,
    auto_reconnect_disabled: bool,
    closed_by_user: bool,
    cycle_running: bool,
    /// Disconnect-window marker; buffer timers check it before firing.
    generation: u64,
    window_timer_armed: bool,
    buffer_discarded: bool,
    conn: Option<ActiveConn>,
    pre_ready: Vec<String>,
    send_buffer: SendBuffer,
}

struct ClientInner {
    opts: ClientOptions,
    urls: options::ClientUrls,
    events: events::EventEmitter,
    handlers: Mutex<HashMap<String, MessageFn>>,
    state: Mutex<RuntimeState>,
    ws_transport: WebSocketTransport,
    ajax_transport: AjaxTransport,
}

enum SessionEnd {
    UserClosed,
    DontReconnect,
    Lost,
}

enum FrameAction {
    Continue,
    DontReconnect,
}

/// A client socket connection with automatic reconnection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new client. The connection is established by
    /// [`Client::connect`].
    pub fn new(mut options: ClientOptions) -> Result<Client> {
        options.normalize()?;
        let urls = options.urls();

        Ok(Client {
            inner: Arc::new(ClientInner {
                opts: options,
                urls,
                events: events::EventEmitter::new(),
                handlers: Mutex::new(HashMap::new()),
                state: Mutex::new(RuntimeState {
                    status: ClientStatus::Disconnected,
                    ready: false,
                    socket_id: None,
                    connected_once: false,
                    last_success_kind: None,
                    auto_reconnect_disabled: false,
                    closed_by_user: false,
                    cycle_running: false,
                    generation: 0,
                    window_timer_armed: false,
                    buffer_discarded: false,
                    conn: None,
                    pre_ready: Vec::new(),
                    send_buffer: SendBuffer::default(),
                }),
                ws_transport: WebSocketTransport,
                ajax_transport: AjaxTransport::new()?,
            }),
        })
    }

    /// Start connecting. Returns immediately; progress is reported through
    /// events.
    pub fn connect(&self) {
        self.inner.start_cycle(false);
    }

    /// Re-enable auto-reconnect (after the server sent a don't-reconnect
    /// notice) and connect again.
    pub fn reconnect(&self) {
        self.inner.state.lock().auto_reconnect_disabled = false;
        self.inner.start_cycle(true);
    }

    /// Close the connection. Auto-reconnect stops until
    /// [`Client::connect`] or [`Client::reconnect`] is called again.
    pub fn close(&self) {
        let conn = {
            let mut state = self.inner.state.lock();
            state.closed_by_user = true;
            state.conn.take()
        };

        if let Some(conn) = conn {
            let _ = conn.tx.send(CMD_CLOSE.to_string());
            tokio::spawn(async move {
                time::sleep(CLOSE_FLUSH_PAUSE).await;
                conn.cancel.cancel();
            });
        }
    }

    /// Bind an event listener.
    pub fn on(&self, event: ClientEvent, f: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.events.on(event, f);
    }

    /// Current connection status.
    pub fn status(&self) -> ClientStatus {
        self.inner.state.lock().status
    }

    /// The socket id assigned by the server, once connected.
    pub fn socket_id(&self) -> Option<String> {
        self.inner.state.lock().socket_id.clone()
    }

    /// Send data on the main channel.
    pub fn send(&self, data: &str) -> SendStatus {
        self.inner.send_on_channel(MAIN_CHANNEL_NAME, data, None)
    }

    /// Send data on the main channel with a callback invoked if the send is
    /// discarded from the buffer.
    pub fn send_with_discard(
        &self,
        data: &str,
        on_discard: impl FnOnce(String) + Send + 'static,
    ) -> SendStatus {
        let payload = data.to_string();
        self.inner.send_on_channel(
            MAIN_CHANNEL_NAME,
            data,
            Some(Box::new(move || on_discard(payload))),
        )
    }

    /// Install the message handler for the main channel.
    pub fn on_message(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.channel(MAIN_CHANNEL_NAME).on_message(f);
    }

    /// Obtain a handle for the named channel, creating it on first use.
    pub fn channel(&self, name: &str) -> ClientChannel {
        ClientChannel {
            inner: self.inner.clone(),
            name: name.to_string(),
        }
    }
}

/// A named channel on a client socket.
#[derive(Clone)]
pub struct ClientChannel {
    inner: Arc<ClientInner>,
    name: String,
}

impl ClientChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send data on this channel.
    pub fn send(&self, data: &str) -> SendStatus {
        self.inner.send_on_channel(&self.name, data, None)
    }

    /// Send data with a discard callback.
    pub fn send_with_discard(
        &self,
        data: &str,
        on_discard: impl FnOnce(String) + Send + 'static,
    ) -> SendStatus {
        let payload = data.to_string();
        self.inner
            .send_on_channel(&self.name, data, Some(Box::new(move || on_discard(payload))))
    }

    /// Install the message handler for this channel, replacing any previous
    /// one.
    pub fn on_message(&self, f: impl Fn(String) + Send + Sync + 'static) {
        self.inner
            .handlers
            .lock()
            .insert(self.name.clone(), Arc::new(f));
    }
}

impl ClientInner {
    fn start_cycle(self: &Arc<Self>, manual: bool) {
        {
            let mut state = self.state.lock();
            if state.cycle_running {
                state.closed_by_user = false;
                return;
            }
            if !manual && state.auto_reconnect_disabled {
                return;
            }
            state.cycle_running = true;
            state.closed_by_user = false;
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.run_cycle().await });
    }

    async fn run_cycle(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        self.set_status(ClientStatus::Connecting);
        self.events.emit(ClientEvent::Connecting, "");

        loop {
            if self.state.lock().closed_by_user {
                break;
            }

            let kind = self.choose_transport(attempt);
            match time::timeout(self.opts.connect_timeout, self.open_session(kind)).await {
                Err(_) => {
                    self.teardown_conn();
                    self.events.emit(ClientEvent::ConnectTimeout, "");
                }
                Ok(Err(err)) => {
                    self.teardown_conn();
                    self.events.emit(ClientEvent::Error, &err.to_string());
                }
                Ok(Ok(conn)) => {
                    attempt = 0;
                    let end = self.run_session(conn).await;
                    self.teardown_conn();
                    match end {
                        SessionEnd::UserClosed => break,
                        SessionEnd::DontReconnect => {
                            self.state.lock().auto_reconnect_disabled = true;
                            break;
                        }
                        SessionEnd::Lost => {
                            self.events
                                .emit(ClientEvent::Error, "the connection was lost");
                            self.on_connection_lost();
                        }
                    }
                }
            }

            if !self.opts.reconnect {
                break;
            }
            {
                let state = self.state.lock();
                if state.auto_reconnect_disabled || state.closed_by_user {
                    break;
                }
            }

            attempt += 1;
            if self.opts.reconnect_attempts != 0 && attempt > self.opts.reconnect_attempts {
                break;
            }

            let delay = std::cmp::min(
                self.opts.reconnect_delay.saturating_mul(attempt),
                self.opts.reconnect_delay_max,
            );
            time::sleep(delay).await;

            if self.state.lock().closed_by_user {
                break;
            }
            self.set_status(ClientStatus::Reconnecting);
            self.events.emit(ClientEvent::Reconnecting, "");
        }

        {
            let mut state = self.state.lock();
            state.cycle_running = false;
            state.status = ClientStatus::Disconnected;
            state.ready = false;
        }
        self.events.emit(ClientEvent::Disconnected, "");
    }

    /// Pick the transport for this attempt: a forced type wins, a previously
    /// successful transport is sticky, and a client that never connected
    /// falls back to AJAX once more than one reconnect attempt was needed.
    fn choose_transport(&self, attempt: u32) -> SocketType {
        if let Some(forced) = self.opts.force_socket_type {
            return forced;
        }

        let state = self.state.lock();
        if state.connected_once {
            return state.last_success_kind.unwrap_or(SocketType::WebSocket);
        }
        if attempt >= 2 {
            return SocketType::Ajax;
        }
        SocketType::WebSocket
    }

    /// Open a transport connection and run the init handshake. The caller
    /// bounds the whole operation with the connect timeout.
    async fn open_session(self: &Arc<Self>, kind: SocketType) -> Result<ClientConn> {
        let transport: &dyn ClientTransport = match kind {
            SocketType::WebSocket => &self.ws_transport,
            SocketType::Ajax => &self.ajax_transport,
        };

        let mut conn = transport.connect(&self.urls).await?;

        {
            let mut state = self.state.lock();
            state.conn = Some(ActiveConn {
                tx: conn.tx.clone(),
                cancel: conn.cancel.clone(),
            });
        }

        let init = ClientInitData {
            version: PROTOCOL_VERSION.to_string(),
        };
        let payload =
            sonic_rs::to_string(&init).map_err(|err| Error::Handshake(err.to_string()))?;
        conn.tx
            .send(format!("{CMD_INIT}{payload}"))
            .map_err(|_| Error::SocketClosed)?;

        loop {
            let frame = conn.rx.recv().await.ok_or(Error::SocketClosed)?;
            let (cmd, payload) = match split_frame(&frame) {
                Ok(parts) => parts,
                Err(_) => continue,
            };
            match cmd {
                CMD_INIT => {
                    let data: ServerInitData = sonic_rs::from_str(payload).map_err(|err| {
                        Error::Handshake(format!("invalid init response: {err}"))
                    })?;
                    self.mark_ready(data.socket_id, kind);
                    return Ok(conn);
                }
                CMD_DONT_AUTO_RECONNECT => {
                    self.state.lock().auto_reconnect_disabled = true;
                    return Err(Error::Handshake(
                        "the server refused this protocol version".into(),
                    ));
                }
                CMD_PING => {
                    let _ = conn.tx.send(CMD_PONG.to_string());
                }
                _ => {}
            }
        }
    }

    /// The handshake completed: flush the buffers and go connected.
    fn mark_ready(self: &Arc<Self>, socket_id: String, kind: SocketType) {
        let (tx, frames) = {
            let mut state = self.state.lock();
            state.status = ClientStatus::Connected;
            state.ready = true;
            state.socket_id = Some(socket_id);
            state.connected_once = true;
            state.last_success_kind = Some(kind);
            state.generation += 1;
            state.window_timer_armed = false;
            state.buffer_discarded = false;

            let mut frames = state.send_buffer.drain_frames();
            frames.append(&mut state.pre_ready);

            let tx = state.conn.as_ref().map(|conn| conn.tx.clone());
            (tx, frames)
        };

        if let Some(tx) = tx {
            for frame in frames {
                let _ = tx.send(frame);
            }
        }

        self.events.emit(ClientEvent::Connected, "");
    }

    async fn run_session(self: &Arc<Self>, mut conn: ClientConn) -> SessionEnd {
        let cancel = conn.cancel.clone();
        let mut ping_deadline = Instant::now() + self.opts.ping_interval;
        let mut pong_deadline: Option<Instant> = None;

        let end = loop {
            tokio::select! {
                frame = conn.rx.recv() => {
                    let Some(frame) = frame else { break SessionEnd::Lost };

                    // Any inbound frame proves the server alive.
                    ping_deadline = Instant::now() + self.opts.ping_interval;
                    pong_deadline = None;

                    match self.handle_frame(&conn, &frame) {
                        FrameAction::Continue => {}
                        FrameAction::DontReconnect => break SessionEnd::DontReconnect,
                    }
                }
                _ = time::sleep_until(ping_deadline) => {
                    let _ = conn.tx.send(CMD_PING.to_string());
                    pong_deadline = Some(Instant::now() + self.opts.ping_reconnect_timeout);
                    ping_deadline = Instant::now() + self.opts.ping_interval;
                }
                _ = sleep_until_opt(pong_deadline) => {
                    self.events.emit(ClientEvent::Timeout, "");
                    break SessionEnd::Lost;
                }
                _ = cancel.cancelled() => break SessionEnd::Lost,
            }
        };

        conn.cancel.cancel();

        if self.state.lock().closed_by_user {
            return SessionEnd::UserClosed;
        }
        end
    }

    fn handle_frame(&self, conn: &ClientConn, frame: &str) -> FrameAction {
        let Ok((cmd, payload)) = split_frame(frame) else {
            warn!("received malformed frame: '{frame}'");
            return FrameAction::Continue;
        };

        match cmd {
            CMD_PING => {
                let _ = conn.tx.send(CMD_PONG.to_string());
            }
            CMD_PONG => {}
            CMD_INVALID => {
                self.events
                    .emit(ClientEvent::Error, "server reported an invalid command");
            }
            CMD_DONT_AUTO_RECONNECT => return FrameAction::DontReconnect,
            CMD_INIT => {
                // Already initialized; a duplicate init response is ignored.
            }
            CMD_CHANNEL_DATA => match unmarshal_values(payload) {
                Ok((name, data)) => self.dispatch_channel_data(name, data),
                Err(err) => {
                    self.events.emit(ClientEvent::Error, &err.to_string());
                }
            },
            _ => {
                warn!(cmd, "received unknown command");
            }
        }

        FrameAction::Continue
    }

    fn dispatch_channel_data(&self, name: &str, data: &str) {
        let handler = self.handlers.lock().get(name).cloned();
        match handler {
            Some(handler) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(data.to_string()))) {
                    error!(
                        channel = name,
                        "panic in message handler: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
            None => {
                debug!(channel = name, "dropping data for channel without handler");
            }
        }
    }

    fn send_on_channel(
        self: &Arc<Self>,
        name: &str,
        data: &str,
        discard: Option<DiscardFn>,
    ) -> SendStatus {
        let frame = format!("{CMD_CHANNEL_DATA}{}", marshal_values(name, data));

        let mut state = self.state.lock();

        if state.ready {
            if let Some(conn) = &state.conn {
                if conn.tx.send(frame.clone()).is_ok() {
                    return SendStatus::Sent;
                }
            }
            // The connection raced away; fall through to buffering.
            state.ready = false;
        }

        if state.conn.is_some() {
            // Transport is up but the handshake has not completed yet.
            state.pre_ready.push(frame);
            return SendStatus::Queued;
        }

        if state.buffer_discarded {
            drop(state);
            if let Some(discard) = discard {
                discard();
            }
            return SendStatus::Discarded;
        }

        state.send_buffer.push(frame, discard);
        let arm = if state.window_timer_armed {
            false
        } else {
            state.window_timer_armed = true;
            true
        };
        drop(state);

        if arm {
            self.arm_send_buffer_timer();
        }
        SendStatus::Queued
    }

    /// Discard the disconnect buffer once the reset timeout elapses without
    /// a reconnect. Fires at most once per disconnect window.
    fn arm_send_buffer_timer(self: &Arc<Self>) {
        let generation = self.state.lock().generation;
        let inner = self.clone();
        tokio::spawn(async move {
            time::sleep(inner.opts.reset_send_buffer_timeout).await;

            let entries = {
                let mut state = inner.state.lock();
                if state.generation != generation || state.ready {
                    return;
                }
                state.buffer_discarded = true;
                state.send_buffer.take_entries()
            };

            if entries.is_empty() {
                return;
            }

            inner.events.emit(ClientEvent::DiscardSendBuffer, "");
            for entry in entries {
                if let Some(discard) = entry.discard {
                    discard();
                }
            }
        });
    }

    fn on_connection_lost(&self) {
        let mut state = self.state.lock();
        state.ready = false;
        state.socket_id = None;
        state.conn = None;
        state.generation += 1;
        state.window_timer_armed = false;
        state.buffer_discarded = false;
    }

    fn teardown_conn(&self) {
        let conn = {
            let mut state = self.state.lock();
            state.ready = false;
            state.conn.take()
        };
        if let Some(conn) = conn {
            conn.cancel.cancel();
        }
    }

    fn set_status(&self, status: ClientStatus) {
        self.state.lock().status = status;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
