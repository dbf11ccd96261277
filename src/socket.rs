//! Transport-agnostic socket core.
//!
//! A socket binds one backend stream and owns the keep-alive state machine,
//! the command dispatcher, the init handshake and the named-channel registry.
//! Each socket runs three long-lived tasks: the read loop, the ping loop and
//! the ping-timeout watcher. All of them select on the closed signal.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::channel::Channel;
use crate::core::protocol::{
    split_frame, server_version, ClientInitData, ProtocolVersion, ServerInitData, CMD_CHANNEL_DATA,
    CMD_CLOSE, CMD_DONT_AUTO_RECONNECT, CMD_INIT, CMD_INVALID, CMD_PING, CMD_PONG,
    MAIN_CHANNEL_NAME,
};
use crate::core::types::panic_message;
use crate::core::values::{random_string, unmarshal_values};
use crate::core::{Error, Result, SocketType};
use crate::server::ServerInner;
use crate::transport::BackendSocket;

/// Length of the random socket id.
const SOCKET_ID_LENGTH: usize = 20;

/// Bound on id regeneration when the random id collides in the registry.
const MAX_ID_ATTEMPTS: usize = 10;

/// Send a ping to the peer with this period.
pub(crate) const PING_PERIOD: Duration = Duration::from_secs(30);

/// Kill the socket if no pong arrives within this timeout.
pub(crate) const PING_RESPONSE_TIMEOUT: Duration = Duration::from_secs(7);

/// Pause before closing a rejected socket so the final frame flushes.
const REJECT_FLUSH_PAUSE: Duration = Duration::from_secs(1);

struct PingState {
    /// A ping was sent and its pong is still outstanding. Guarded together
    /// with the timer deadlines so concurrent ping requests collapse into
    /// one.
    request_active: bool,
    ping_deadline: watch::Sender<Instant>,
    pong_deadline: watch::Sender<Option<Instant>>,
}

/// A single socket connection to one client.
pub struct Socket {
    server: Weak<ServerInner>,
    backend: Arc<dyn BackendSocket>,

    id: String,
    initialized: Mutex<InitPhase>,

    channels: Mutex<HashMap<String, Arc<Channel>>>,
    main_channel: Mutex<Option<Arc<Channel>>>,

    /// Placeholder for custom per-socket data.
    value: Mutex<Option<Arc<dyn Any + Send + Sync>>>,

    write_tx: mpsc::Sender<String>,
    closed: CancellationToken,
    ping: Mutex<PingState>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum InitPhase {
    Pending,
    Started,
    Done,
}

impl Socket {
    /// Bind a backend stream, register the socket and start its tasks.
    ///
    /// Returns `None` when no unique id could be allocated; the backend is
    /// closed in that case.
    pub(crate) fn spawn(
        server: &Arc<ServerInner>,
        backend: Arc<dyn BackendSocket>,
    ) -> Option<Arc<Socket>> {
        let closed = backend.closed();
        let write_tx = backend.write_queue();
        let Some(read_rx) = backend.take_read_queue() else {
            backend.close();
            return None;
        };

        let (ping_deadline, ping_rx) = watch::channel(Instant::now() + PING_PERIOD);
        let (pong_deadline, pong_rx) = watch::channel(None);

        let socket = {
            let mut sockets = server.sockets.lock();
            let mut id = None;
            for _ in 0..MAX_ID_ATTEMPTS {
                let candidate = random_string(SOCKET_ID_LENGTH);
                if !sockets.contains_key(&candidate) {
                    id = Some(candidate);
                    break;
                }
            }
            let Some(id) = id else {
                drop(sockets);
                warn!(
                    remote_addr = %backend.remote_addr(),
                    "failed to allocate a unique socket id"
                );
                backend.close();
                return None;
            };

            let socket = Arc::new(Socket {
                server: Arc::downgrade(server),
                backend,
                id: id.clone(),
                initialized: Mutex::new(InitPhase::Pending),
                channels: Mutex::new(HashMap::new()),
                main_channel: Mutex::new(None),
                value: Mutex::new(None),
                write_tx,
                closed,
                ping: Mutex::new(PingState {
                    request_active: false,
                    ping_deadline,
                    pong_deadline,
                }),
            });
            sockets.insert(id, socket.clone());
            socket
        };

        let main = socket.channel(MAIN_CHANNEL_NAME);
        *socket.main_channel.lock() = Some(main);

        // Remove the socket from the registry as soon as it closes.
        tokio::spawn({
            let socket = socket.clone();
            async move {
                socket.closed.cancelled().await;
                if let Some(server) = socket.server.upgrade() {
                    server.sockets.lock().remove(&socket.id);
                }
            }
        });

        tokio::spawn(socket.clone().ping_timeout_loop(pong_rx));
        tokio::spawn(socket.clone().read_loop(read_rx));
        tokio::spawn(socket.clone().ping_loop(ping_rx));

        Some(socket)
    }

    /// The socket's unique id: a cryptographically secure random string.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Which backend transport this socket is bound to.
    pub fn socket_type(&self) -> SocketType {
        self.backend.socket_type()
    }

    /// Whether the init handshake completed and the on-new-socket callback
    /// returned.
    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock() == InitPhase::Done
    }

    pub fn remote_addr(&self) -> String {
        self.backend.remote_addr()
    }

    pub fn user_agent(&self) -> String {
        self.backend.user_agent()
    }

    /// Close the socket connection.
    pub fn close(&self) {
        self.backend.close();
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }

    /// Token cancelled once the socket is closed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Run `f` when the socket closes. Can be called multiple times to bind
    /// multiple functions; each runs in its own task with panic isolation.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        let closed = self.closed.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                error!(
                    "panic while calling on-close function: {}",
                    panic_message(panic.as_ref())
                );
            }
        });
    }

    /// Attach custom data to the socket.
    pub fn set_value<V: Any + Send + Sync>(&self, value: V) {
        *self.value.lock() = Some(Arc::new(value));
    }

    /// Retrieve previously attached data.
    pub fn value<V: Any + Send + Sync>(&self) -> Option<Arc<V>> {
        let value = self.value.lock().clone()?;
        value.downcast().ok()
    }

    /// Write data to the client on the main channel.
    pub async fn write(&self, data: &str) {
        if let Some(main) = self.main_channel() {
            main.write(data).await;
        }
    }

    /// Read the next message from the main channel. Blocks until a message
    /// arrives, the socket closes ([`Error::SocketClosed`]) or the optional
    /// timeout elapses ([`Error::ReadTimeout`]).
    pub async fn read(&self, timeout: Option<Duration>) -> Result<String> {
        match self.main_channel() {
            Some(main) => main.read(timeout).await,
            None => Err(Error::SocketClosed),
        }
    }

    /// Install a read handler on the main channel. Replaces any previous
    /// handler. Use either `on_read` or `read`, not both.
    pub fn on_read(&self, f: impl FnMut(String) + Send + 'static) {
        if let Some(main) = self.main_channel() {
            main.on_read(f);
        }
    }

    /// Discard all data received on the main channel. Call this during
    /// initialization if the socket is write-only; an undrained read buffer
    /// eventually stalls the keep-alive mechanism and closes the socket.
    pub fn discard_read(&self) {
        if let Some(main) = self.main_channel() {
            main.discard_read();
        }
    }

    /// Obtain the channel with the given name, creating it on first use.
    /// Repeated calls with the same name return the same channel.
    pub fn channel(self: &Arc<Self>, name: &str) -> Arc<Channel> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(name) {
            return channel.clone();
        }
        let channel = Channel::new(Arc::downgrade(self), name.to_string(), self.closed.clone());
        channels.insert(name.to_string(), channel.clone());
        channel
    }

    fn main_channel(&self) -> Option<Arc<Channel>> {
        self.main_channel.lock().clone()
    }

    //##########################//
    //### Internal machinery ###//
    //##########################//

    /// Enqueue a raw frame. Attempts a non-blocking enqueue first; a full
    /// queue triggers a liveness check before blocking, so a dead peer frees
    /// the writer within the pong timeout.
    pub(crate) async fn write_raw(&self, frame: String) {
        if self.closed.is_cancelled() {
            return;
        }

        match self.write_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.send_ping().await;
                tokio::select! {
                    _ = self.write_tx.send(frame) => {}
                    _ = self.closed.cancelled() => {}
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Send a ping request unless one is already outstanding. The pong
    /// timeout is armed before the write because the write queue may block.
    async fn send_ping(&self) {
        {
            let mut ping = self.ping.lock();
            if ping.request_active {
                return;
            }
            ping.request_active = true;
            let _ = ping
                .pong_deadline
                .send(Some(Instant::now() + PING_RESPONSE_TIMEOUT));
        }

        tokio::select! {
            _ = self.write_tx.send(CMD_PING.to_string()) => {}
            _ = self.closed.cancelled() => {}
        }
    }

    /// Any inbound frame proves the peer alive: clear the outstanding ping
    /// and rearm the ping timer.
    fn reset_ping_timeout(&self) {
        let mut ping = self.ping.lock();
        ping.request_active = false;
        let _ = ping.pong_deadline.send(None);
        let _ = ping.ping_deadline.send(Instant::now() + PING_PERIOD);
    }

    async fn ping_loop(self: Arc<Self>, mut ping_rx: watch::Receiver<Instant>) {
        loop {
            let deadline = *ping_rx.borrow_and_update();
            tokio::select! {
                changed = ping_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = time::sleep_until(deadline) => {
                    self.send_ping().await;
                    // The timer is one-shot; it rearms on the next inbound
                    // frame or not at all.
                    tokio::select! {
                        changed = ping_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = self.closed.cancelled() => return,
                    }
                }
                _ = self.closed.cancelled() => return,
            }
        }
    }

    async fn ping_timeout_loop(self: Arc<Self>, mut pong_rx: watch::Receiver<Option<Instant>>) {
        loop {
            let deadline = *pong_rx.borrow_and_update();
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        changed = pong_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = time::sleep_until(deadline) => {
                            // No pong within the timeout: the peer is dead.
                            self.backend.close();
                            return;
                        }
                        _ = self.closed.cancelled() => return,
                    }
                }
                None => {
                    tokio::select! {
                        changed = pong_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = self.closed.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut read_rx: mpsc::Receiver<String>) {
        loop {
            let data = tokio::select! {
                data = read_rx.recv() => data,
                _ = self.closed.cancelled() => return,
            };
            let Some(data) = data else { return };

            self.reset_ping_timeout();

            let (cmd, payload) = match split_frame(&data) {
                Ok(parts) => parts,
                Err(err) => {
                    warn!(
                        remote_addr = %self.remote_addr(),
                        user_agent = %self.user_agent(),
                        "handle received data: {err}"
                    );
                    continue;
                }
            };

            if let Err(err) = self.handle_read(cmd, payload).await {
                warn!(
                    remote_addr = %self.remote_addr(),
                    user_agent = %self.user_agent(),
                    cmd,
                    "handle received data: {err}"
                );
            }
        }
    }

    async fn handle_read(self: &Arc<Self>, cmd: &str, payload: &str) -> Result<()> {
        match cmd {
            CMD_PING => {
                self.write_raw(CMD_PONG.to_string()).await;
            }
            CMD_PONG => {
                // The keep-alive state was already reset.
            }
            CMD_CLOSE => {
                self.backend.close();
            }
            CMD_INIT => {
                self.handle_init(payload).await;
            }
            CMD_CHANNEL_DATA => {
                let (name, data) = unmarshal_values(payload)?;
                self.trigger_channel_read(name, data.to_string()).await?;
            }
            _ => {
                self.write_raw(CMD_INVALID.to_string()).await;
                return Err(Error::Protocol("received invalid socket command".into()));
            }
        }
        Ok(())
    }

    async fn trigger_channel_read(&self, name: &str, data: String) -> Result<()> {
        let channel = self.channels.lock().get(name).cloned();
        match channel {
            Some(channel) => {
                channel.trigger_read(data).await;
                Ok(())
            }
            None => Err(Error::Protocol(format!(
                "received data for channel '{name}': channel does not exist"
            ))),
        }
    }

    /// Run the init handshake. Only the first `in` frame is honored.
    async fn handle_init(self: &Arc<Self>, payload: &str) {
        {
            let mut phase = self.initialized.lock();
            if *phase != InitPhase::Pending {
                return;
            }
            *phase = InitPhase::Started;
        }

        let outcome = (|| -> std::result::Result<String, (bool, Error)> {
            let data: ClientInitData = sonic_rs::from_str(payload)
                .map_err(|err| (false, Error::Handshake(format!("invalid init data: {err}"))))?;

            let client: ProtocolVersion = data.version.parse().map_err(|_| {
                (
                    false,
                    Error::Handshake(format!(
                        "invalid client protocol version: '{}'",
                        data.version
                    )),
                )
            })?;

            if !server_version().supports_client(&client) {
                // The client should not automatically reconnect.
                return Err((
                    true,
                    Error::Handshake(format!(
                        "client socket protocol version is not supported: {}",
                        data.version
                    )),
                ));
            }

            let init = ServerInitData {
                socket_id: self.id.clone(),
            };
            sonic_rs::to_string(&init).map_err(|err| (false, Error::Handshake(err.to_string())))
        })();

        let json = match outcome {
            Ok(json) => json,
            Err((dont_auto_reconnect, err)) => {
                if dont_auto_reconnect {
                    self.write_raw(CMD_DONT_AUTO_RECONNECT.to_string()).await;
                    // Give the frame a chance to reach the client before the
                    // connection goes away.
                    time::sleep(REJECT_FLUSH_PAUSE).await;
                }
                self.close();
                warn!(
                    remote_addr = %self.remote_addr(),
                    user_agent = %self.user_agent(),
                    "init socket: {err}"
                );
                return;
            }
        };

        self.write_raw(format!("{CMD_INIT}{json}")).await;

        // Trigger the on-new-socket event function with panic isolation: one
        // buggy handler must not take the server down.
        if let Some(server) = self.server.upgrade() {
            let callback = server.on_new_socket_fn();
            let socket = self.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || callback(socket))) {
                self.close();
                error!(
                    "panic while calling on-new-socket function: {}",
                    panic_message(panic.as_ref())
                );
                return;
            }
        }

        *self.initialized.lock() = InitPhase::Done;
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("type", &self.socket_type())
            .field("remote_addr", &self.remote_addr())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}
