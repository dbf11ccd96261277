//! Named sub-streams multiplexed over a single socket.
//!
//! Each channel owns a small inbound queue and at most one active drainer: a
//! blocking [`Channel::read`], an [`Channel::on_read`] handler task or a
//! [`Channel::discard_read`] task. Installing a handler cancels the previous
//! one.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::core::protocol::CMD_CHANNEL_DATA;
use crate::core::types::panic_message;
use crate::core::values::marshal_values;
use crate::core::{Error, Result};
use crate::socket::Socket;

/// The channel buffer size for received data: small enough to push back on
/// pathological producers, large enough to smooth bursts. If nothing drains
/// the queue, the socket's read loop blocks and the keep-alive mechanism
/// eventually closes the socket.
const READ_QUEUE_SIZE: usize = 7;

/// A separate communication channel on top of a socket.
pub struct Channel {
    socket: Weak<Socket>,
    name: String,
    closed: CancellationToken,

    read_tx: mpsc::Sender<String>,
    read_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    handler: Mutex<Option<CancellationToken>>,
}

impl Channel {
    pub(crate) fn new(socket: Weak<Socket>, name: String, closed: CancellationToken) -> Arc<Self> {
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_SIZE);
        Arc::new(Self {
            socket,
            name,
            closed,
            read_tx,
            read_rx: Arc::new(tokio::sync::Mutex::new(read_rx)),
            handler: Mutex::new(None),
        })
    }

    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The channel's socket, if it is still alive.
    pub fn socket(&self) -> Option<Arc<Socket>> {
        self.socket.upgrade()
    }

    /// Write data to this channel.
    pub async fn write(&self, data: &str) {
        let Some(socket) = self.socket.upgrade() else {
            return;
        };
        let frame = format!("{CMD_CHANNEL_DATA}{}", marshal_values(&self.name, data));
        socket.write_raw(frame).await;
    }

    /// Read the next message from the channel.
    ///
    /// Blocks until a message arrives, the socket closes
    /// ([`Error::SocketClosed`]) or the optional timeout elapses
    /// ([`Error::ReadTimeout`]). Use either `read` or `on_read`, not both.
    pub async fn read(&self, timeout: Option<Duration>) -> Result<String> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        let mut read_rx = tokio::select! {
            guard = self.read_rx.lock() => guard,
            _ = self.closed.cancelled() => return Err(Error::SocketClosed),
            _ = sleep_until_opt(deadline) => return Err(Error::ReadTimeout),
        };

        tokio::select! {
            data = read_rx.recv() => data.ok_or(Error::SocketClosed),
            _ = self.closed.cancelled() => Err(Error::SocketClosed),
            _ = sleep_until_opt(deadline) => Err(Error::ReadTimeout),
        }
    }

    /// Install a read handler for this channel, replacing (and stopping) any
    /// previous handler. The handler runs in its own task until the socket
    /// closes or another handler takes over; panics in `f` are logged.
    pub fn on_read(&self, mut f: impl FnMut(String) + Send + 'static) {
        let name = self.name.clone();
        self.install_handler(move |data| {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(data))) {
                error!(
                    channel = %name,
                    "panic while calling on-read function: {}",
                    panic_message(panic.as_ref())
                );
            }
        });
    }

    /// Ignore and discard all data received on this channel.
    ///
    /// Call this during initialization if the channel is write-only. If
    /// received data is neither read nor discarded, the read buffer fills,
    /// the socket's read loop blocks and the keep-alive timeout closes the
    /// socket.
    pub fn discard_read(&self) {
        self.install_handler(|_data| {});
    }

    fn install_handler(&self, mut f: impl FnMut(String) + Send + 'static) {
        let cancel = CancellationToken::new();
        let previous = self.handler.lock().replace(cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let read_rx = self.read_rx.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            // The queue receiver is shared with blocking reads and previous
            // handlers; the replaced handler releases it on cancellation.
            let mut read_rx = tokio::select! {
                guard = read_rx.lock() => guard,
                _ = cancel.cancelled() => return,
                _ = closed.cancelled() => return,
            };

            loop {
                tokio::select! {
                    data = read_rx.recv() => {
                        let Some(data) = data else { return };
                        f(data);
                    }
                    _ = cancel.cancelled() => return,
                    _ = closed.cancelled() => return,
                }
            }
        });
    }

    /// Deliver inbound data to this channel's queue. Blocks when the queue
    /// is full, which intentionally stalls the socket's read loop.
    pub(crate) async fn trigger_read(&self, data: String) {
        tokio::select! {
            _ = self.read_tx.send(data) => {}
            _ = self.closed.cancelled() => {}
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
