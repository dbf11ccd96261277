//! Reusable test utilities for exercising sockets without a real transport.
//!
//! [`memory_backend_pair`] builds a backend stream backed by in-memory
//! channels plus a [`MemoryPeer`] handle that plays the client side of the
//! wire protocol. [`connect_memory`] attaches such a backend to a [`Server`]
//! so protocol tests can drive a full socket deterministically.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::closer::Closer;
use crate::core::types::{READ_QUEUE_SIZE, WRITE_QUEUE_SIZE};
use crate::core::SocketType;
use crate::server::Server;
use crate::transport::BackendSocket;

/// A backend stream backed by in-memory channels.
pub struct MemoryBackend {
    remote_addr: String,
    user_agent: String,
    write_tx: mpsc::Sender<String>,
    read_rx: Mutex<Option<mpsc::Receiver<String>>>,
    closer: Closer,
}

/// The peer (client) side of a [`MemoryBackend`].
pub struct MemoryPeer {
    backend: Arc<MemoryBackend>,
    to_server: mpsc::Sender<String>,
    from_server: mpsc::Receiver<String>,
    closed: CancellationToken,
}

/// Build a backend + peer control pair.
pub fn memory_backend_pair() -> (Arc<MemoryBackend>, MemoryPeer) {
    memory_backend_pair_with("127.0.0.1", "memory-peer")
}

/// Build a backend + peer control pair with explicit request metadata.
pub fn memory_backend_pair_with(
    remote_addr: &str,
    user_agent: &str,
) -> (Arc<MemoryBackend>, MemoryPeer) {
    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
    let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_SIZE);

    let backend = Arc::new(MemoryBackend {
        remote_addr: remote_addr.to_string(),
        user_agent: user_agent.to_string(),
        write_tx,
        read_rx: Mutex::new(Some(read_rx)),
        closer: Closer::new(|| {}),
    });

    let peer = MemoryPeer {
        backend: backend.clone(),
        to_server: read_tx,
        from_server: write_rx,
        closed: backend.closed(),
    };

    (backend, peer)
}

/// Attach a fresh memory backend to `server` and return the peer handle.
///
/// The socket appears in the server registry immediately; the init handshake
/// still has to be driven through the returned peer.
pub fn connect_memory(server: &Server) -> MemoryPeer {
    let (backend, peer) = memory_backend_pair();
    server.inner.handle_new_connection(backend);
    peer
}

impl MemoryPeer {
    /// Push a frame into the socket's read queue, as if the client had sent
    /// it. Blocks when the bounded queue is full.
    pub async fn send_frame(&self, frame: impl Into<String>) -> bool {
        tokio::select! {
            res = self.to_server.send(frame.into()) => res.is_ok(),
            _ = self.closed.cancelled() => false,
        }
    }

    /// Receive the next frame the socket wrote to the wire.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.from_server.recv().await
    }

    /// Receive a frame with a timeout.
    pub async fn recv_frame_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.from_server.recv())
            .await
            .unwrap_or_default()
    }

    /// Close the connection from the peer side.
    pub fn close(&self) {
        self.backend.close();
    }

    /// Token cancelled once the backend closes.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl BackendSocket for MemoryBackend {
    fn socket_type(&self) -> SocketType {
        SocketType::WebSocket
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn user_agent(&self) -> String {
        self.user_agent.clone()
    }

    fn write_queue(&self) -> mpsc::Sender<String> {
        self.write_tx.clone()
    }

    fn take_read_queue(&self) -> Option<mpsc::Receiver<String>> {
        self.read_rx.lock().take()
    }

    fn closed(&self) -> CancellationToken {
        self.closer.closed_signal()
    }

    fn close(&self) {
        self.closer.close();
    }

    fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}
