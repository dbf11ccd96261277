//! Backend stream abstraction.
//!
//! A backend socket is a bidirectional text-frame transport with a close
//! signal. The socket core is written against this trait only; the WebSocket
//! and AJAX implementations below convert their native request/stream shapes
//! into the same pair of bounded frame queues.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::SocketType;

pub(crate) mod ajax;
pub(crate) mod websocket;

/// A single backend connection to one client.
///
/// A frame is a complete application-level string; neither side performs
/// fragmentation. The write queue is bounded (capacity 10) and drained by a
/// single transport writer; the read queue is bounded (capacity 5) and
/// consumed exactly once by the socket core's read loop.
pub trait BackendSocket: Send + Sync + 'static {
    fn socket_type(&self) -> SocketType;

    fn remote_addr(&self) -> String;

    fn user_agent(&self) -> String;

    /// Producer end of the outbound frame queue.
    fn write_queue(&self) -> mpsc::Sender<String>;

    /// Consumer end of the inbound frame queue. Yields `Some` exactly once.
    fn take_read_queue(&self) -> Option<mpsc::Receiver<String>>;

    /// Token cancelled when this connection closes.
    fn closed(&self) -> CancellationToken;

    fn close(&self);

    fn is_closed(&self) -> bool;
}
