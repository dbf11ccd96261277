use thiserror::Error;

/// Convenience result alias for socket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical error surface shared across the library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("the socket connection is closed")]
    SocketClosed,

    #[error("the read timeout was reached")]
    ReadTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn transport(context: &'static str, err: impl ToString) -> Self {
        Error::Transport {
            context,
            error: err.to_string(),
        }
    }
}

/// The backend transport variant a socket is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    WebSocket,
    Ajax,
}

impl SocketType {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketType::WebSocket => "websocket",
            SocketType::Ajax => "ajax",
        }
    }
}

/// Best-effort extraction of a panic payload for logging.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

// Backend frame queue capacities. The read queue is deliberately small so an
// undrained channel pushes back on the read loop instead of growing without
// bound; the write queue smooths bursts from application writers.
pub(crate) const READ_QUEUE_SIZE: usize = 5;
pub(crate) const WRITE_QUEUE_SIZE: usize = 10;
