//! Robust bidirectional socket library.
//!
//! A [`Server`] exposes one HTTP base URL multiplexing two transports (a
//! WebSocket upgrade and an AJAX long-poll fallback) behind a single
//! transport-agnostic [`Socket`] abstraction with keep-alive, named
//! [`Channel`]s and graceful close propagation. The matching [`Client`]
//! reconnects with backoff, buffers sends across disconnects and mirrors the
//! channel multiplexer.
//!
//! ```no_run
//! use glue::{Server, ServerOptions};
//!
//! # async fn run() -> glue::Result<()> {
//! let server = Server::new(ServerOptions {
//!     listen_address: "127.0.0.1:8080".to_string(),
//!     ..Default::default()
//! })?;
//!
//! server.on_new_socket(|socket| {
//!     let echo = socket.clone();
//!     socket.on_read(move |data| {
//!         let echo = echo.clone();
//!         tokio::spawn(async move { echo.write(&data).await });
//!     });
//! });
//!
//! server.run().await
//! # }
//! ```

pub mod client;
pub(crate) mod core;
pub mod server;
pub mod testing;
pub mod transport;

mod channel;
mod socket;
mod tls;

pub use crate::channel::Channel;
pub use crate::client::{Client, ClientChannel, ClientEvent, ClientOptions, ClientStatus, SendStatus};
pub use crate::core::{
    marshal_values, unmarshal_values, Error, ProtocolVersion, Result, SocketType, PROTOCOL_VERSION,
};
pub use crate::server::{CheckOriginFn, HttpSocketType, Server, ServerHandle, ServerOptions};
pub use crate::socket::Socket;
