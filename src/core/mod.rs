// Canonical leaf definitions shared by the server, transports and client.
pub(crate) mod closer;
pub(crate) mod protocol;
pub(crate) mod types;
pub(crate) mod values;

pub use protocol::{ProtocolVersion, PROTOCOL_VERSION};
pub use types::{Error, Result, SocketType};
pub use values::{marshal_values, unmarshal_values};
