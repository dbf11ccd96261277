//! Wire-level protocol constants, frame helpers and version negotiation.
//!
//! A frame is a text string of the form `<2-char command><payload>`. The
//! protocol version follows semantic versioning; compatibility is negotiated
//! during the init handshake before a socket becomes usable.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::types::{Error, Result};

/// The Glue Socket Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// Socket commands. Must be two characters long.
pub(crate) const CMD_LEN: usize = 2;
pub(crate) const CMD_INIT: &str = "in";
pub(crate) const CMD_PING: &str = "pi";
pub(crate) const CMD_PONG: &str = "po";
pub(crate) const CMD_CLOSE: &str = "cl";
pub(crate) const CMD_INVALID: &str = "iv";
pub(crate) const CMD_DONT_AUTO_RECONNECT: &str = "dr";
pub(crate) const CMD_CHANNEL_DATA: &str = "cd";

/// The implicitly created default channel.
pub(crate) const MAIN_CHANNEL_NAME: &str = "m";

/// Split a frame into its command prefix and payload.
pub(crate) fn split_frame(frame: &str) -> Result<(&str, &str)> {
    match frame.get(..CMD_LEN) {
        Some(cmd) => Ok((cmd, &frame[CMD_LEN..])),
        None => Err(Error::Protocol(format!("frame too short: '{frame}'"))),
    }
}

/// Init payload sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ClientInitData {
    pub version: String,
}

/// Init payload the server answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ServerInitData {
    #[serde(rename = "socketID")]
    pub socket_id: String,
}

/// A parsed semantic protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl ProtocolVersion {
    /// Whether a client speaking `client` may talk to a server speaking
    /// `self`. The major versions must match and the client must not be
    /// newer than the server within that major.
    pub fn supports_client(&self, client: &ProtocolVersion) -> bool {
        if client.major != self.major {
            return false;
        }
        if client.minor > self.minor {
            return false;
        }
        !(client.minor == self.minor && client.patch > self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let mut next = |name: &str| -> Result<u64> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::Protocol(format!("invalid {name} version in '{s}'")))
        };

        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(Error::Protocol(format!("invalid protocol version: '{s}'")));
        }

        Ok(ProtocolVersion {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The parsed version of [`PROTOCOL_VERSION`].
pub(crate) fn server_version() -> &'static ProtocolVersion {
    static VERSION: OnceLock<ProtocolVersion> = OnceLock::new();
    VERSION.get_or_init(|| {
        PROTOCOL_VERSION
            .parse()
            .expect("crate version is a valid protocol version")
    })
}
