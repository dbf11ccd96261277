//! Client options and endpoint URL derivation.

use std::time::Duration;

use crate::core::{Error, Result, SocketType};

/// Options for a [`Client`](crate::client::Client), mirroring the server's
/// expectations. All durations have sane defaults; the host is mandatory.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server host, starting with `http://` or `https://`. The WebSocket
    /// scheme is derived automatically.
    pub host: String,

    /// Base URL of the socket endpoints. Coerced to a leading and trailing
    /// slash. Default: `/glue/`.
    pub base_url: String,

    /// Force a specific transport instead of auto-detection with fallback.
    pub force_socket_type: Option<SocketType>,

    /// Timeout for a single connect attempt, handshake included.
    /// Default: 10 s.
    pub connect_timeout: Duration,

    /// Idle interval after which the client sends its own ping. Kept larger
    /// than the server's ping period so the server normally initiates
    /// keep-alive. Default: 35 s.
    pub ping_interval: Duration,

    /// Reconnect if no frame arrives within this window after a client ping.
    /// Default: 5 s.
    pub ping_reconnect_timeout: Duration,

    /// Automatically reconnect after a lost connection. Default: true.
    pub reconnect: bool,

    /// Base reconnect delay; the effective delay is
    /// `min(reconnect_delay * attempt, reconnect_delay_max)`. Default: 1 s.
    pub reconnect_delay: Duration,

    /// Upper bound for the reconnect delay, coerced to at least
    /// `reconnect_delay`. Default: 5 s.
    pub reconnect_delay_max: Duration,

    /// Maximum reconnect attempts per disconnect; 0 means endless.
    /// Default: 10.
    pub reconnect_attempts: u32,

    /// How long sends are buffered across a disconnect before the buffer is
    /// discarded. Default: 10 s.
    pub reset_send_buffer_timeout: Duration,
}

impl ClientOptions {
    /// Options for the given host with all defaults.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            base_url: "/glue/".to_string(),
            force_socket_type: None,
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(35),
            ping_reconnect_timeout: Duration::from_secs(5),
            reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(5),
            reconnect_attempts: 10,
            reset_send_buffer_timeout: Duration::from_secs(10),
        }
    }

    pub(crate) fn normalize(&mut self) -> Result<()> {
        if !self.host.starts_with("http://") && !self.host.starts_with("https://") {
            return Err(Error::Config(format!(
                "host must start with http:// or https://: '{}'",
                self.host
            )));
        }
        while self.host.ends_with('/') {
            self.host.pop();
        }

        if self.base_url.is_empty() {
            self.base_url = "/glue/".to_string();
        }
        if !self.base_url.starts_with('/') {
            self.base_url.insert(0, '/');
        }
        if !self.base_url.ends_with('/') {
            self.base_url.push('/');
        }

        if self.reconnect_delay_max < self.reconnect_delay {
            self.reconnect_delay_max = self.reconnect_delay;
        }

        Ok(())
    }

    pub(crate) fn urls(&self) -> ClientUrls {
        let http_base = format!("{}{}", self.host, self.base_url);
        let ws_host = if let Some(rest) = self.host.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            let rest = self.host.strip_prefix("http://").unwrap_or(&self.host);
            format!("ws://{rest}")
        };

        ClientUrls {
            ws: format!("{}{}ws", ws_host, self.base_url),
            ajax: format!("{http_base}ajax"),
        }
    }
}

/// Concrete endpoint URLs derived from the options.
#[derive(Debug, Clone)]
pub(crate) struct ClientUrls {
    pub ws: String,
    pub ajax: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_hosts_without_http_scheme() {
        for bad in ["ws://example.com", "example.com", "ftp://example.com", ""] {
            let mut opts = ClientOptions::new(bad);
            assert!(opts.normalize().is_err(), "host '{bad}'");
        }
    }

    #[test]
    fn derives_endpoint_urls() {
        let mut opts = ClientOptions::new("http://example.com:8080/");
        opts.normalize().unwrap();
        let urls = opts.urls();
        assert_eq!(urls.ws, "ws://example.com:8080/glue/ws");
        assert_eq!(urls.ajax, "http://example.com:8080/glue/ajax");

        let mut opts = ClientOptions::new("https://example.com");
        opts.base_url = "sockets".to_string();
        opts.normalize().unwrap();
        let urls = opts.urls();
        assert_eq!(urls.ws, "wss://example.com/sockets/ws");
        assert_eq!(urls.ajax, "https://example.com/sockets/ajax");
    }

    #[test]
    fn coerces_reconnect_delay_max() {
        let mut opts = ClientOptions::new("http://example.com");
        opts.reconnect_delay = Duration::from_secs(8);
        opts.reconnect_delay_max = Duration::from_secs(5);
        opts.normalize().unwrap();
        assert_eq!(opts.reconnect_delay_max, Duration::from_secs(8));
    }
}
