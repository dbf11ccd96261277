//! Minimal named-event emitter for the client runtime.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::core::types::panic_message;

/// Events emitted by the client. `Error` carries a message; the others carry
/// an empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
    ConnectTimeout,
    Timeout,
    DiscardSendBuffer,
}

impl ClientEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientEvent::Connecting => "connecting",
            ClientEvent::Connected => "connected",
            ClientEvent::Reconnecting => "reconnecting",
            ClientEvent::Disconnected => "disconnected",
            ClientEvent::Error => "error",
            ClientEvent::ConnectTimeout => "connect_timeout",
            ClientEvent::Timeout => "timeout",
            ClientEvent::DiscardSendBuffer => "discard_send_buffer",
        }
    }
}

type EventFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventEmitter {
    handlers: Mutex<HashMap<ClientEvent, Vec<EventFn>>>,
}

impl EventEmitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Bind a listener. Multiple listeners per event are supported.
    pub(crate) fn on(&self, event: ClientEvent, f: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .entry(event)
            .or_default()
            .push(Arc::new(f));
    }

    /// Invoke all listeners bound to `event`. Listener panics are logged,
    /// never propagated.
    pub(crate) fn emit(&self, event: ClientEvent, message: &str) {
        let listeners = match self.handlers.lock().get(&event) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(message))) {
                error!(
                    event = event.as_str(),
                    "panic in event listener: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}
