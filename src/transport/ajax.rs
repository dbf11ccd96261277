//! AJAX long-poll backend and its session manager.
//!
//! A session emulates a duplex stream over stateless POST requests. The body
//! starts with a one-character key (`i` init, `o` poll, `u` push) followed by
//! an optional value and, after a `&`, further payload. Outbound frames are
//! handed to whichever poll request is currently parked on the session;
//! inbound frames arrive via push requests. Every successful poll rotates
//! the session's poll token.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::closer::Closer;
use crate::core::types::{READ_QUEUE_SIZE, WRITE_QUEUE_SIZE};
use crate::core::values::random_string;
use crate::core::SocketType;
use crate::transport::BackendSocket;

/// How long a poll request is parked before answering with a timeout.
const POLL_TIMEOUT: Duration = Duration::from_secs(35);

const SESSION_ID_LENGTH: usize = 10;
const POLL_TOKEN_LENGTH: usize = 7;

/// Bound on session-id regeneration when the random id collides.
const MAX_ID_ATTEMPTS: usize = 10;

// Poll response commands.
const POLL_CMD_TIMEOUT: &str = "t";
const POLL_CMD_CLOSED: &str = "c";

// Request body layout.
const DATA_DELIMITER: char = '&';
const KEY_INIT: &str = "i";
const KEY_POLL: &str = "o";
const KEY_PUSH: &str = "u";

const BAD_REQUEST: (StatusCode, &str) = (StatusCode::BAD_REQUEST, "Bad Request");

type NewConnectionFn = Box<dyn Fn(Arc<AjaxBackend>) + Send + Sync>;

/// Server-side session map plus request handling for the AJAX transport.
pub(crate) struct AjaxServer {
    sessions: Mutex<HashMap<String, Arc<AjaxBackend>>>,
    on_new_connection: NewConnectionFn,
}

impl AjaxServer {
    pub(crate) fn new(on_new_connection: impl Fn(Arc<AjaxBackend>) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            on_new_connection: Box::new(on_new_connection),
        })
    }

    /// Handle one POST body. Returns the response status and body.
    pub(crate) async fn handle(
        self: &Arc<Self>,
        body: &str,
        remote_addr: &str,
        user_agent: &str,
    ) -> (StatusCode, String) {
        let (head, data) = match body.find(DATA_DELIMITER) {
            Some(i) => (&body[..i], &body[i + 1..]),
            None => (body, ""),
        };

        let Some(key) = head.get(..1) else {
            warn!(remote_addr, user_agent, head, "ajax: head data is too short");
            return owned(BAD_REQUEST);
        };
        let value = &head[1..];

        match key {
            KEY_INIT => self.init(remote_addr, user_agent),
            KEY_POLL => self.poll(value, data, remote_addr, user_agent).await,
            KEY_PUSH => self.push(value, data, remote_addr, user_agent).await,
            _ => {
                warn!(remote_addr, user_agent, key, value, "ajax: invalid request");
                owned(BAD_REQUEST)
            }
        }
    }

    /// Number of live sessions. Used by tests.
    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn init(self: &Arc<Self>, remote_addr: &str, user_agent: &str) -> (StatusCode, String) {
        // The session id is chosen under the map lock so it is unique at
        // insertion time. Collisions are regenerated, bounded so a broken
        // RNG cannot spin forever.
        let backend = {
            let mut sessions = self.sessions.lock();
            let mut session_id = None;
            for _ in 0..MAX_ID_ATTEMPTS {
                let candidate = random_string(SESSION_ID_LENGTH);
                if !sessions.contains_key(&candidate) {
                    session_id = Some(candidate);
                    break;
                }
            }
            let Some(session_id) = session_id else {
                warn!(remote_addr, user_agent, "ajax: failed to allocate a unique session id");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                );
            };

            let backend = Arc::new_cyclic(|weak: &Weak<AjaxBackend>| {
                let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
                let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_SIZE);

                let server = Arc::downgrade(self);
                let backend = weak.clone();
                let closer = Closer::new(move || {
                    if let (Some(server), Some(backend)) = (server.upgrade(), backend.upgrade()) {
                        server.sessions.lock().remove(&backend.session_id);
                    }
                });

                AjaxBackend {
                    session_id: session_id.clone(),
                    poll_token: Mutex::new(random_string(POLL_TOKEN_LENGTH)),
                    user_agent: user_agent.to_string(),
                    remote_addr: Mutex::new(remote_addr.to_string()),
                    closer,
                    write_tx,
                    write_rx: tokio::sync::Mutex::new(write_rx),
                    read_tx,
                    read_rx: Mutex::new(Some(read_rx)),
                    poll_abort: Notify::new(),
                }
            });

            sessions.insert(session_id, backend.clone());
            backend
        };

        let response = format!(
            "{}{}{}",
            backend.session_id,
            DATA_DELIMITER,
            backend.poll_token.lock()
        );

        (self.on_new_connection)(backend);

        (StatusCode::OK, response)
    }

    async fn push(
        self: &Arc<Self>,
        session_id: &str,
        data: &str,
        remote_addr: &str,
        user_agent: &str,
    ) -> (StatusCode, String) {
        let Some(backend) = self.session(session_id) else {
            warn!(remote_addr, user_agent, session_id, "ajax: push for unknown session");
            return owned(BAD_REQUEST);
        };

        if backend.user_agent != user_agent {
            warn!(remote_addr, user_agent, session_id, "ajax: push user agents do not match");
            return owned(BAD_REQUEST);
        }

        if data.is_empty() {
            warn!(remote_addr, user_agent, session_id, "ajax: push request with no data");
            return owned(BAD_REQUEST);
        }

        // The client might be behind a proxy whose egress address changed.
        *backend.remote_addr.lock() = remote_addr.to_string();

        let closed = backend.closed();
        tokio::select! {
            res = backend.read_tx.send(data.to_string()) => {
                if res.is_err() {
                    return owned(BAD_REQUEST);
                }
            }
            _ = closed.cancelled() => return owned(BAD_REQUEST),
        }

        (StatusCode::OK, String::new())
    }

    async fn poll(
        self: &Arc<Self>,
        session_id: &str,
        poll_token: &str,
        remote_addr: &str,
        user_agent: &str,
    ) -> (StatusCode, String) {
        let Some(backend) = self.session(session_id) else {
            warn!(remote_addr, user_agent, session_id, "ajax: poll for unknown session");
            return owned(BAD_REQUEST);
        };

        if backend.user_agent != user_agent {
            warn!(remote_addr, user_agent, session_id, "ajax: poll user agents do not match");
            return owned(BAD_REQUEST);
        }

        let new_token = {
            let mut token = backend.poll_token.lock();
            if *token != poll_token {
                warn!(remote_addr, user_agent, session_id, "ajax: poll tokens do not match");
                return owned(BAD_REQUEST);
            }
            *token = random_string(POLL_TOKEN_LENGTH);
            token.clone()
        };

        // Kick a previous poll off the session before parking on it; only one
        // poll may be in flight per session.
        backend.poll_abort.notify_waiters();
        let aborted = backend.poll_abort.notified();
        tokio::pin!(aborted);
        aborted.as_mut().enable();

        let closed = backend.closed();
        let mut write_rx = tokio::select! {
            guard = backend.write_rx.lock() => guard,
            _ = closed.cancelled() => return (StatusCode::OK, POLL_CMD_CLOSED.to_string()),
            _ = &mut aborted => return (StatusCode::OK, POLL_CMD_TIMEOUT.to_string()),
        };

        tokio::select! {
            data = write_rx.recv() => match data {
                Some(data) => (StatusCode::OK, format!("{new_token}{DATA_DELIMITER}{data}")),
                None => (StatusCode::OK, POLL_CMD_CLOSED.to_string()),
            },
            _ = closed.cancelled() => (StatusCode::OK, POLL_CMD_CLOSED.to_string()),
            _ = &mut aborted => (StatusCode::OK, POLL_CMD_TIMEOUT.to_string()),
            _ = time::sleep(POLL_TIMEOUT) => (StatusCode::OK, POLL_CMD_TIMEOUT.to_string()),
        }
    }

    fn session(&self, session_id: &str) -> Option<Arc<AjaxBackend>> {
        self.sessions.lock().get(session_id).cloned()
    }
}

fn owned((status, body): (StatusCode, &str)) -> (StatusCode, String) {
    (status, body.to_string())
}

/// One AJAX session, exposed to the socket core as a backend stream.
pub(crate) struct AjaxBackend {
    session_id: String,
    poll_token: Mutex<String>,
    user_agent: String,
    remote_addr: Mutex<String>,

    closer: Closer,

    write_tx: mpsc::Sender<String>,
    write_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    read_tx: mpsc::Sender<String>,
    read_rx: Mutex<Option<mpsc::Receiver<String>>>,

    poll_abort: Notify,
}


impl BackendSocket for AjaxBackend {
    fn socket_type(&self) -> SocketType {
        SocketType::Ajax
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.lock().clone()
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
