//! Server-side WebSocket backend.
//!
//! After the HTTP upgrade the connection is bridged onto the backend frame
//! queues by two tasks: a writer that drains the write queue onto the wire
//! and a reader that feeds inbound text frames into the read queue. Either
//! task fires the closer on its way out, which tears the other one down.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::closer::Closer;
use crate::core::types::{READ_QUEUE_SIZE, WRITE_QUEUE_SIZE};
use crate::core::SocketType;
use crate::transport::BackendSocket;

/// Time allowed to write a frame to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next frame from the peer. Reset by any inbound
/// traffic, pongs included.
const READ_WAIT: Duration = Duration::from_secs(60);

// Close codes that do not indicate a failure worth logging.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_NO_STATUS: u16 = 1005;

pub(crate) struct WebSocketBackend {
    remote_addr: String,
    user_agent: String,
    write_tx: mpsc::Sender<String>,
    read_rx: Mutex<Option<mpsc::Receiver<String>>>,
    closer: Closer,
}

impl WebSocketBackend {
    /// Bridge an upgraded socket onto the frame queues and start the IO
    /// tasks.
    pub(crate) fn spawn(ws: WebSocket, remote_addr: String, user_agent: String) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE_SIZE);

        let backend = Arc::new(Self {
            remote_addr,
            user_agent,
            write_tx,
            read_rx: Mutex::new(Some(read_rx)),
            closer: Closer::new(|| {}),
        });

        let (sink, stream) = ws.split();
        tokio::spawn(write_loop(backend.clone(), sink, write_rx));
        tokio::spawn(read_loop(backend.clone(), stream, read_tx));

        backend
    }
}

impl BackendSocket for WebSocketBackend {
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

async fn write_loop(
    backend: Arc<WebSocketBackend>,
    mut sink: SplitSink<WebSocket, Message>,
    mut write_rx: mpsc::Receiver<String>,
) {
    let closed = backend.closed();

    loop {
        tokio::select! {
            data = write_rx.recv() => {
                let Some(data) = data else { break };
                match time::timeout(WRITE_WAIT, sink.send(Message::Text(data))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(
                            remote_addr = %backend.remote_addr,
                            user_agent = %backend.user_agent,
                            "failed to write to websocket: {err}"
                        );
                        break;
                    }
                    Err(_) => {
                        warn!(
                            remote_addr = %backend.remote_addr,
                            user_agent = %backend.user_agent,
                            "websocket write deadline exceeded"
                        );
                        break;
                    }
                }
            }
            _ = closed.cancelled() => {
                // Tell the peer we are going away. Errors are irrelevant here.
                let close = Message::Close(Some(CloseFrame {
                    code: CLOSE_NORMAL,
                    reason: "".into(),
                }));
                let _ = time::timeout(WRITE_WAIT, sink.send(close)).await;
                return;
            }
        }
    }

    backend.close();
}

async fn read_loop(
    backend: Arc<WebSocketBackend>,
    mut stream: SplitStream<WebSocket>,
    read_tx: mpsc::Sender<String>,
) {
    let closed = backend.closed();

    loop {
        let msg = tokio::select! {
            next = time::timeout(READ_WAIT, stream.next()) => match next {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    if !backend.is_closed() {
                        warn!(
                            remote_addr = %backend.remote_addr,
                            user_agent = %backend.user_agent,
                            "failed to read from websocket: {err}"
                        );
                    }
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            },
            _ = closed.cancelled() => break,
        };

        let data = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(
                        remote_addr = %backend.remote_addr,
                        user_agent = %backend.user_agent,
                        "dropping non-UTF-8 binary websocket frame"
                    );
                    continue;
                }
            },
            // Pings are answered by the websocket layer; both variants still
            // count as inbound activity for the read deadline.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                let code = frame.as_ref().map(|f| f.code);
                let abnormal = !matches!(
                    code,
                    None | Some(CLOSE_NORMAL) | Some(CLOSE_GOING_AWAY) | Some(CLOSE_NO_STATUS)
                );
                if abnormal && !backend.is_closed() {
                    warn!(
                        remote_addr = %backend.remote_addr,
                        user_agent = %backend.user_agent,
                        close_code = ?code,
                        "websocket closed abnormally"
                    );
                }
                break;
            }
        };

        tokio::select! {
            res = read_tx.send(data) => {
                if res.is_err() {
                    break;
                }
            }
            _ = closed.cancelled() => break,
        }
    }

    backend.close();
}
