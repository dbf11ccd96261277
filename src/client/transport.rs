//! Client-side transports.
//!
//! Both transports surface the same shape: an unbounded outbound frame
//! sender, an inbound frame receiver and a cancellation token that tears the
//! IO tasks down. The WebSocket transport speaks RFC 6455 through
//! tokio-tungstenite; the AJAX transport emulates a duplex stream over
//! stateless POSTs with a push loop and a one-in-flight poll loop.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::options::ClientUrls;
use crate::core::{Error, Result, SocketType};
use crate::tls::install_rustls_crypto_provider;

/// User agent pinned on every AJAX request; the server rejects a session
/// whose user agent changes between requests.
const AJAX_USER_AGENT: &str = concat!("glue-client/", env!("CARGO_PKG_VERSION"));

// AJAX body keys and poll replies, mirroring the server.
const AJAX_KEY_INIT: &str = "i";
const AJAX_KEY_POLL: &str = "o";
const AJAX_KEY_PUSH: &str = "u";
const AJAX_POLL_TIMEOUT_REPLY: &str = "t";
const AJAX_POLL_CLOSED_REPLY: &str = "c";

/// An established client connection, transport-agnostic.
pub(crate) struct ClientConn {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
    pub cancel: CancellationToken,
}

pub(crate) type ConnectFuture = Pin<Box<dyn Future<Output = Result<ClientConn>> + Send>>;

/// Transport boundary for the client runtime. The IO tasks live behind the
/// returned connection; the runtime owns state and policies.
pub(crate) trait ClientTransport: Send + Sync + 'static {
    fn kind(&self) -> SocketType;

    fn connect(&self, urls: &ClientUrls) -> ConnectFuture;
}

//#############################//
//### WebSocket transport   ###//
//#############################//

pub(crate) struct WebSocketTransport;

impl ClientTransport for WebSocketTransport {
    fn kind(&self) -> SocketType {
        SocketType::WebSocket
    }

    fn connect(&self, urls: &ClientUrls) -> ConnectFuture {
        let url = urls.ws.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|err| Error::transport("connect", err))?;
            let (mut sink, mut ws_rx) = stream.split();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
            let cancel = CancellationToken::new();

            let writer_cancel = cancel.clone();
            tokio::spawn(async move {
                use tokio_tungstenite::tungstenite::Message;
                loop {
                    tokio::select! {
                        data = out_rx.recv() => {
                            let Some(data) = data else { break };
                            if sink.send(Message::text(data)).await.is_err() {
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        _ = writer_cancel.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            });

            let reader_cancel = cancel.clone();
            tokio::spawn(async move {
                use tokio_tungstenite::tungstenite::Message;
                loop {
                    tokio::select! {
                        message = ws_rx.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                if in_tx.send(text.to_string()).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                reader_cancel.cancel();
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                debug!("websocket read failed: {err}");
                                reader_cancel.cancel();
                                break;
                            }
                        },
                        _ = reader_cancel.cancelled() => break,
                    }
                }
            });

            Ok(ClientConn {
                tx: out_tx,
                rx: in_rx,
                cancel,
            })
        })
    }
}

//#############################//
//### AJAX transport        ###//
//#############################//

pub(crate) struct AjaxTransport {
    http: reqwest::Client,
}

impl AjaxTransport {
    pub(crate) fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(AJAX_USER_AGENT)
            .build()
            .map_err(|err| Error::Config(err.to_string()))?;
        Ok(Self { http })
    }
}

impl ClientTransport for AjaxTransport {
    fn kind(&self) -> SocketType {
        SocketType::Ajax
    }

    fn connect(&self, urls: &ClientUrls) -> ConnectFuture {
        let url = urls.ajax.clone();
        let http = self.http.clone();
        Box::pin(async move {
            let response = http
                .post(&url)
                .body(AJAX_KEY_INIT)
                .send()
                .await
                .map_err(|err| Error::transport("ajax init", err))?;
            if !response.status().is_success() {
                return Err(Error::transport("ajax init", response.status()));
            }

            let body = response
                .text()
                .await
                .map_err(|err| Error::transport("ajax init", err))?;
            let (session_id, poll_token) = body
                .split_once('&')
                .ok_or_else(|| Error::Protocol(format!("invalid ajax init response: '{body}'")))?;
            let session_id = session_id.to_string();
            let mut poll_token = poll_token.to_string();

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
            let cancel = CancellationToken::new();

            // Push loop: one POST per outbound frame.
            let push_http = http.clone();
            let push_url = url.clone();
            let push_session = session_id.clone();
            let push_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        data = out_rx.recv() => {
                            let Some(data) = data else { break };
                            let body = format!("{AJAX_KEY_PUSH}{push_session}&{data}");
                            let sent = push_http.post(&push_url).body(body).send().await;
                            match sent {
                                Ok(response) if response.status().is_success() => {}
                                Ok(response) => {
                                    debug!(status = %response.status(), "ajax push rejected");
                                    push_cancel.cancel();
                                    break;
                                }
                                Err(err) => {
                                    debug!("ajax push failed: {err}");
                                    push_cancel.cancel();
                                    break;
                                }
                            }
                        }
                        _ = push_cancel.cancelled() => break,
                    }
                }
            });

            // Poll loop: exactly one poll in flight, token rotated on every
            // successful response.
            let poll_cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let body = format!("{AJAX_KEY_POLL}{session_id}&{poll_token}");
                    let response = tokio::select! {
                        response = http.post(&url).body(body).send() => response,
                        _ = poll_cancel.cancelled() => break,
                    };

                    let text = match response {
                        Ok(response) if response.status().is_success() => {
                            match response.text().await {
                                Ok(text) => text,
                                Err(err) => {
                                    debug!("ajax poll body failed: {err}");
                                    poll_cancel.cancel();
                                    break;
                                }
                            }
                        }
                        Ok(response) => {
                            debug!(status = %response.status(), "ajax poll rejected");
                            poll_cancel.cancel();
                            break;
                        }
                        Err(err) => {
                            debug!("ajax poll failed: {err}");
                            poll_cancel.cancel();
                            break;
                        }
                    };

                    match text.as_str() {
                        AJAX_POLL_TIMEOUT_REPLY => continue,
                        AJAX_POLL_CLOSED_REPLY => {
                            poll_cancel.cancel();
                            break;
                        }
                        _ => match text.split_once('&') {
                            Some((next_token, frame)) => {
                                poll_token = next_token.to_string();
                                if in_tx.send(frame.to_string()).is_err() {
                                    break;
                                }
                            }
                            None => {
                                debug!("invalid ajax poll response: '{text}'");
                                poll_cancel.cancel();
                                break;
                            }
                        },
                    }
                }
            });

            Ok(ClientConn {
                tx: out_tx,
                rx: in_rx,
                cancel,
            })
        })
    }
}
