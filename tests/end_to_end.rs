//! Full-stack tests: a real HTTP server on a loopback port, driven by the
//! client runtime over both transports.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use glue::{
    Client, ClientEvent, ClientOptions, SendStatus, Server, ServerHandle, ServerOptions,
    SocketType,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_echo_server() -> (Server, ServerHandle, String) {
    let server = Server::new(ServerOptions {
        listen_address: "127.0.0.1:0".to_string(),
        ..Default::default()
    })
    .unwrap();

    server.on_new_socket(|socket| {
        let writer = socket.clone();
        socket.on_read(move |data| {
            let writer = writer.clone();
            tokio::spawn(async move {
                writer.write(&format!("echo:{data}")).await;
            });
        });
    });

    let handle = server.start().await.unwrap();
    let host = format!("http://{}", handle.local_addr());
    (server, handle, host)
}

fn fast_options(host: &str) -> ClientOptions {
    let mut opts = ClientOptions::new(host);
    opts.connect_timeout = Duration::from_secs(5);
    opts.reconnect_delay = Duration::from_millis(20);
    opts.reconnect_delay_max = Duration::from_millis(100);
    opts
}

/// Record the state events in arrival order.
fn track_events(client: &Client) -> Arc<Mutex<Vec<&'static str>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for (event, label) in [
        (ClientEvent::Connecting, "connecting"),
        (ClientEvent::Connected, "connected"),
        (ClientEvent::Reconnecting, "reconnecting"),
        (ClientEvent::Disconnected, "disconnected"),
    ] {
        let sink = events.clone();
        client.on(event, move |_| sink.lock().unwrap().push(label));
    }
    events
}

/// Subscribe to an event before triggering it.
fn event_signal(client: &Client, event: ClientEvent) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on(event, move |_| {
        let _ = tx.send(());
    });
    rx
}

async fn await_signal(rx: &mut mpsc::UnboundedReceiver<()>, what: &str) {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap();
}

#[tokio::test]
async fn websocket_echo_round_trip() {
    init_tracing();
    let (server, handle, host) = start_echo_server().await;

    let client = Client::new(fast_options(&host)).unwrap();
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<String>();
    client.on_message(move |data| {
        let _ = message_tx.send(data);
    });
    let mut connected = event_signal(&client, ClientEvent::Connected);

    client.connect();
    await_signal(&mut connected, "connected").await;

    assert_eq!(client.send("hello").code(), 1);
    let echoed = timeout(Duration::from_secs(10), message_rx.recv())
        .await
        .expect("echo reply")
        .unwrap();
    assert_eq!(echoed, "echo:hello");

    // The socket id the client learned resolves in the server registry.
    let socket_id = client.socket_id().expect("socket id");
    let socket = server.get_socket(&socket_id).expect("registered socket");
    assert_eq!(socket.socket_type(), SocketType::WebSocket);

    client.close();
    handle.shutdown();
}

#[tokio::test]
async fn ajax_echo_round_trip() {
    init_tracing();
    let (server, handle, host) = start_echo_server().await;

    let mut opts = fast_options(&host);
    opts.force_socket_type = Some(SocketType::Ajax);
    let client = Client::new(opts).unwrap();

    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<String>();
    client.on_message(move |data| {
        let _ = message_tx.send(data);
    });
    let mut connected = event_signal(&client, ClientEvent::Connected);

    client.connect();
    await_signal(&mut connected, "connected").await;

    assert_eq!(client.send("over-ajax").code(), 1);
    let echoed = timeout(Duration::from_secs(10), message_rx.recv())
        .await
        .expect("echo reply")
        .unwrap();
    assert_eq!(echoed, "echo:over-ajax");

    let socket_id = client.socket_id().expect("socket id");
    let socket = server.get_socket(&socket_id).expect("registered socket");
    assert_eq!(socket.socket_type(), SocketType::Ajax);

    client.close();
    handle.shutdown();
}

#[tokio::test]
async fn channels_stay_separate_end_to_end() {
    init_tracing();
    let server = Server::new(ServerOptions {
        listen_address: "127.0.0.1:0".to_string(),
        ..Default::default()
    })
    .unwrap();

    server.on_new_socket(|socket| {
        let channel = socket.channel("golang");
        let replier = channel.clone();
        channel.on_read(move |data| {
            let replier = replier.clone();
            tokio::spawn(async move {
                replier.write(&format!("channel:{data}")).await;
            });
        });
        socket.discard_read();
    });

    let handle = server.start().await.unwrap();
    let host = format!("http://{}", handle.local_addr());

    let client = Client::new(fast_options(&host)).unwrap();
    let (main_tx, mut main_rx) = mpsc::unbounded_channel::<String>();
    client.on_message(move |data| {
        let _ = main_tx.send(data);
    });
    let channel = client.channel("golang");
    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel::<String>();
    channel.on_message(move |data| {
        let _ = channel_tx.send(data);
    });
    let mut connected = event_signal(&client, ClientEvent::Connected);

    client.connect();
    await_signal(&mut connected, "connected").await;

    assert_eq!(channel.send("x").code(), 1);
    let reply = timeout(Duration::from_secs(10), channel_rx.recv())
        .await
        .expect("channel reply")
        .unwrap();
    assert_eq!(reply, "channel:x");
    assert!(main_rx.try_recv().is_err(), "channels must not cross");

    client.close();
    handle.shutdown();
}

#[tokio::test]
async fn buffered_sends_flush_in_order_after_connecting() {
    init_tracing();
    let server = Server::new(ServerOptions {
        listen_address: "127.0.0.1:0".to_string(),
        ..Default::default()
    })
    .unwrap();

    let (received_tx, mut received_rx) = mpsc::unbounded_channel::<String>();
    server.on_new_socket(move |socket| {
        let received_tx = received_tx.clone();
        socket.on_read(move |data| {
            let _ = received_tx.send(data);
        });
    });

    let handle = server.start().await.unwrap();
    let host = format!("http://{}", handle.local_addr());
    let client = Client::new(fast_options(&host)).unwrap();

    // Queued before any connection exists.
    assert_eq!(client.send("first").code(), 0);
    assert_eq!(client.send("second").code(), 0);
    assert_eq!(client.send("third").code(), 0);

    let mut connected = event_signal(&client, ClientEvent::Connected);
    client.connect();
    await_signal(&mut connected, "connected").await;

    for expected in ["first", "second", "third"] {
        let got = timeout(Duration::from_secs(10), received_rx.recv())
            .await
            .expect("buffered frame")
            .unwrap();
        assert_eq!(got, expected);
    }

    client.close();
    handle.shutdown();
}

#[tokio::test]
async fn reconnect_attempts_are_bounded_against_an_unreachable_server() {
    init_tracing();
    // Grab a port with no listener behind it.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let mut opts = fast_options(&format!("http://127.0.0.1:{port}"));
    opts.reconnect_attempts = 3;
    let client = Client::new(opts).unwrap();
    let events = track_events(&client);
    let mut disconnected = event_signal(&client, ClientEvent::Disconnected);

    client.connect();
    await_signal(&mut disconnected, "disconnected").await;

    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "connecting",
            "reconnecting",
            "reconnecting",
            "reconnecting",
            "disconnected"
        ]
    );
}

#[tokio::test]
async fn the_send_buffer_window_discards_after_its_timeout() {
    init_tracing();
    let mut opts = ClientOptions::new("http://127.0.0.1:9");
    opts.reset_send_buffer_timeout = Duration::from_millis(100);
    let client = Client::new(opts).unwrap();

    let discard_order = Arc::new(Mutex::new(Vec::new()));
    let mut discarded = event_signal(&client, ClientEvent::DiscardSendBuffer);

    for label in ["a", "b"] {
        let order = discard_order.clone();
        let status = client.send_with_discard(label, move |data| {
            order.lock().unwrap().push(data);
        });
        assert_eq!(status, SendStatus::Queued);
        assert_eq!(status.code(), 0);
    }

    await_signal(&mut discarded, "discard_send_buffer").await;
    assert_eq!(*discard_order.lock().unwrap(), vec!["a", "b"]);

    // The window is burned: further sends are dropped immediately.
    let late = Arc::new(Mutex::new(Vec::new()));
    let order = late.clone();
    let status = client.send_with_discard("late", move |data| {
        order.lock().unwrap().push(data);
    });
    assert_eq!(status, SendStatus::Discarded);
    assert_eq!(status.code(), -1);
    assert_eq!(*late.lock().unwrap(), vec!["late"]);
}

#[tokio::test]
async fn a_dont_reconnect_notice_stops_the_retry_loop() {
    init_tracing();
    use tokio_tungstenite::tungstenite::Message;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                // Swallow the init frame, refuse the client.
                let _ = ws.next().await;
                let _ = ws.send(Message::text("dr".to_string())).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            });
        }
    });

    let client = Client::new(fast_options(&format!("http://{addr}"))).unwrap();
    let mut disconnected = event_signal(&client, ClientEvent::Disconnected);

    client.connect();
    await_signal(&mut disconnected, "disconnected").await;

    // No automatic retry after the notice.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    // An explicit reconnect is honored again.
    client.reconnect();
    timeout(Duration::from_secs(10), async {
        while accepts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("explicit reconnect should dial again");
}

#[tokio::test]
async fn client_ping_timeout_triggers_a_reconnect() {
    init_tracing();
    use tokio_tungstenite::tungstenite::Message;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));

    let counter = accepts.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                // Complete the handshake, then go silent: ignore every
                // subsequent frame, including application-level pings.
                let _ = ws.next().await;
                let _ = ws
                    .send(Message::text("in{\"socketID\":\"silent-socket\"}".to_string()))
                    .await;
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    let mut opts = fast_options(&format!("http://{addr}"));
    opts.ping_interval = Duration::from_millis(200);
    opts.ping_reconnect_timeout = Duration::from_millis(100);
    let client = Client::new(opts).unwrap();

    let mut connected = event_signal(&client, ClientEvent::Connected);
    let mut ping_timeout = event_signal(&client, ClientEvent::Timeout);

    client.connect();
    await_signal(&mut connected, "connected").await;
    await_signal(&mut ping_timeout, "ping timeout").await;

    // The runtime dials again after the dead connection.
    timeout(Duration::from_secs(10), async {
        while accepts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("reconnect after ping timeout");

    client.close();
}

#[tokio::test]
async fn the_client_falls_back_to_ajax_when_websocket_never_succeeds() {
    init_tracing();
    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;

    #[derive(Clone, Default)]
    struct FakeSession {
        outbound: Arc<tokio::sync::Mutex<VecDeque<String>>>,
    }

    // A hand-rolled AJAX peer speaking just enough of the protocol. There is
    // no websocket route at all, so that transport can never succeed.
    async fn ajax(State(session): State<FakeSession>, body: String) -> String {
        if body == "i" {
            return "fakesessid&tok0001".to_string();
        }
        if let Some(frame) = body.strip_prefix("ufakesessid&") {
            if frame.starts_with("in") {
                session
                    .outbound
                    .lock()
                    .await
                    .push_back("in{\"socketID\":\"fake-socket\"}".to_string());
            } else if frame.starts_with("cd") {
                session.outbound.lock().await.push_back(frame.to_string());
            }
            return String::new();
        }
        if body.starts_with("ofakesessid&") {
            for _ in 0..200 {
                if let Some(frame) = session.outbound.lock().await.pop_front() {
                    return format!("tokNEXT&{frame}");
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return "t".to_string();
        }
        "t".to_string()
    }

    let app = Router::new()
        .route("/glue/ajax", post(ajax))
        .with_state(FakeSession::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = Client::new(fast_options(&format!("http://{addr}"))).unwrap();
    let events = track_events(&client);

    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<String>();
    client.on_message(move |data| {
        let _ = message_tx.send(data);
    });
    let mut connected = event_signal(&client, ClientEvent::Connected);

    client.connect();
    await_signal(&mut connected, "connected").await;

    assert_eq!(client.socket_id().as_deref(), Some("fake-socket"));
    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec!["connecting", "reconnecting", "reconnecting", "connected"],
        "two websocket attempts, then the ajax fallback"
    );

    // The fallback transport carries application data.
    assert_eq!(client.send("ping-data").code(), 1);
    let echoed = timeout(Duration::from_secs(10), message_rx.recv())
        .await
        .expect("echoed frame")
        .unwrap();
    assert_eq!(echoed, "ping-data");

    client.close();
}
