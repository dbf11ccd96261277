//! HTTP-level tests for the AJAX transport and the router's request
//! validation, driven straight through the public router.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use glue::{Server, ServerOptions};
use tower::ServiceExt;

const UA: &str = "ajax-test-agent";

fn new_server() -> Server {
    Server::new(ServerOptions {
        listen_address: "127.0.0.1:0".to_string(),
        ..Default::default()
    })
    .unwrap()
}

async fn post_ajax(router: &Router, body: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method("POST")
        .uri("/glue/ajax")
        .header(header::USER_AGENT, UA)
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn a_full_session_runs_over_stateless_posts() {
    let server = new_server();
    server.on_new_socket(|socket| {
        let writer = socket.clone();
        socket.on_read(move |data| {
            let writer = writer.clone();
            tokio::spawn(async move {
                writer.write(&format!("echo:{data}")).await;
            });
        });
    });
    let router = server.router();

    // Init assigns a session id and the first poll token.
    let (status, body) = post_ajax(&router, "i").await;
    assert_eq!(status, StatusCode::OK);
    let (sid, token) = body.split_once('&').expect("init response");
    assert_eq!(sid.len(), 10);
    assert_eq!(token.len(), 7);

    // Push the init handshake frame; poll for the server's reply.
    let init_frame = format!("in{{\"version\":\"{}\"}}", glue::PROTOCOL_VERSION);
    let (status, _) = post_ajax(&router, &format!("u{sid}&{init_frame}")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_ajax(&router, &format!("o{sid}&{token}")).await;
    assert_eq!(status, StatusCode::OK);
    let (token, frame) = body.split_once('&').expect("poll response");
    let payload = frame.strip_prefix("in").expect("init reply");
    let value: serde_json::Value = serde_json::from_str(payload).unwrap();
    let socket_id = value["socketID"].as_str().unwrap();
    assert!(server.get_socket(socket_id).is_some());

    // Application data round-trips through push + poll.
    let message = format!("cd{}", glue::marshal_values("m", "hello"));
    let (status, _) = post_ajax(&router, &format!("u{sid}&{message}")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_ajax(&router, &format!("o{sid}&{token}")).await;
    assert_eq!(status, StatusCode::OK);
    let (_token, frame) = body.split_once('&').expect("poll response");
    assert_eq!(frame, format!("cd{}", glue::marshal_values("m", "echo:hello")));
}

#[tokio::test]
async fn push_requires_the_session_user_agent() {
    let server = new_server();
    let router = server.router();

    let (_, body) = post_ajax(&router, "i").await;
    let (sid, _) = body.split_once('&').unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/glue/ajax")
        .header(header::USER_AGENT, "someone-else")
        .body(Body::from(format!("u{sid}&pi")))
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_ajax_requests_are_bad_requests() {
    let server = new_server();
    let router = server.router();

    for body in ["", "x", "oUNKNOWNSID&token", "uUNKNOWNSID&data"] {
        let (status, _) = post_ajax(&router, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "body '{body}'");
    }
}

#[tokio::test]
async fn non_post_requests_to_the_ajax_route_are_rejected() {
    let server = new_server();
    let router = server.router();

    let request = Request::builder()
        .method("GET")
        .uri("/glue/ajax")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn non_get_requests_to_the_ws_route_are_method_not_allowed() {
    let server = new_server();
    let router = server.router();

    let request = Request::builder()
        .method("POST")
        .uri("/glue/ws")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn requests_outside_the_base_url_are_not_found() {
    let server = new_server();
    let router = server.router();

    let request = Request::builder()
        .method("POST")
        .uri("/other/ajax")
        .body(Body::from("i"))
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cross_origin_requests_are_rejected_by_default() {
    let server = new_server();
    let router = server.router();

    let request = Request::builder()
        .method("POST")
        .uri("/glue/ajax")
        .header(header::HOST, "example.com")
        .header(header::ORIGIN, "http://evil.test")
        .header(header::USER_AGENT, UA)
        .body(Body::from("i"))
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::builder()
        .method("POST")
        .uri("/glue/ajax")
        .header(header::HOST, "example.com")
        .header(header::ORIGIN, "http://example.com")
        .header(header::USER_AGENT, UA)
        .body(Body::from("i"))
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn cors_mode_echoes_the_request_origin() {
    let server = Server::new(ServerOptions {
        listen_address: "127.0.0.1:0".to_string(),
        enable_cors: true,
        check_origin: Some(std::sync::Arc::new(|_headers| true)),
        ..Default::default()
    })
    .unwrap();
    let router = server.router();

    let request = Request::builder()
        .method("POST")
        .uri("/glue/ajax")
        .header(header::ORIGIN, "http://app.example.com")
        .header(header::USER_AGENT, UA)
        .body(Body::from("i"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://app.example.com"
    );
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS],
        "POST,GET"
    );
}

#[tokio::test]
async fn a_stale_poll_token_is_rejected() {
    let server = new_server();
    let router = server.router();

    let (_, body) = post_ajax(&router, "i").await;
    let (sid, token) = body.split_once('&').unwrap();
    let sid = sid.to_string();
    let first_token = token.to_string();

    // Drive the handshake so a frame is waiting for the first poll.
    let init_frame = format!("in{{\"version\":\"{}\"}}", glue::PROTOCOL_VERSION);
    post_ajax(&router, &format!("u{sid}&{init_frame}")).await;

    let (status, body) = post_ajax(&router, &format!("o{sid}&{first_token}")).await;
    assert_eq!(status, StatusCode::OK);
    let (rotated, _) = body.split_once('&').unwrap();
    assert_ne!(rotated, first_token);

    // Replaying the consumed token fails; the rotated one works.
    let (status, _) = post_ajax(&router, &format!("o{sid}&{first_token}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let _ = tokio::time::timeout(
        Duration::from_millis(100),
        post_ajax(&router, &format!("o{sid}&{rotated}")),
    )
    .await;
}
