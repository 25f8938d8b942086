mod common;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parley_core::llm::BackendResult;
use parley_core::{GatewayBackend, GatewayClient, GatewayConfig, GatewayRequest, Message};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Hits {
    root: AtomicUsize,
    v1: AtomicUsize,
    api_v1: AtomicUsize,
    last_body: Mutex<Option<Value>>,
    last_auth: Mutex<Option<String>>,
}

fn client(addr: SocketAddr, base_suffix: &str) -> GatewayClient {
    GatewayClient::new(&GatewayConfig {
        api_base: format!("http://{}{}", addr, base_suffix),
        api_key: "gw-key".into(),
        request_timeout_ms: Some(5_000),
    })
    .expect("gateway client")
}

fn request() -> GatewayRequest {
    let mut variables = BTreeMap::new();
    variables.insert("chat_type".to_string(), "private".to_string());
    GatewayRequest {
        messages: vec![Message::user("hello")],
        conversation_key: Some("user_u1_session_u1".into()),
        response_item_id: Some("resp_1700000000_abc123".into()),
        variables,
        detail: false,
        api_key: None,
    }
}

#[tokio::test]
async fn falls_through_404s_and_stops_at_first_success() -> BackendResult<()> {
    let hits = Arc::new(Hits::default());
    let app = Router::new()
        .route(
            "/chat/completions",
            post(|State(h): State<Arc<Hits>>| async move {
                h.root.fetch_add(1, Ordering::SeqCst);
                (StatusCode::NOT_FOUND, "no such route")
            }),
        )
        .route(
            "/v1/chat/completions",
            post(|State(h): State<Arc<Hits>>| async move {
                h.v1.fetch_add(1, Ordering::SeqCst);
                (StatusCode::NOT_FOUND, "no such route")
            }),
        )
        .route(
            "/api/v1/chat/completions",
            post(
                |State(h): State<Arc<Hits>>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    h.api_v1.fetch_add(1, Ordering::SeqCst);
                    *h.last_body.lock().unwrap() = Some(body);
                    *h.last_auth.lock().unwrap() = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    Json(json!({
                        "choices": [{"message": {"content": "from api/v1"}}],
                        "usage": {"total_tokens": 30, "completion_tokens": 7}
                    }))
                },
            ),
        )
        .with_state(Arc::clone(&hits));
    let addr = common::spawn_server(app).await;

    let raw = client(addr, "/").complete(&request()).await?;
    assert!(raw.error.is_none());
    assert_eq!(raw.text(), "from api/v1");
    assert_eq!(raw.usage().total_tokens, 30);
    assert_eq!(raw.usage().completion_tokens, 7);

    assert_eq!(hits.root.load(Ordering::SeqCst), 1);
    assert_eq!(hits.v1.load(Ordering::SeqCst), 1);
    assert_eq!(hits.api_v1.load(Ordering::SeqCst), 1);

    let body = hits.last_body.lock().unwrap().clone().expect("body captured");
    assert_eq!(body["chatId"], "user_u1_session_u1");
    assert_eq!(body["responseChatItemId"], "resp_1700000000_abc123");
    assert_eq!(body["stream"], false);
    assert_eq!(body["detail"], false);
    assert_eq!(body["variables"]["chat_type"], "private");
    assert_eq!(body["messages"][0]["content"], "hello");
    assert_eq!(
        hits.last_auth.lock().unwrap().as_deref(),
        Some("Bearer gw-key")
    );
    Ok(())
}

#[tokio::test]
async fn first_success_short_circuits_remaining_candidates() -> BackendResult<()> {
    let hits = Arc::new(Hits::default());
    let app = Router::new()
        .route(
            "/chat/completions",
            post(|State(h): State<Arc<Hits>>| async move {
                h.root.fetch_add(1, Ordering::SeqCst);
                Json(json!({"choices": [{"message": {"content": "root"}}]}))
            }),
        )
        .route(
            "/v1/chat/completions",
            post(|State(h): State<Arc<Hits>>| async move {
                h.v1.fetch_add(1, Ordering::SeqCst);
                Json(json!({"choices": [{"message": {"content": "v1"}}]}))
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = common::spawn_server(app).await;

    let raw = client(addr, "").complete(&request()).await?;
    assert_eq!(raw.text(), "root");
    assert_eq!(hits.root.load(Ordering::SeqCst), 1);
    assert_eq!(hits.v1.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn server_errors_are_recorded_and_next_candidate_tried() -> BackendResult<()> {
    let app = Router::new()
        .route(
            "/chat/completions",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "kaboom") }),
        )
        .route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::OK, "this is not json") }),
        )
        .route(
            "/api/v1/chat/completions",
            post(|| async { Json(json!({"choices": [{"message": {"content": "third"}}]})) }),
        );
    let addr = common::spawn_server(app).await;

    let raw = client(addr, "").complete(&request()).await?;
    assert_eq!(raw.text(), "third");
    Ok(())
}

#[tokio::test]
async fn exhausted_candidates_return_error_data_with_last_failure() -> BackendResult<()> {
    let app = Router::new()
        .route(
            "/chat/completions",
            post(|| async { (StatusCode::NOT_FOUND, "nope") }),
        )
        .route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::NOT_FOUND, "nope") }),
        )
        .route(
            "/api/v1/chat/completions",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        );
    let addr = common::spawn_server(app).await;

    let raw = client(addr, "").complete(&request()).await?;
    assert!(raw.endpoints_exhausted);
    let err = raw.error.expect("error recorded");
    assert!(err.contains("502"), "unexpected error: {err}");
    assert!(err.contains("upstream down"), "unexpected error: {err}");
    assert!(raw.choices.is_empty());
    Ok(())
}

#[tokio::test]
async fn unreachable_gateway_is_reported_as_data() -> BackendResult<()> {
    // Bind then drop a listener to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let raw = client(addr, "").complete(&request()).await?;
    assert!(raw.endpoints_exhausted);
    assert!(raw.error.unwrap().contains("request error"));
    Ok(())
}

#[tokio::test]
async fn upstream_error_body_is_passed_through() -> BackendResult<()> {
    let app = Router::new().route(
        "/chat/completions",
        post(|| async { Json(json!({"error": "workflow not published"})) }),
    );
    let addr = common::spawn_server(app).await;

    let raw = client(addr, "").complete(&request()).await?;
    assert!(!raw.endpoints_exhausted);
    assert_eq!(raw.error.as_deref(), Some("workflow not published"));
    Ok(())
}

#[tokio::test]
async fn per_request_key_replaces_configured_key() -> BackendResult<()> {
    let hits = Arc::new(Hits::default());
    let app = Router::new()
        .route(
            "/chat/completions",
            post(|State(h): State<Arc<Hits>>, headers: HeaderMap| async move {
                *h.last_auth.lock().unwrap() = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                Json(json!({"choices": [{"message": {"content": "ok"}}]}))
            }),
        )
        .with_state(Arc::clone(&hits));
    let addr = common::spawn_server(app).await;
    let gateway = client(addr, "");

    let mut req = request();
    req.api_key = Some("user-own-key".into());
    gateway.complete(&req).await?;
    assert_eq!(
        hits.last_auth.lock().unwrap().as_deref(),
        Some("Bearer user-own-key")
    );

    // Empty override falls back to the configured key
    req.api_key = Some(String::new());
    gateway.complete(&req).await?;
    assert_eq!(
        hits.last_auth.lock().unwrap().as_deref(),
        Some("Bearer gw-key")
    );
    Ok(())
}
