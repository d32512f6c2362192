//! End-to-end relay tests against a mock upstream.
//!
//! A local axum server plays the OpenAI-compatible provider; the gateway's
//! own router is driven through tower. Covers cross-format routing,
//! first-token-timeout failover, channel compatibility, and terminal
//! failure accounting.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use octopus_gateway::{router, AppState, Config, Services, Store};

// ============================================================================
// Mock upstreams
// ============================================================================

async fn spawn(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// OpenAI chat mock: non-stream JSON completion.
async fn spawn_openai_mock() -> SocketAddr {
    let app = Router::new().route(
        "/chat/completions",
        post(|| async {
            axum::Json(json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "gpt-4o-mini",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello there"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
            }))
        }),
    );
    spawn(app).await
}

fn sse_body(frames: Vec<String>) -> axum::response::Response {
    let stream = futures::stream::iter(
        frames
            .into_iter()
            .map(|f| Ok::<_, std::convert::Infallible>(bytes::Bytes::from(f))),
    );
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

fn chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion.chunk",
            "model": "gpt-4o-mini",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": content}}]
        })
    )
}

fn final_chunks() -> Vec<String> {
    vec![
        format!(
            "data: {}\n\n",
            json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion.chunk",
                "model": "gpt-4o-mini",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
            })
        ),
        format!(
            "data: {}\n\n",
            json!({
                "id": "chatcmpl-mock",
                "object": "chat.completion.chunk",
                "model": "gpt-4o-mini",
                "choices": [],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })
        ),
        "data: [DONE]\n\n".to_string(),
    ]
}

/// Streaming mock that answers immediately.
async fn spawn_streaming_mock(hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().route(
        "/chat/completions",
        post(move || {
            hits.fetch_add(1, Ordering::SeqCst);
            async move {
                let mut frames = vec![chunk("only "), chunk("the second channel")];
                frames.extend(final_chunks());
                sse_body(frames)
            }
        }),
    );
    spawn(app).await
}

/// Streaming mock that accepts the stream but stays silent too long.
async fn spawn_stalling_mock(hits: Arc<AtomicUsize>) -> SocketAddr {
    let app = Router::new().route(
        "/chat/completions",
        post(move || {
            hits.fetch_add(1, Ordering::SeqCst);
            async move {
                let stream = futures::stream::once(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, std::convert::Infallible>(bytes::Bytes::from(chunk("too late")))
                });
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(stream),
                )
                    .into_response()
            }
        }),
    );
    spawn(app).await
}

// ============================================================================
// Gateway fixture
// ============================================================================

struct Fixture {
    app: Router,
    services: Services,
}

/// Seed a gateway with one group routing to the given channels, each with
/// one key. `mode` 3 = failover.
async fn gateway(
    group_name: &str,
    mode: i64,
    first_token_timeout: i64,
    channels: &[(i64, SocketAddr)],
) -> Fixture {
    let store = Store::connect("sqlite::memory:").await.unwrap();
    sqlx::query("INSERT INTO api_keys (name, api_key) VALUES ('tenant', 'sk-octopus-test')")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query(
        r#"INSERT INTO "groups" (name, mode, first_token_time_out) VALUES (?, ?, ?)"#,
    )
    .bind(group_name)
    .bind(mode)
    .bind(first_token_timeout)
    .execute(store.pool())
    .await
    .unwrap();

    for (i, (kind, addr)) in channels.iter().enumerate() {
        let base_urls = json!([{"url": format!("http://{addr}"), "delay": 0}]).to_string();
        sqlx::query("INSERT INTO channels (name, kind, base_urls) VALUES (?, ?, ?)")
            .bind(format!("upstream-{i}"))
            .bind(kind)
            .bind(base_urls)
            .execute(store.pool())
            .await
            .unwrap();
        let channel_id = i as i64 + 1;
        sqlx::query("INSERT INTO channel_keys (channel_id, channel_key) VALUES (?, 'sk-up')")
            .bind(channel_id)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO group_items (group_id, channel_id, model_name, priority, weight)
             VALUES (1, ?, 'gpt-4o-mini', ?, 1)",
        )
        .bind(channel_id)
        .bind(channel_id)
        .execute(store.pool())
        .await
        .unwrap();
    }

    let services = Services::init(store).await.unwrap();
    let app = router(AppState::new(services.clone(), Config::default()));
    Fixture { app, services }
}

async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("x-api-key", "sk-octopus-test")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let mut collected = Vec::new();
    let mut stream = response.into_body().into_data_stream();
    while let Some(Ok(bytes)) = stream.next().await {
        collected.extend_from_slice(&bytes);
    }
    (status, collected)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_anthropic_client_routed_to_openai_channel() {
    let upstream = spawn_openai_mock().await;
    let fixture = gateway("gpt-4o-mini", 1, 0, &[(0, upstream)]).await;

    let (status, body) = post_json(
        &fixture.app,
        "/v1/messages",
        json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 32
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    // The client sees an Anthropic Message object.
    assert_eq!(value["type"], "message");
    assert_eq!(value["role"], "assistant");
    assert_eq!(value["stop_reason"], "end_turn");
    assert_eq!(value["content"][0]["text"], "hello there");
    // Token totals survive the format change.
    let input = value["usage"]["input_tokens"].as_i64().unwrap();
    let output = value["usage"]["output_tokens"].as_i64().unwrap();
    assert_eq!(input + output, 12);

    // One success accounted in every bucket.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let total = fixture.services.stats.total();
    assert_eq!(total.metrics.request_success, 1);
    assert_eq!(total.metrics.request_failed, 0);
    assert_eq!(total.metrics.input_token, 9);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_openai_client_non_stream_passthrough() {
    let upstream = spawn_openai_mock().await;
    let fixture = gateway("gpt-4o-mini", 1, 0, &[(0, upstream)]).await;

    let (status, body) = post_json(
        &fixture.app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["object"], "chat.completion");
    assert_eq!(value["choices"][0]["message"]["content"], "hello there");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_token_timeout_fails_over_to_next_channel() {
    let stall_hits = Arc::new(AtomicUsize::new(0));
    let good_hits = Arc::new(AtomicUsize::new(0));
    let stalling = spawn_stalling_mock(Arc::clone(&stall_hits)).await;
    let streaming = spawn_streaming_mock(Arc::clone(&good_hits)).await;

    // Failover group: the stalling channel has the better priority.
    let fixture = gateway("gpt-4o-mini", 3, 1, &[(0, stalling), (0, streaming)]).await;

    let (status, body) = post_json(
        &fixture.app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8_lossy(&body);
    // The client only ever sees the second channel's stream.
    assert!(text.contains("only "));
    assert!(text.contains("the second channel"));
    assert!(!text.contains("too late"));
    assert!(text.contains("[DONE]"));

    assert_eq!(stall_hits.load(Ordering::SeqCst), 1);
    assert_eq!(good_hits.load(Ordering::SeqCst), 1);

    // The relay log records both attempts; the retry succeeded in round 1.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let logs = fixture.services.relay_log.query(None, 1, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].total_attempts, 2);
    assert!(!logs[0].attempts[0].success);
    assert!(logs[0].attempts[0].error.contains("first token timeout"));
    assert!(logs[0].attempts[1].success);
    assert_eq!(logs[0].successful_round, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_embedding_request_rejected_by_chat_channel() {
    let upstream = spawn_openai_mock().await;
    // Kind 0 = openai-chat; embeddings cannot route there.
    let fixture = gateway("text-embedding-3-small", 1, 0, &[(0, upstream)]).await;
    // Rename the group item model to match.
    sqlx::query("UPDATE group_items SET model_name = 'text-embedding-3-small'")
        .execute(fixture.services.store.pool())
        .await
        .unwrap();
    fixture.services.groups.refresh().await.unwrap();

    let (status, body) = post_json(
        &fixture.app,
        "/v1/embeddings",
        json!({"model": "text-embedding-3-small", "input": "hello"}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["message"], "all channels failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_model_404_and_unsupported_model_400() {
    let upstream = spawn_openai_mock().await;
    let fixture = gateway("gpt-4o-mini", 1, 0, &[(0, upstream)]).await;

    let (status, _) = post_json(
        &fixture.app,
        "/v1/chat/completions",
        json!({"model": "no-such-model", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    sqlx::query("UPDATE api_keys SET supported_models = 'other-model'")
        .execute(fixture.services.store.pool())
        .await
        .unwrap();
    fixture.services.api_keys.refresh().await.unwrap();

    let (status, body) = post_json(
        &fixture.app,
        "/v1/chat/completions",
        json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"]["message"], "model not supported");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_all_channels_failed_records_failure() {
    // Point at a dead port.
    let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let fixture = gateway("gpt-4o-mini", 1, 0, &[(0, dead)]).await;

    let (status, _) = post_json(
        &fixture.app,
        "/v1/chat/completions",
        json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let total = fixture.services.stats.total();
    assert_eq!(total.metrics.request_failed, 1);

    // Up-front deduction stands even though the request never succeeded.
    assert!(total.metrics.input_cost > 0.0);

    let logs = fixture.services.relay_log.query(None, 1, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].successful_round, 0);
    // 3 rounds over a single item.
    assert_eq!(logs[0].total_attempts, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_body_rejected_before_any_attempt() {
    let upstream = spawn_openai_mock().await;
    let fixture = gateway("gpt-4o-mini", 1, 0, &[(0, upstream)]).await;

    let (status, _) = post_json(
        &fixture.app,
        "/v1/chat/completions",
        json!({"model": "gpt-4o-mini"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(fixture.services.stats.total().metrics.request_failed, 0);
}
