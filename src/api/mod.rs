//! HTTP ingress: application state, router, and the client-facing relay
//! endpoints.

pub mod auth;
pub mod models;

use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Router};
use bytes::Bytes;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::Config;
use crate::relay::{self, RelayRequest};
use crate::services::{settings, Services};
use crate::transformer::InboundKind;

use auth::AuthContext;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub config: Config,
}

impl AppState {
    pub fn new(services: Services, config: Config) -> Self {
        Self { services, config }
    }
}

/// Build the client-facing router. Every relay route sits behind API-key
/// authentication.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.services);

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(models::list_models))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::api_key_auth,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// CORS from the `cors_allow_origins` setting: empty denies cross-origin,
/// `*` allows everything, else a comma list of origins.
fn cors_layer(services: &Services) -> CorsLayer {
    let origins = services
        .settings
        .get_string(settings::CORS_ALLOW_ORIGINS)
        .unwrap_or_default();

    if origins.trim().is_empty() {
        return CorsLayer::new();
    }
    if origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<_> = origins
        .split(',')
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn chat_completions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    relay_with(state, auth, headers, query, body, InboundKind::OpenAiChat).await
}

async fn responses(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    relay_with(state, auth, headers, query, body, InboundKind::OpenAiResponse).await
}

async fn messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    relay_with(state, auth, headers, query, body, InboundKind::Anthropic).await
}

async fn embeddings(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    relay_with(state, auth, headers, query, body, InboundKind::OpenAiEmbedding).await
}

async fn relay_with(
    state: AppState,
    auth: AuthContext,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
    kind: InboundKind,
) -> Response {
    let request = RelayRequest {
        kind,
        headers,
        query: parse_query(query.as_deref().unwrap_or("")),
        body,
        api_key_id: auth.api_key_id,
        supported_models: auth.supported_models,
        max_sse_event_size: state.config.max_sse_event_size,
    };
    relay::handle(state.services, request).await
}

/// Parse a raw query string into decoded pairs, preserving order.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &raw[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
