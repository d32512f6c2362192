//! API-key authentication middleware.
//!
//! Accepts `x-api-key` (classified as an Anthropic-style client) or
//! `Authorization: Bearer` (OpenAI-style). Valid keys carry the
//! `sk-octopus-` prefix. On success the request gains an [`AuthContext`];
//! along the way the key's quota auto-reset is applied and the cost ceiling
//! enforced.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::api::AppState;
use crate::core::config::APP_NAME;
use crate::core::error::AppError;
use crate::services::api_keys::{compute_next_reset, is_aligned_to_midnight};
use tracing::warn;

/// Context exposed to downstream handlers for an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: i64,
    /// "anthropic" when authenticated via x-api-key, else "openai"
    pub request_type: &'static str,
    /// Comma-separated model allow-list; empty = all models
    pub supported_models: String,
}

pub async fn api_key_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let headers = request.headers();

    let (secret, request_type) = if let Some(key) = headers.get("x-api-key") {
        (key.to_str().unwrap_or("").to_string(), "anthropic")
    } else if let Some(auth) = headers.get("authorization") {
        let raw = auth.to_str().unwrap_or("");
        (
            raw.strip_prefix("Bearer ").unwrap_or(raw).to_string(),
            "openai",
        )
    } else {
        (String::new(), "openai")
    };

    if secret.is_empty() {
        return Err(AppError::Unauthorized("unauthorized".to_string()));
    }
    if !secret.starts_with(&format!("sk-{APP_NAME}-")) {
        return Err(AppError::Unauthorized("unauthorized".to_string()));
    }

    let services = &state.services;
    let mut api_key = services
        .api_keys
        .get_by_secret(&secret)
        .ok_or_else(|| AppError::Unauthorized("unauthorized".to_string()))?;

    if !api_key.enabled {
        return Err(AppError::Unauthorized("API key is disabled".to_string()));
    }
    let now = chrono::Utc::now().timestamp();
    if api_key.expire_at > 0 && api_key.expire_at < now {
        return Err(AppError::Unauthorized("API key has expired".to_string()));
    }

    // Quota auto-reset.
    if api_key.auto_reset_quota && api_key.reset_duration > 0 {
        // A day-unit reset moment off UTC midnight means the unit changed
        // since it was computed; force a reset to realign.
        let force_realign = api_key.reset_unit == "day"
            && api_key.next_reset_time > 0
            && !is_aligned_to_midnight(api_key.next_reset_time);

        if api_key.next_reset_time == 0 {
            api_key.next_reset_time =
                compute_next_reset(now, api_key.reset_duration, &api_key.reset_unit);
            if let Err(e) = services.api_keys.update(&api_key).await {
                warn!("failed to initialize api key reset time: {e}");
            }
        } else if now >= api_key.next_reset_time || force_realign {
            services.stats.reset_api_key(api_key.id);
            api_key.next_reset_time =
                compute_next_reset(now, api_key.reset_duration, &api_key.reset_unit);
            if let Err(e) = services.api_keys.update(&api_key).await {
                warn!("failed to update api key reset time: {e}");
            }
        }
    }

    // Cost ceiling: zero means unlimited.
    if api_key.max_cost > 0.0 {
        let stats = services.stats.api_key_stats(api_key.id);
        if stats.metrics.input_cost + stats.metrics.output_cost > api_key.max_cost {
            return Err(AppError::Unauthorized(
                "API key has reached the max cost".to_string(),
            ));
        }
    }

    request.extensions_mut().insert(AuthContext {
        api_key_id: api_key.id,
        request_type,
        supported_models: api_key.supported_models.clone(),
    });

    Ok(next.run(request).await)
}
