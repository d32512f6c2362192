//! Model catalog endpoint.
//!
//! Lists the group names the caller may request, shaped per the detected
//! request type: Anthropic-style clients get the paged `{data, has_more,
//! first_id, last_id}` envelope, OpenAI-style clients get `{data,
//! object:"list"}`.

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;

use crate::api::auth::AuthContext;
use crate::api::AppState;

pub async fn list_models(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    let mut models = state.services.groups.model_names();
    models.sort();

    if !auth.supported_models.is_empty() {
        let allowed: Vec<&str> = auth.supported_models.split(',').map(str::trim).collect();
        models.retain(|m| allowed.contains(&m.as_str()));
    }

    if auth.request_type == "anthropic" {
        let data: Vec<_> = models
            .iter()
            .map(|m| {
                json!({
                    "id": m,
                    "created_at": "2024-01-01T00:00:00Z",
                    "display_name": m,
                    "type": "model",
                })
            })
            .collect();
        let mut response = json!({
            "data": data,
            "has_more": false,
        });
        if let (Some(first), Some(last)) = (models.first(), models.last()) {
            response["first_id"] = json!(first);
            response["last_id"] = json!(last);
        }
        return Json(response).into_response();
    }

    let data: Vec<_> = models
        .iter()
        .map(|m| {
            json!({
                "id": m,
                "object": "model",
                "created": 1763395200,
                "owned_by": "octopus",
            })
        })
        .collect();
    Json(json!({
        "data": data,
        "object": "list",
    }))
    .into_response()
}
