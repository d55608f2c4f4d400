//! Shared-secret check for the agent API.
//!
//! Runs as route middleware, so a request with a wrong or missing key is
//! rejected before any handler executes and leaves no side effect. A server
//! with no key configured rejects everything; `validate()` refuses that
//! configuration at startup.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use super::state::AppState;

pub const AGENT_KEY_HEADER: &str = "x-agent-key";

pub async fn require_agent_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.config.server.agent_key.as_deref().unwrap_or("");
    let provided = request
        .headers()
        .get(AGENT_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if !expected.is_empty() && provided == Some(expected) {
        return next.run(request).await;
    }

    warn!(
        "Rejected request to {} with {} agent key",
        request.uri().path(),
        if provided.is_some() { "wrong" } else { "missing" }
    );
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "success": false, "error": "unauthorized" })),
    )
        .into_response()
}
