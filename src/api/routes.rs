//! Route table and handlers.
//!
//! `POST /api/agent/sync` is the hot path: it always answers 200 with the
//! protocol envelope, even on internal failure, so the agent's poll loop
//! never breaks. The operator endpoints return conventional status codes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::agent::{ManualCommandRequest, SyncRequest};
use crate::domain::AgentSession;
use crate::error::MtLinkError;

use super::auth::require_agent_key;
use super::state::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/agent/sync", post(agent_sync))
        .route("/agent/commands", post(submit_command))
        .route("/agent/commands/:account_id", get(recent_commands))
        .route("/agent/sessions", get(list_sessions))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_agent_key,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn agent_sync(State(state): State<AppState>, Json(request): Json<SyncRequest>) -> Response {
    Json(state.handler.sync(request).await).into_response()
}

async fn submit_command(
    State(state): State<AppState>,
    Json(request): Json<ManualCommandRequest>,
) -> Response {
    match state.handler.submit_manual(request).await {
        Ok(command) => Json(json!({
            "success": true,
            "commandId": command.id,
            "status": command.status.as_str(),
            "expiresAt": command.expires_at,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn recent_commands(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    match state.store.recent_commands(&account_id, 50).await {
        Ok(commands) => Json(json!({ "success": true, "commands": commands })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    account_id: String,
    online: bool,
    heartbeat: DateTime<Utc>,
    agent_version: String,
    balance: rust_decimal::Decimal,
    equity: rust_decimal::Decimal,
    open_positions: usize,
    last_analysis_at: Option<DateTime<Utc>>,
}

impl SessionSummary {
    fn from_session(session: AgentSession, online_window_secs: u64) -> Self {
        let online = session.is_online(online_window_secs, Utc::now());
        Self {
            account_id: session.account_id,
            online,
            heartbeat: session.heartbeat,
            agent_version: session.agent_version,
            balance: session.snapshot.balance,
            equity: session.snapshot.equity,
            open_positions: session.positions.len(),
            last_analysis_at: session.last_analysis_at,
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> Response {
    match state.store.list_sessions().await {
        Ok(sessions) => {
            let window = state.config.agent.online_window_secs;
            let summaries: Vec<SessionSummary> = sessions
                .into_iter()
                .map(|s| SessionSummary::from_session(s, window))
                .collect();
            Json(json!({ "success": true, "sessions": summaries })).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn error_response(e: MtLinkError) -> Response {
    let status = match &e {
        MtLinkError::Validation(_) => StatusCode::BAD_REQUEST,
        MtLinkError::SessionOffline(_) => StatusCode::CONFLICT,
        MtLinkError::CommandNotFound(_) => StatusCode::NOT_FOUND,
        MtLinkError::Auth(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "success": false, "error": e.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ProtocolHandler;
    use crate::config::tests_support::test_config;
    use crate::persistence::{MemoryStore, Store};
    use crate::strategy::{FixedMoneyManager, HoldStrategy};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(test_config()); // agent_key = "secret"
        let handler = Arc::new(ProtocolHandler::new(
            store.clone(),
            Arc::new(HoldStrategy),
            Arc::new(FixedMoneyManager::new(dec!(0.01))),
            config.clone(),
        ));
        let state = AppState::new(store.clone(), handler, config);
        (router(state), store)
    }

    fn sync_body() -> String {
        json!({
            "accountId": "ACC1",
            "symbol": "XAUUSD",
            "account": {
                "balance": "1000",
                "equity": "1000",
                "freeMargin": "900",
                "leverage": 100,
                "currency": "USD"
            }
        })
        .to_string()
    }

    async fn json_of(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_is_open() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sync_rejected_without_key_and_leaves_no_trace() {
        let (app, store) = app();
        let response = app
            .oneshot(
                Request::post("/api/agent/sync")
                    .header("content-type", "application/json")
                    .body(Body::from(sync_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_of(response).await;
        assert_eq!(body["success"], false);
        // The reject happened before the handler: no session was cached
        assert!(store.get_session("ACC1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_rejected_with_wrong_key() {
        let (app, store) = app();
        let response = app
            .oneshot(
                Request::post("/api/agent/sync")
                    .header("content-type", "application/json")
                    .header("x-agent-key", "not-the-secret")
                    .body(Body::from(sync_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.get_session("ACC1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_with_key_caches_session() {
        let (app, store) = app();
        let response = app
            .oneshot(
                Request::post("/api/agent/sync")
                    .header("content-type", "application/json")
                    .header("x-agent-key", "secret")
                    .body(Body::from(sync_body()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_of(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["commandCount"], 0);
        assert!(store.get_session("ACC1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_manual_command_offline_conflict() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::post("/api/agent/commands")
                    .header("content-type", "application/json")
                    .header("x-agent-key", "secret")
                    .body(Body::from(
                        json!({
                            "accountId": "ACC1",
                            "kind": "BUY",
                            "symbol": "XAUUSD"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_sessions_listing() {
        let (app, _) = app();

        // Push a session through the real sync endpoint first
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/agent/sync")
                    .header("content-type", "application/json")
                    .header("x-agent-key", "secret")
                    .body(Body::from(sync_body()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/api/agent/sessions")
                    .header("x-agent-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_of(response).await;
        assert_eq!(body["sessions"][0]["accountId"], "ACC1");
        assert_eq!(body["sessions"][0]["online"], true);
    }
}
