//! HTTP route handlers for the UI API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, patch, post};
use chrono::Utc;
use harness::coordinator::{ExecuteRequest, Session, SessionSummary};
use harness::core::policy::{PolicyConfig, PolicyEngine, PolicyUpdate, RuleListing};
use harness::core::types::{OperationKind, WorkflowMode};
use harness::io::config::{load_config, write_config};
use harness::io::git::Git;
use harness::protocol::ApprovalDecision;
use harness::tasks::{BoardResponse, TaskUpdateRequest, load_board, update_task};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn internal(err: &anyhow::Error) -> ApiError {
    warn!(error = %format!("{err:#}"), "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/plans", get(get_plans))
        .route("/plans/task", patch(patch_task))
        .route("/plans/handoff", get(get_handoff))
        .route("/policy", get(get_policy).put(put_policy))
        .route("/policy/rules", get(get_rules))
        .route("/agent/execute", post(execute))
        .route("/agent/sessions", get(list_sessions))
        .route("/agent/sessions/{id}", get(get_session))
        .route("/agent/sessions/{id}/interrupt", post(interrupt))
        .route("/agent/sessions/{id}/pending", get(pending))
        .route("/agent/tool-approval", post(tool_approval))
        .route("/deliver/check", post(deliver_check))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Default, Deserialize)]
struct ModeQuery {
    mode: Option<String>,
}

impl ModeQuery {
    fn resolve(&self, default: WorkflowMode) -> WorkflowMode {
        match self.mode.as_deref() {
            Some(raw) => WorkflowMode::from_param(Some(raw)),
            None => default,
        }
    }
}

/// GET /api/plans?mode=solo|2agent
async fn get_plans(
    State(state): State<AppState>,
    Query(query): Query<ModeQuery>,
) -> Result<Json<BoardResponse>, ApiError> {
    let mode = query.resolve(state.workflow_mode);
    load_board(&state.project_dir, mode)
        .map(Json)
        .map_err(|err| internal(&err))
}

/// GET /api/plans/handoff - two-agent handoff counts.
async fn get_handoff(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let board = load_board(&state.project_dir, WorkflowMode::TwoAgent).map_err(|err| internal(&err))?;
    match board.handoff {
        Some(handoff) => Ok(Json(json!(handoff))),
        None => Err(api_error(StatusCode::NOT_FOUND, "no handoff status")),
    }
}

/// PATCH /api/plans/task - guarded marker transition.
async fn patch_task(
    State(state): State<AppState>,
    Json(request): Json<TaskUpdateRequest>,
) -> Response {
    let project_dir = state.project_dir.clone();
    let mode = state.workflow_mode;
    let result =
        tokio::task::spawn_blocking(move || update_task(&project_dir, &request, mode)).await;
    match result {
        Ok(Ok(success)) => Json(success).into_response(),
        Ok(Err(err)) => {
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(err.to_body())).into_response()
        }
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// GET /api/policy - active policy configuration.
async fn get_policy(State(state): State<AppState>) -> Json<PolicyConfig> {
    Json(state.coordinator.policy().read().await.config().clone())
}

/// PUT /api/policy - partial update, applied immediately and persisted.
async fn put_policy(
    State(state): State<AppState>,
    Json(update): Json<PolicyUpdate>,
) -> Result<Json<PolicyConfig>, ApiError> {
    let _guard = state.config_write.lock().await;
    let config_path = state.config_path();
    let mut file_config = load_config(&config_path).map_err(|err| internal(&err))?;

    let updated = {
        let mut engine = state.coordinator.policy().write().await;
        let previous = engine.config().clone();
        engine
            .update(update, Utc::now())
            .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
        file_config.policy = engine.config().clone();
        if let Err(err) = write_config(&config_path, &file_config) {
            // Keep memory and disk in agreement.
            *engine = PolicyEngine::new(previous)
                .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            return Err(internal(&err));
        }
        engine.config().clone()
    };
    info!(preset = ?updated.preset, custom_rules = updated.rules.len(), "policy updated");
    Ok(Json(updated))
}

/// GET /api/policy/rules - rules by tier.
async fn get_rules(State(state): State<AppState>) -> Json<RuleListing> {
    Json(state.coordinator.policy().read().await.rules())
}

#[derive(Serialize)]
struct ExecuteResponse {
    session_id: String,
}

/// POST /api/agent/execute - start a session; returns before it finishes.
async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    let session_id = state
        .coordinator
        .execute(request)
        .await
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    Ok((StatusCode::ACCEPTED, Json(ExecuteResponse { session_id })))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.coordinator.list_sessions().await)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .coordinator
        .get_session(&id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("session {id} not found")))
}

/// POST /api/agent/sessions/{id}/interrupt
async fn interrupt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.coordinator.interrupt(&id).await {
        Ok(Json(json!({ "success": true, "session_id": id })))
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no running session {id}"),
        ))
    }
}

async fn pending(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    Json(json!({ "pending": state.coordinator.pending_approvals(&id).await }))
}

/// POST /api/agent/tool-approval - HTTP alternative to the socket response.
async fn tool_approval(
    State(state): State<AppState>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<Json<Value>, ApiError> {
    let tool_use_id = decision.tool_use_id.clone();
    if state.coordinator.broker().submit_decision(decision).await {
        Ok(Json(json!({ "success": true, "tool_use_id": tool_use_id })))
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no pending approval for {tool_use_id}"),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct DeliverRequest {
    operation: OperationKind,
    #[serde(default)]
    force: bool,
}

/// POST /api/deliver/check - evaluate a git delivery with live branch facts.
async fn deliver_check(
    State(state): State<AppState>,
    Json(request): Json<DeliverRequest>,
) -> Result<Json<Value>, ApiError> {
    if !request.operation.is_git() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("{} is not a delivery operation", request.operation),
        ));
    }
    let git = Git::new(&state.project_dir);
    let preflight = tokio::task::spawn_blocking(move || git.preflight())
        .await
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map_err(|err| api_error(StatusCode::CONFLICT, format!("preflight failed: {err:#}")))?;
    let decision = state
        .coordinator
        .check_delivery(request.operation, &preflight, request.force)
        .await;
    Ok(Json(json!({
        "operation": request.operation,
        "preflight": preflight,
        "decision": decision,
    })))
}
