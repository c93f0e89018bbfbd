//! Read-mostly REST endpoints backing reconnect, history, and dashboards.
//! Error bodies are `{ "success": false, "message": ..., "code": ... }`.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use livedesk_common::models::StaffRole;
use livedesk_common::Error;

use crate::auth::AuthedStaff;
use crate::gateway::AppState;
use crate::services::{stats, Placement};

/// Rough wait estimate surfaced to the widget, in seconds per queue slot.
const WAIT_ESTIMATE_PER_POSITION_SECS: u64 = 120;

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "SESSION_NOT_FOUND" => StatusCode::NOT_FOUND,
            "NOT_ASSIGNED" | "NOT_ONLINE" => StatusCode::FORBIDDEN,
            "ALREADY_ASSIGNED" | "AT_CAPACITY" | "TARGET_NOT_ONLINE" | "TARGET_AT_CAPACITY" => {
                StatusCode::CONFLICT
            }
            "EMPTY_MESSAGE" | "INVALID_RATING" | "INVALID_SESSION" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "success": false,
            "message": self.0.to_string(),
            "code": code,
        });
        (status, Json(body)).into_response()
    }
}

fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(text) = value.to_str() {
            if let Some(token) = text.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    query_token.map(String::from)
}

async fn require_staff(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<AuthedStaff, ApiError> {
    let token = bearer_token(headers, query_token)
        .ok_or_else(|| ApiError(Error::Auth("missing bearer token".to_string())))?;
    Ok(state.authenticator.authenticate(&token).await?)
}

async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<AuthedStaff, ApiError> {
    let staff = require_staff(state, headers, query_token).await?;
    if staff.role != StaffRole::Admin {
        return Err(ApiError(Error::Auth("admin role required".to_string())));
    }
    Ok(staff)
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

// ---------- customer endpoints ----------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInitBody {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub source_url: Option<String>,
}

pub async fn chat_init(
    State(state): State<AppState>,
    Json(body): Json<ChatInitBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .session_service
        .start_chat(body.customer_name, body.customer_email, body.source_url)
        .await?;

    let mut response = json!({
        "success": true,
        "sessionId": outcome.session.session_id,
        "customerToken": outcome.session.customer_token,
    });
    match outcome.placement {
        Placement::Assigned { record, agent } => {
            response["assigned"] = json!({
                "cs": {
                    "id": record.agent.user_id,
                    "name": agent.as_ref().map(|u| u.public_name().to_string()),
                },
            });
        }
        Placement::Queued { position } => {
            response["queue"] = json!({
                "position": position,
                "estimatedWaitTime": position as u64 * WAIT_ESTIMATE_PER_POSITION_SECS,
            });
        }
    }
    Ok(Json(response))
}

pub async fn chat_session(
    State(state): State<AppState>,
    Path(customer_token): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (session, messages, agent) = state
        .session_service
        .restore_by_token(&customer_token)
        .await?;
    Ok(Json(json!({
        "success": true,
        "session": session,
        "messages": messages,
        "assignedCs": agent.map(|u| json!({ "id": u.user_id, "name": u.public_name() })),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRatingBody {
    pub customer_token: String,
    pub rating: i32,
    pub feedback: Option<String>,
}

pub async fn chat_rating(
    State(state): State<AppState>,
    Json(body): Json<ChatRatingBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .session_service
        .sessions()
        .get_by_token(&body.customer_token)
        .await?
        .ok_or_else(|| Error::SessionNotFound("unknown customer token".to_string()))?;
    state
        .session_service
        .rate(session.session_id, body.rating, body.feedback.as_deref())
        .await?;
    Ok(Json(json!({ "success": true })))
}

// ---------- agent endpoints ----------

pub async fn cs_active_chats(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let staff = require_staff(&state, &headers, query.token.as_deref()).await?;
    let chats = state
        .session_service
        .sessions()
        .active_for_agent(staff.user_id)
        .await?;
    Ok(Json(json!({ "success": true, "data": chats })))
}

pub async fn cs_queue(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_staff(&state, &headers, query.token.as_deref()).await?;
    let waiting = state.session_service.sessions().waiting_ordered().await?;
    let entries: Vec<_> = waiting
        .iter()
        .enumerate()
        .map(|(idx, s)| json!({ "position": idx + 1, "session": s }))
        .collect();
    Ok(Json(json!({ "success": true, "data": entries })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub token: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn cs_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_staff(&state, &headers, query.token.as_deref()).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);
    let sessions = state
        .session_service
        .sessions()
        .history(limit, offset)
        .await?;
    Ok(Json(json!({ "success": true, "data": sessions })))
}

/// Active staff with their live presence, for transfer target pickers.
pub async fn cs_agents(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_staff(&state, &headers, query.token.as_deref()).await?;
    let users = state.session_service.users().list_active().await?;
    let entries: Vec<_> = users
        .iter()
        .map(|u| {
            json!({
                "id": u.user_id,
                "name": u.public_name(),
                "role": u.role,
                "presence": state.registry.get(u.user_id),
            })
        })
        .collect();
    Ok(Json(json!({ "success": true, "data": entries })))
}

pub async fn cs_canned_responses(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_staff(&state, &headers, query.token.as_deref()).await?;
    let canned = state.canned.list_active().await?;
    Ok(Json(json!({ "success": true, "data": canned })))
}

// ---------- admin endpoints ----------

pub async fn admin_stats(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers, query.token.as_deref()).await?;
    let waiting = state.session_service.sessions().waiting_ordered().await?;
    let snapshot = stats::snapshot(&waiting, &state.registry);
    Ok(Json(json!({ "success": true, "data": snapshot })))
}

pub async fn admin_activity(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_admin(&state, &headers, query.token.as_deref()).await?;
    let entries = state.activity.recent(100).await?;
    Ok(Json(json!({ "success": true, "data": entries })))
}
