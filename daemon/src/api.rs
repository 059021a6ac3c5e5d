//! HTTP endpoints for submitting messages and reading recent outcomes.
//!
//! - `POST /messages` - submit one message, returns its identifier
//! - `POST /messages/repeat?count=N` - submit the same message `N` times
//! - `GET /messages/success?limit=N` - most recent deliveries
//! - `GET /messages/failed?limit=N` - most recent exhausted messages
//! - `GET /health` - engine health, 503 when unhealthy

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use sms_retry_core::{MessageId, MessageRequest, MessageSummary};
use sms_retry_runtime::{EngineError, RetryEngine};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Upper bound on `count` for a repeat submission.
const MAX_REPEAT: i64 = 200_000;

const DEFAULT_HISTORY_LIMIT: i64 = 100;

/// Build the router over a shared engine.
pub fn router(engine: Arc<RetryEngine>) -> Router {
    Router::new()
        .route("/messages", post(send_one))
        .route("/messages/repeat", post(send_repeat))
        .route("/messages/success", get(recent_success))
        .route("/messages/failed", get(recent_failed))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ============================================================================
// Request and response types
// ============================================================================

/// Message submission body.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    /// Destination phone number
    pub phone: String,
    /// Message text
    pub body: String,
    /// Optional caller identifier, used for de-duplication
    #[serde(default)]
    pub id: Option<String>,
}

impl SendRequest {
    fn to_message_request(&self) -> MessageRequest {
        let request = MessageRequest::new(self.phone.clone(), self.body.clone());
        match &self.id {
            Some(id) => request.with_id(id.as_str()),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: MessageId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepeatResponse {
    count: usize,
    message_ids: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
struct RepeatQuery {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: i64,
}

const fn default_history_limit() -> i64 {
    DEFAULT_HISTORY_LIMIT
}

impl HistoryQuery {
    /// Requested limit; the engine clamps it further.
    fn limit(&self) -> usize {
        usize::try_from(self.limit.max(1)).unwrap_or(1)
    }
}

#[derive(Debug, Serialize)]
struct ComponentHealth {
    component: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    checks: Vec<ComponentHealth>,
}

/// Engine error mapped to an HTTP response.
#[derive(Debug)]
struct ApiError(EngineError);

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self.0 {
            EngineError::ShutdownInProgress => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_SERVER_ERROR"),
        };
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn send_one(
    State(engine): State<Arc<RetryEngine>>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    let id = engine.new_message(request.to_message_request()).await?;
    Ok(Json(SendResponse { message_id: id }))
}

/// Submits `count` messages one after another, clamped to `1..=200_000`.
async fn send_repeat(
    State(engine): State<Arc<RetryEngine>>,
    Query(query): Query<RepeatQuery>,
    Json(request): Json<SendRequest>,
) -> Result<Json<RepeatResponse>, ApiError> {
    let count = usize::try_from(query.count.clamp(1, MAX_REPEAT)).unwrap_or(1);
    let mut message_ids = Vec::with_capacity(count.min(10_000));

    for _ in 0..count {
        message_ids.push(engine.new_message(request.to_message_request()).await?);
    }

    Ok(Json(RepeatResponse { count, message_ids }))
}

#[allow(clippy::unused_async)]
async fn recent_success(
    State(engine): State<Arc<RetryEngine>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<MessageSummary>> {
    Json(engine.recent_success(query.limit()))
}

#[allow(clippy::unused_async)]
async fn recent_failed(
    State(engine): State<Arc<RetryEngine>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<MessageSummary>> {
    Json(engine.recent_failed(query.limit()))
}

#[allow(clippy::unused_async)]
async fn health(State(engine): State<Arc<RetryEngine>>) -> (StatusCode, Json<HealthResponse>) {
    let report = engine.health();
    let status = if report.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = HealthResponse {
        status: report.status.to_string(),
        checks: report
            .checks
            .into_iter()
            .map(|check| ComponentHealth {
                component: check.component,
                status: check.status.to_string(),
                message: check.message,
            })
            .collect(),
    };
    (status, Json(body))
}
