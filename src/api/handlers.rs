//! Route handlers
//!
//! Submitting a message and reading its event stream are two requests: the
//! submit endpoint parks the text in the pending store and returns a token,
//! the stream endpoint consumes the token and runs the turn.

use super::sse;
use super::types::{ConversationResponse, SubmitMessageRequest, SubmitMessageResponse};
use super::AppState;
use crate::db::DbError;
use crate::orchestrator::PendingStore;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/conversations", post(create_conversation))
        .route("/api/v1/conversations/:id", get(get_conversation))
        .route("/api/v1/conversations/:id/messages", post(submit_message))
        .route(
            "/api/v1/conversations/:id/messages/:message_id/stream",
            get(stream_message),
        )
        .with_state(state)
}

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::Internal(m) => {
                tracing::error!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConversationNotFound(_) | DbError::UserNotFound(_) => {
                AppError::NotFound(e.to_string())
            }
            _ => AppError::Internal(e.to_string()),
        }
    }
}

async fn create_conversation(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ConversationResponse>), AppError> {
    let conversation = state.db.create_conversation()?;
    tracing::info!(conv_id = %conversation.id, "Created conversation");
    Ok((
        StatusCode::CREATED,
        Json(ConversationResponse {
            conversation,
            messages: Vec::new(),
            user: None,
        }),
    ))
}

async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, AppError> {
    let conversation = state.db.get_conversation(&id)?;
    let messages = state.db.get_messages(&id)?;
    let user = match conversation.user_id.filter(|_| conversation.is_authenticated) {
        Some(user_id) => Some(state.db.get_user(user_id)?.public()),
        None => None,
    };
    Ok(Json(ConversationResponse {
        conversation,
        messages,
        user,
    }))
}

async fn submit_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubmitMessageRequest>,
) -> Result<Json<SubmitMessageResponse>, AppError> {
    let text = body.message.trim();
    if text.is_empty() {
        return Err(AppError::BadRequest("Message must not be empty".to_string()));
    }

    // Validate the conversation before parking the message
    state.db.get_conversation(&id)?;

    let message_id = state.pending.enqueue(&id, text).await;
    tracing::debug!(conv_id = %id, message_id = %message_id, "Queued message");
    Ok(Json(SubmitMessageResponse { message_id }))
}

async fn stream_message(
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    state.db.get_conversation(&id)?;
    let text = state
        .pending
        .consume(&message_id, &id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;

    let (tx, rx) = mpsc::channel(64);
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        orchestrator.run(&id, &text, tx).await;
    });

    Ok(sse::stream_events(rx).into_response())
}
