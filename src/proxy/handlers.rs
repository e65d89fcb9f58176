//! HTTP request handlers.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Extension, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};

use super::auth::Authorized;
use super::server::{AppState, RequestId};
use super::stream::relay;
use super::types::ChatPayload;
use crate::error::Error;

/// Handle GET /
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Server is running"
    }))
}

/// Handle POST /v1/chat/completions
///
/// The upstream status is checked before any response byte is sent, so
/// upstream failures surface with their own status code. Once streaming has
/// begun, failures can only cut the body short.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    _auth: Authorized,
    body: Result<Json<ChatPayload>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(mut payload) = body?;
    payload.force_stream();

    tracing::info!(
        request_id = %request_id.0,
        model = ?payload.model(),
        "Received chat completion request"
    );

    let lines = state.upstream.stream_chat(&payload).await?;
    let frames = relay(lines, request_id.0.to_string());

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}
