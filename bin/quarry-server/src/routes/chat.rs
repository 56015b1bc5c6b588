//! Question-answering routes.
//!
//! `POST /chat/ask` waits for the whole narration and returns it with the
//! plan and rows.  `POST /chat/ask/stream` returns an event stream of
//! `start` / `chunk` / `complete` | `error` frames followed by `[DONE]`.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use quarry_core::GatewayError;
use quarry_core::relay::relay;
use tracing::{Instrument, debug, info};
use utoipa::OpenApi;
use validator::Validate;

use crate::error::ServerError;
use crate::schemas::chat::{AskRequest, AskResponse, ErrorResponse, QueryFailureBody, TechnicalInsights};
use crate::state::AppState;
use crate::stream;

#[derive(OpenApi)]
#[openapi(
    paths(ask, ask_stream),
    components(schemas(AskRequest, AskResponse, TechnicalInsights, QueryFailureBody, ErrorResponse))
)]
pub struct ChatApi;

/// Register chat routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/ask", post(ask))
        .route("/chat/ask/stream", post(ask_stream))
}

/// Reject malformed or out-of-range bodies before any upstream call.
fn validated(payload: Result<Json<AskRequest>, JsonRejection>) -> Result<String, ServerError> {
    let Json(req) = payload.map_err(|rejection| ServerError::BadRequest(rejection.body_text()))?;
    req.validate()
        .map_err(|e| GatewayError::Validation(e.to_string()))?;
    if req.message.trim().is_empty() {
        return Err(GatewayError::Validation("message: must not be blank".into()).into());
    }
    Ok(req.message)
}

/// Answer a question in one response.
#[utoipa::path(
    post,
    path = "/chat/ask",
    tag = "chat",
    request_body = AskRequest,
    responses(
        (status = 200, description = "Question answered", body = AskResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 500, description = "Processing failed", body = ErrorResponse),
    )
)]
pub async fn ask(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, ServerError> {
    let prompt = validated(payload)?;
    debug!(prompt_len = prompt.chars().count(), "ask");

    let answer = state.gateway.orchestrator().answer(&prompt).await?;
    info!(
        request_id = %answer.response.plan.request_id,
        rows = answer.response.result.rows.len(),
        "question answered"
    );
    Ok(Json(AskResponse::from(answer)))
}

/// Answer a question as an event stream.
///
/// Frames are `data: <json>\n\n`; the stream always ends with
/// `data: [DONE]\n\n` unless the client leaves first.
#[utoipa::path(
    post,
    path = "/chat/ask/stream",
    tag = "chat",
    request_body = AskRequest,
    responses(
        (status = 200, description = "Event stream of narration frames", content_type = "text/event-stream", body = String),
        (status = 400, description = "Invalid request", body = ErrorResponse),
    )
)]
pub async fn ask_stream(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response, ServerError> {
    let prompt = validated(payload)?;
    debug!(prompt_len = prompt.chars().count(), "ask stream");

    let events = state.gateway.orchestrator().answer_stream(prompt);
    let (mut sink, body) = stream::channel(stream::BODY_CAPACITY);
    tokio::spawn(
        async move {
            let outcome = relay(events, &mut sink).await;
            debug!(?outcome, "stream relay finished");
        }
        .instrument(tracing::Span::current()),
    );

    Ok(stream::event_stream(body))
}
