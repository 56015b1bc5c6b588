//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become the
//! `{ "success": false, "error": "..." }` envelope.  Processing failures are
//! returned with their message unchanged.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quarry_core::GatewayError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// All errors that can occur in the quarry-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the gateway pipeline.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The caller sent an invalid or malformed request.
    #[error("{0}")]
    BadRequest(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) | ServerError::Gateway(GatewayError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            ServerError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "request rejected");
        }
        (
            status,
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use quarry_core::WarehouseError;

    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let err = ServerError::from(GatewayError::Validation("message is required".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ServerError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn processing_errors_keep_their_message() {
        let err = ServerError::from(GatewayError::from(WarehouseError::from_message(
            "SQL compilation error: invalid identifier 'REGON'",
        )));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "SQL compilation error: invalid identifier 'REGON'");
    }
}
