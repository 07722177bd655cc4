//! Closed error taxonomy for the gateway (spec.md §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("agent {0} is not connected")]
    AgentOffline(String),
    #[error("validation rejected: {0}")]
    ValidationRejected(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            GatewayError::AgentOffline(_) => (StatusCode::CONFLICT, "agent_offline"),
            GatewayError::ValidationRejected(_) => (StatusCode::BAD_REQUEST, "validation_rejected"),
            GatewayError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ErrorBody {
            code,
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}
