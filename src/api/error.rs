use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::error::{CommandError, GatewayError};

/// Errors returned from API handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    /// A command the router refused, with its stable reason code
    #[error("Command rejected: {0}")]
    Command(CommandError),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Command(err) => match err {
                CommandError::UnknownTarget { .. } => StatusCode::NOT_FOUND,
                CommandError::OutOfRange { .. } | CommandError::NotFinite { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                CommandError::TargetBusy(_) => StatusCode::CONFLICT,
                CommandError::QueueFull(_) | CommandError::TopologyChanged => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CommandError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NotFound",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::ValidationError(_) => "ValidationError",
            ApiError::Conflict(_) => "Conflict",
            ApiError::ServiceUnavailable(_) => "ServiceUnavailable",
            ApiError::InternalError(_) => "InternalServerError",
            ApiError::Command(_) => "CommandRejected",
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            ApiError::Command(err) => Some(err.code().to_string()),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if status.is_server_error() && !matches!(self, ApiError::Command(_)) {
            tracing::error!(error = %self, "API error occurred");
            "An internal error occurred".to_string()
        } else {
            tracing::debug!(error = %self, "Client error");
            self.to_string()
        };

        let body = ErrorResponse {
            error: self.error_type().to_string(),
            message,
            details: self.details(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<CommandError> for ApiError {
    fn from(error: CommandError) -> Self {
        ApiError::Command(error)
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Topology(e) => ApiError::ValidationError(e.to_string()),
            GatewayError::PointMap(e) => ApiError::ValidationError(e.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::InternalError(error.to_string())
    }
}
