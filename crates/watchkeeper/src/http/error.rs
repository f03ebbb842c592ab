//! HTTP error mapping.
//!
//! Validation problems surface synchronously as 4xx; policy denials never
//! come through here (they ride in per-action decision arrays with 200).
//! Store trouble is 503, duplicates 409, everything else 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;
use watchkeeper_db::DbError;
use watchkeeper_protocol::ReasonCode;

#[derive(Debug)]
pub enum ApiError {
    Validation {
        message: String,
        code: Option<ReasonCode>,
    },
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code: None,
        }
    }

    pub fn validation_code(code: ReasonCode, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::validation_code(ReasonCode::SchemaViolation, message)
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::DuplicateEventId(id) => {
                Self::Conflict(format!("duplicate event id: {id}"))
            }
            DbError::Sqlx(_) | DbError::Io(_) => Self::Unavailable(err.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            ApiError::Validation { message, code } => (StatusCode::BAD_REQUEST, message, code),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message, None),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message, Some(ReasonCode::DuplicateEventId)),
            ApiError::Unavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                message,
                Some(ReasonCode::StoreUnavailable),
            ),
            ApiError::Internal(err) => {
                error!(error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None)
            }
        };
        let mut body = json!({"ok": false, "error": message});
        if let Some(code) = code {
            body["reason_code"] = json!(code.as_str());
        }
        (status, Json(body)).into_response()
    }
}
