use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

/// Request-terminal errors. Every variant maps to one status code and a
/// machine-readable `error` field so the client can tell a ban from a mute.
#[derive(Debug)]
pub enum AppError {
    Unauthorized,
    Forbidden {
        reason: &'static str,
        message: String,
    },
    NotFound(String),
    InvalidInput(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl AppError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: "forbidden",
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// The machine-readable reason carried in the response body.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden { reason, .. } => reason,
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Forbidden { reason, message } => write!(f, "forbidden ({reason}): {message}"),
            Self::NotFound(what) => write!(f, "{what} not found"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, reason, message) = match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "sign in to do that".to_owned(),
            ),
            Self::Forbidden { reason, message } => (StatusCode::FORBIDDEN, reason, message),
            Self::NotFound(what) => {
                (StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
            }
            Self::InvalidInput(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_input", message)
            }
            Self::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            Self::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "something went wrong".to_owned(),
                )
            }
        };

        (status, Json(json!({ "error": reason, "message": message }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
