use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::fmt;
use tracing::{error, warn};

use super::types::ErrorResponse;

pub const TEXT_TOO_LONG: &str = "Teks maksimal 500 karakter.";
pub const MALFORMED_BODY: &str = "Body permintaan harus berupa JSON yang valid.";
pub const GENERATION_FAILED: &str = "Gagal menghasilkan parafrase.";

#[derive(Debug)]
pub enum ApiError {
    TextTooLong { chars: usize },
    MalformedBody(String),
    /// Model or runtime failure; the cause is only logged.
    Generation(anyhow::Error),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::TextTooLong { chars } => write!(f, "text too long ({chars} chars)"),
            ApiError::MalformedBody(reason) => write!(f, "malformed body: {reason}"),
            ApiError::Generation(err) => write!(f, "generation failed: {err:#}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Generation(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::TextTooLong { .. } => (StatusCode::BAD_REQUEST, TEXT_TOO_LONG),
            ApiError::MalformedBody(_) => (StatusCode::BAD_REQUEST, MALFORMED_BODY),
            ApiError::Generation(_) => (StatusCode::INTERNAL_SERVER_ERROR, GENERATION_FAILED),
        };

        if status.is_server_error() {
            error!("{self}");
        } else {
            warn!("{self}");
        }

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
