// Error type returned by the HTTP handlers.

use super::models::ErrorBody;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt::Display;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    /// The upload was rejected; the message is shown to the client as is.
    BadRequest(String),
    /// Something failed on our side after the upload was accepted.
    Internal {
        message: String,
        details: Option<String>,
    },
}

impl ApiError {
    /// Logs `source` in full and builds a 500 carrying a generic `message`.
    /// The source is only exposed to the client when `verbose` is set.
    pub fn internal(message: &str, source: &dyn Display, verbose: bool) -> Self {
        error!("{}: {}", message, source);
        Self::Internal {
            message: message.to_string(),
            details: verbose.then(|| source.to_string()),
        }
    }

    pub fn too_large(max_file_size: usize) -> Self {
        Self::BadRequest(format!(
            "The image is too large. The maximum file size is {}.",
            format_size(max_file_size)
        ))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: message,
                    details: None,
                },
            ),
            Self::Internal { message, details } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: message,
                    details,
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}

fn format_size(bytes: usize) -> String {
    const KIB: usize = 1024;
    const MIB: usize = 1024 * 1024;
    if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
