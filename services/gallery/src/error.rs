//! Error types for the read side of the gallery.
//!
//! Traversal attempts and missing files both surface as [`GalleryError::NotFound`]
//! so a caller learns nothing about the internal directory structure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors returned by the sanitizer and the serving layer
#[derive(Debug, Error)]
pub enum GalleryError {
    /// Sanitization left nothing usable (400)
    #[error("Invalid identifier")]
    InvalidIdentifier,

    /// Extension outside the image allow-list (400)
    #[error("Invalid file type")]
    InvalidFileType,

    /// File absent, or resolved path escaped its base directory (404)
    #[error("File not found")]
    NotFound,

    /// Unexpected I/O failure while reading the store (500)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GalleryError {
    /// Machine-readable code used in response bodies
    pub fn code(&self) -> &'static str {
        match self {
            GalleryError::InvalidIdentifier => "INVALID_IDENTIFIER",
            GalleryError::InvalidFileType => "INVALID_FILE_TYPE",
            GalleryError::NotFound => "NOT_FOUND",
            GalleryError::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            GalleryError::InvalidIdentifier | GalleryError::InvalidFileType => {
                StatusCode::BAD_REQUEST
            }
            GalleryError::NotFound => StatusCode::NOT_FOUND,
            GalleryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: String,
}

impl IntoResponse for GalleryError {
    fn into_response(self) -> Response {
        // I/O details may carry paths; keep them in the logs only.
        let message = match &self {
            GalleryError::Io(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: message,
            code: self.code().to_string(),
        });

        (self.status(), body).into_response()
    }
}

/// Result type for serving-layer operations
pub type GalleryResult<T> = Result<T, GalleryError>;
