use crate::drive::DriveError;
use crate::portfolio::ValidationError;
use crate::saving::SaveError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::error;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced at the HTTP boundary
///
/// Every variant renders as `{"error": ..., "details"?: ...}`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    NotFound {
        message: String,
        suggestion: Option<String>,
    },

    #[error("{0}")]
    BadRequest(String),

    #[error("Portfolio validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] DriveError),

    #[error("Portfolio file is corrupted")]
    Corrupted,

    #[error("{0}")]
    Internal(String),

    #[error("Not implemented")]
    NotImplemented,
}

impl From<SaveError> for AppError {
    fn from(err: SaveError) -> Self {
        match err {
            SaveError::Validation(err) => AppError::Validation(err),
            SaveError::Storage(err) => AppError::Storage(err),
            SaveError::Encode(err) => AppError::Internal(err.to_string()),
        }
    }
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound {
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Storage(err) => match err {
                DriveError::QuotaExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
                DriveError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                DriveError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                DriveError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Corrupted | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Body for failures of the save pipeline, worded for end users
    ///
    /// Validation failures keep their specific message.
    pub fn save_failure(self) -> Response {
        if matches!(self, AppError::Validation(_)) {
            return self.into_response();
        }
        let status = match self.status() {
            status @ (StatusCode::INSUFFICIENT_STORAGE
            | StatusCode::FORBIDDEN
            | StatusCode::UNAUTHORIZED) => status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let (message, details) = match status {
            StatusCode::INSUFFICIENT_STORAGE => (
                "Storage temporarily full. Please contact the administrator.".to_string(),
                "The temporary storage is at capacity. This will be resolved shortly.".to_string(),
            ),
            StatusCode::FORBIDDEN => (
                "Access denied. Please ensure you are using the correct account and try again."
                    .to_string(),
                "You can only save and update portfolios under your own authenticated account."
                    .to_string(),
            ),
            StatusCode::UNAUTHORIZED => (
                "Authentication failed. Please sign in again.".to_string(),
                "Your authentication token may have expired.".to_string(),
            ),
            _ => (
                "Internal server error. Please try again later.".to_string(),
                "Contact support if this persists.".to_string(),
            ),
        };
        if status.is_server_error() {
            error!("[Save] {}", self);
        }
        (status, Json(json!({ "error": message, "details": details }))).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{}", self);
        }

        let body = match &self {
            AppError::NotFound {
                message,
                suggestion: Some(suggestion),
            } => json!({ "error": message, "suggestion": suggestion }),
            AppError::Corrupted => json!({
                "error": self.to_string(),
                "details": "Please contact support",
            }),
            _ => json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_statuses() {
        let cases = [
            (DriveError::QuotaExceeded("full".into()), StatusCode::INSUFFICIENT_STORAGE),
            (DriveError::PermissionDenied("no".into()), StatusCode::FORBIDDEN),
            (DriveError::Unauthorized("exp".into()), StatusCode::UNAUTHORIZED),
            (DriveError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (
                DriveError::Api { status: 502, message: "bad gateway".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn validation_errors_are_bad_requests() {
        let err = AppError::from(ValidationError::InvalidRollNumber);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.to_string(),
            "Portfolio validation failed: Invalid roll number format"
        );
    }

    #[test]
    fn save_failures_use_friendly_bodies() {
        let response = AppError::from(DriveError::QuotaExceeded("full".into())).save_failure();
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);

        let response = AppError::from(SaveError::Validation(ValidationError::InvalidRollNumber))
            .save_failure();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
