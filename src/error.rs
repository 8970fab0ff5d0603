use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Every failure an ingestion route can answer with.
///
/// `Internal` carries only the client-facing message; the cause is logged
/// where the error is raised and never serialized.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing Authorization header")]
    MissingAuthHeader,

    #[error("Invalid authentication scheme. Expected: Bearer")]
    InvalidScheme,

    #[error("Missing authentication token")]
    MissingToken,

    #[error("Server authentication not configured")]
    AuthNotConfigured,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(&'static str),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingAuthHeader => StatusCode::UNAUTHORIZED,
            ApiError::InvalidScheme => StatusCode::UNAUTHORIZED,
            ApiError::MissingToken => StatusCode::UNAUTHORIZED,
            ApiError::AuthNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InvalidToken => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn category(&self) -> &'static str {
        match self {
            ApiError::MissingAuthHeader | ApiError::InvalidScheme | ApiError::MissingToken => {
                "Unauthorized"
            }
            ApiError::AuthNotConfigured => "Server Configuration Error",
            ApiError::InvalidToken => "Forbidden",
            ApiError::BadRequest(_) => "Bad Request",
            ApiError::NotFound(_) => "Not Found",
            ApiError::Internal(_) => "Internal Server Error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.category(),
            "message": self.to_string(),
        });

        (self.status(), axum::Json(body)).into_response()
    }
}
