pub mod health;
pub mod metrics;

use axum::http::{Method, Uri};

use crate::error::ApiError;

pub async fn not_found(method: Method, uri: Uri) -> ApiError {
    ApiError::NotFound(format!("Route {} {} not found", method, uri.path()))
}
