//! Bearer-token authentication for the protected ingestion routes.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::error::ApiError;
use crate::state::SharedState;

/// Middleware rejecting requests before they reach a handler unless they
/// carry `Authorization: Bearer <server key>`.
pub async fn require_bearer(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .map(|value| value.to_str().unwrap_or_default());

    if let Err(e) = check_authorization(header, state.api_key.as_deref()) {
        match e {
            ApiError::AuthNotConfigured => {
                error!("METRICS_API_KEY not configured; rejecting {}", request.uri().path())
            }
            _ => warn!("Rejected {} {}: {}", request.method(), request.uri().path(), e),
        }
        return Err(e);
    }

    Ok(next.run(request).await)
}

/// Validate an `Authorization` header value against the expected token.
///
/// Checks run in a fixed order: header present, `Bearer` scheme, token
/// present, server key configured, token matches.
pub fn check_authorization(header: Option<&str>, expected: Option<&str>) -> Result<(), ApiError> {
    let header = header
        .filter(|h| !h.is_empty())
        .ok_or(ApiError::MissingAuthHeader)?;

    let mut parts = header.split(' ');
    let scheme = parts.next().unwrap_or_default();
    if scheme != "Bearer" {
        return Err(ApiError::InvalidScheme);
    }

    let token = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingToken)?;

    let expected = expected
        .filter(|key| !key.is_empty())
        .ok_or(ApiError::AuthNotConfigured)?;

    // Equal-length digests, so the comparison cost doesn't track the key.
    if Sha256::digest(token.as_bytes()) != Sha256::digest(expected.as_bytes()) {
        return Err(ApiError::InvalidToken);
    }

    Ok(())
}
