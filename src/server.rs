use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::any::Any;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::require_bearer;
use crate::config::MAX_BODY_BYTES;
use crate::error::ApiError;
use crate::metrics::{ApiDetails, E2eDetails, Flavor};
use crate::routes::{health, metrics, not_found};
use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin);

    let protected = Router::new()
        .route("/api/metrics/summary", get(metrics::summary))
        .route(
            &collection_path(Flavor::Api),
            get(metrics::list_metrics::<ApiDetails>).post(metrics::submit_metrics::<ApiDetails>),
        )
        .route(
            &collection_path(Flavor::E2e),
            get(metrics::list_metrics::<E2eDetails>).post(metrics::submit_metrics::<E2eDetails>),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health::health))
        .merge(protected)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub fn collection_path(flavor: Flavor) -> String {
    format!("/api/metrics/{}", flavor.collection())
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics server listening on http://{}", addr);
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Handler panicked: {}", detail);
    ApiError::Internal("Internal server error").into_response()
}
