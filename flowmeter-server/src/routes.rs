use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::BoxError;
use tower::ServiceBuilder;

use crate::handlers;
use crate::AppState;

/// Assembles the service router.
///
/// The metrics endpoint path comes from configuration; everything else is
/// fixed. The timeout layer is the outermost: it bounds the whole request,
/// including the admission path.
pub fn build_router(
    state: AppState,
    metrics_handle: PrometheusHandle,
    metrics_endpoint: &str,
    request_timeout: Duration,
) -> Router {
    Router::new()
        .route("/collect", post(handlers::collect))
        .route("/qps", get(handlers::qps))
        .route("/stats", get(handlers::stats))
        .route("/limiter/rate", post(handlers::set_limiter_rate))
        .route("/limiter/toggle", post(handlers::toggle_limiter))
        .route("/healthz", get(handlers::healthz))
        .route(
            metrics_endpoint,
            get(move || std::future::ready(metrics_handle.render())),
        )
        .layer(middleware::from_fn(handlers::track_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .timeout(request_timeout),
        )
        .with_state(state)
}

async fn handle_middleware_error(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}
