use std::num::NonZeroU64;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use metrics::counter;
use metrics::histogram;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CollectRequest {
    count: u64,
}

/// Records `count` events. The lifecycle gate runs first, then the
/// limiter; both consume their permit even for a zero count.
pub async fn collect(
    State(state): State<AppState>,
    payload: Result<Json<CollectRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let _guard = state.lifecycle.request_guard().ok_or(ApiError::Draining)?;

    if !state.limiter.allow() {
        return Err(ApiError::RateLimited);
    }

    let Json(request) = payload.map_err(|rejection| ApiError::InvalidBody(rejection.body_text()))?;
    for _ in 0..request.count {
        state.counter.incr();
    }

    Ok(StatusCode::ACCEPTED)
}

pub async fn qps(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "qps": state.counter.current_qps().round() as i64 }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "qps": state.counter.current_qps().round() as i64,
        "limiter": state.limiter.stats(),
        "shutdown": {
            "status": state.lifecycle.status().as_str(),
            "active_requests": state.lifecycle.active_requests(),
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    rate: u64,
}

pub async fn set_limiter_rate(
    State(state): State<AppState>,
    payload: Result<Json<RateRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::InvalidBody(rejection.body_text()))?;
    let rate = NonZeroU64::new(request.rate)
        .ok_or_else(|| ApiError::InvalidBody("rate must be greater than zero".to_string()))?;

    state.limiter.set_rate(rate);
    Ok(Json(json!({
        "message": "rate limit updated",
        "new_rate": rate.get(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    enabled: bool,
}

pub async fn toggle_limiter(
    State(state): State<AppState>,
    payload: Result<Json<ToggleRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::InvalidBody(rejection.body_text()))?;

    state.limiter.set_enabled(request.enabled);
    Ok(Json(json!({
        "message": "rate limiter state updated",
        "enabled": request.enabled,
    })))
}

pub async fn healthz() -> &'static str {
    "ok"
}

/// Counts every request and records its duration.
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    counter!("qps_counter_requests_total").increment(1);

    let response = next.run(request).await;

    histogram!("qps_counter_request_duration_seconds").record(start.elapsed().as_secs_f64());
    response
}
