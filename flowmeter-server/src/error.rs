use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use serde_json::json;

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The lifecycle coordinator is no longer accepting requests.
    ///
    /// Converts to `503 Service Unavailable`.
    #[error("service is shutting down")]
    Draining,

    /// The token bucket refused the request.
    ///
    /// Converts to `429 Too Many Requests`.
    #[error("request rejected by rate limiter")]
    RateLimited,

    /// The request body failed to deserialize or a field is out of range.
    ///
    /// Converts to `400 Bad Request`.
    #[error("invalid request: {0}")]
    InvalidBody(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Draining => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
