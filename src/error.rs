// =============================================================================
// Query Facade error type and process exit codes.
// =============================================================================
//
// Internal components (fetcher, venues, poller, persistence) propagate
// failures as `anyhow::Result`. `ApiError` exists only at the HTTP boundary,
// where a validation or authorization failure must be rendered as the
// canonical response envelope rather than logged and dropped.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

/// Errors the Query Facade renders directly to the client.
#[derive(Debug, Clone)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(msg) => msg.clone(),
            Self::Unauthorized => "unauthorized".to_string(),
            Self::NotFound => "not found".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Per §7: validation/authorization failures log at WARN, never higher.
        warn!(status = status.as_u16(), message = %self.message(), "request rejected");
        let body = json!({
            "status": status.as_u16(),
            "message": self.message(),
            "data": serde_json::Value::Null,
        });
        (status, Json(body)).into_response()
    }
}

/// Process exit codes (§6). `Ok` is never passed to `std::process::exit`
/// directly; callers match on the failure variant that applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    LoadConfigErr = 1,
    SqlNotConnect = 2,
    HttpServerNotListen = 3,
    ServiceInitErr = 4,
    StartLoggerErr = 5,
}

impl ExitCode {
    pub fn exit(self) -> ! {
        std::process::exit(self as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_renders_400() {
        let err = ApiError::BadRequest("missing sessionId".to_string());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unauthorized_renders_401() {
        let resp = ApiError::Unauthorized.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
