use crate::error::{self, ErrorCode, ReportError};
use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

pub const ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type, x-cron-secret";

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("POST, OPTIONS"));
    headers
}

pub fn preflight() -> Response {
    (StatusCode::NO_CONTENT, cors_headers()).into_response()
}

pub fn success<T: Serialize>(data: T) -> Response {
    let body = json!({
        "success": true,
        "data": data,
        "timestamp": timestamp(),
    });
    (StatusCode::OK, cors_headers(), Json(body)).into_response()
}

pub type ApiResult<T = Response> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        let code = error::classify(&value);
        if code.http_status() >= 500 {
            error!(code = code.as_str(), "Request failed: {value:#}");
        }
        Self::new(code, format!("{value:#}"))
    }
}

impl From<ReportError> for ApiError {
    fn from(value: ReportError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut error_body = json!({
            "code": self.code.as_str(),
            "message": self.message,
        });
        if let Some(details) = self.details {
            error_body["details"] = details;
        }

        let body = json!({
            "success": false,
            "error": error_body,
            "timestamp": timestamp(),
        });

        (status, cors_headers(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn database_errors_map_to_503() {
        let error: ApiError = anyhow!(ReportError::Database("locked".to_string())).into();
        assert_eq!(error.code, ErrorCode::DatabaseError);
        assert_eq!(error.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn success_carries_cors_headers() {
        let response = success(json!({"ok": 1}));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    #[test]
    fn preflight_is_empty_204() {
        let response = preflight();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_HEADERS));
    }
}
