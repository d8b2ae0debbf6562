use serde::Serialize;
use thiserror::Error;

/// Failure classes the HTTP layer maps onto response codes. Carried inside
/// `anyhow::Error` so the rest of the crate can keep using `?` and context.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("{0}")]
    RateLimited(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    ValidationError,
    RateLimitExceeded,
    InternalError,
    ExternalServiceError,
    DatabaseError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::ValidationError => 422,
            ErrorCode::RateLimitExceeded => 429,
            ErrorCode::InternalError => 500,
            ErrorCode::ExternalServiceError => 502,
            ErrorCode::DatabaseError => 503,
        }
    }
}

impl ReportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ReportError::Validation(_) => ErrorCode::ValidationError,
            ReportError::Unauthorized(_) => ErrorCode::Unauthorized,
            ReportError::Forbidden(_) => ErrorCode::Forbidden,
            ReportError::NotFound(_) => ErrorCode::NotFound,
            ReportError::ExternalService(_) => ErrorCode::ExternalServiceError,
            ReportError::Database(_) => ErrorCode::DatabaseError,
            ReportError::RateLimited(_) => ErrorCode::RateLimitExceeded,
        }
    }
}

/// Walks the error chain for a typed classification. A bare
/// `rusqlite::Error` anywhere in the chain counts as a database failure.
pub fn classify(error: &anyhow::Error) -> ErrorCode {
    if let Some(report_error) = error.downcast_ref::<ReportError>() {
        return report_error.code();
    }

    let chain_code = error.chain().find_map(|cause| {
        if let Some(report_error) = cause.downcast_ref::<ReportError>() {
            Some(report_error.code())
        } else if cause.is::<rusqlite::Error>() {
            Some(ErrorCode::DatabaseError)
        } else if cause.is::<serde_json::Error>() {
            Some(ErrorCode::BadRequest)
        } else {
            None
        }
    });

    chain_code.unwrap_or(ErrorCode::InternalError)
}
