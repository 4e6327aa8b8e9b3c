use actix_web::http::StatusCode;
use actix_web::{error::ResponseError, HttpResponse};
use log::{debug, error, warn};
use serde_json::json;
use thiserror::Error;

/// Errors raised by a `Store` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Backend(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        match e {
            Error::NotFound => StoreError::NotFound,
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Backend(format!("connection pool: {}", e))
    }
}

// Custom error handling
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ApiError {
    /// Procedure-level error code, in the naming the web client expects.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::ValidationError(_) => "BAD_REQUEST",
            ApiError::RateLimited => "TOO_MANY_REQUESTS",
            ApiError::DatabaseError(_) | ApiError::InternalError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::ValidationError(msg)
            | ApiError::DatabaseError(msg)
            | ApiError::InternalError(msg) => msg.clone(),
            ApiError::RateLimited => "Rate limit exceeded".to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("Record not found".to_string()),
            StoreError::Conflict(msg) => ApiError::DatabaseError(msg),
            StoreError::Backend(msg) => ApiError::DatabaseError(msg),
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let body = json!({ "error": self.message(), "code": self.code() });
        match self {
            ApiError::DatabaseError(msg) => error!("\x1B[1;31mDATABASE ERROR:\x1B[0m {}", msg),
            ApiError::InternalError(msg) => {
                error!("\x1B[1;31mINTERNAL SERVER ERROR:\x1B[0m {}", msg)
            }
            ApiError::Unauthorized(msg) => warn!("\x1B[1;33mAUTHENTICATION ERROR:\x1B[0m {}", msg),
            ApiError::Forbidden(msg) => warn!("\x1B[1;33mFORBIDDEN:\x1B[0m {}", msg),
            ApiError::ValidationError(msg) => {
                warn!("\x1B[1;33mVALIDATION ERROR:\x1B[0m {}", msg)
            }
            ApiError::RateLimited => warn!("\x1B[1;33mRATE LIMITED\x1B[0m"),
            ApiError::NotFound(msg) => debug!("\x1B[1;36mNOT FOUND ERROR:\x1B[0m {}", msg),
        }
        HttpResponse::build(self.status_code()).json(body)
    }

    fn status_code(&self) -> StatusCode {
        match *self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
