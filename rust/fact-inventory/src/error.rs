use crate::{rate_limit::RetryAfter, repository::StorageError, validation::ValidationError};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Every non-success outcome of a fact submission.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid client address: {0}")]
    InvalidAddress(String),

    #[error("invalid payload: {0}")]
    SchemaViolation(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("Rate limit exceeded. {0}")]
    RateLimited(RetryAfter),

    #[error("database error: unable to store record")]
    StorageConflict(#[source] StorageError),

    #[error("internal server error while processing")]
    Internal(#[from] anyhow::Error),
}

impl IngestError {
    /// Short machine-friendly label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::InvalidAddress(_) => "invalid_address",
            IngestError::SchemaViolation(_) => "schema_violation",
            IngestError::PayloadTooLarge(_) => "payload_too_large",
            IngestError::RateLimited(_) => "rate_limited",
            IngestError::StorageConflict(_) => "storage_conflict",
            IngestError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            IngestError::InvalidAddress(_) | IngestError::SchemaViolation(_) => {
                StatusCode::BAD_REQUEST
            }
            IngestError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            IngestError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            IngestError::StorageConflict(_) => StatusCode::CONFLICT,
            IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ValidationError> for IngestError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidAddress(_) => IngestError::InvalidAddress(err.to_string()),
            ValidationError::BodyTooLarge { .. } | ValidationError::FieldTooLarge { .. } => {
                IngestError::PayloadTooLarge(err.to_string())
            }
            ValidationError::UnknownField(_)
            | ValidationError::MissingField(_)
            | ValidationError::NotAnObject(_)
            | ValidationError::MalformedJson(_) => IngestError::SchemaViolation(err.to_string()),
        }
    }
}

impl From<StorageError> for IngestError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Other(inner) => IngestError::Internal(inner),
            other => IngestError::StorageConflict(other),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status();

        if matches!(self, IngestError::Internal(_)) {
            error!(error = ?self, "request failed");
        }

        let retry_after_secs = match &self {
            IngestError::RateLimited(retry) => Some(retry.as_secs()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            retry_after_secs,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
