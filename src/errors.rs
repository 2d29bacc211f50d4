// Gateway error taxonomy. Adapter and provider failures are converted to
// availability outcomes before they reach this surface; anything that becomes
// an ApiError is a deliberate client-facing rejection.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::error;

use crate::http_types::ErrorBody;

/// Errors that map directly onto HTTP rejections.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid field '{field}': {message}")]
    BadRequest { field: String, message: String },

    #[error("API key is required")]
    MissingApiKey,

    #[error("API key is not valid")]
    InvalidApiKey,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_ms: u64 },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            field: field.into(),
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::MissingApiKey => StatusCode::UNAUTHORIZED,
            ApiError::InvalidApiKey => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::BadRequest { field, message } => ErrorBody {
                error: "bad_request".to_string(),
                message: format!("{field}: {message}"),
                retry_after_ms: None,
            },
            ApiError::MissingApiKey => ErrorBody {
                error: "missing_api_key".to_string(),
                message: "API key is required. Provide it via X-API-Key or Authorization: Bearer"
                    .to_string(),
                retry_after_ms: None,
            },
            ApiError::InvalidApiKey => ErrorBody {
                error: "invalid_api_key".to_string(),
                message: "API key is not valid".to_string(),
                retry_after_ms: None,
            },
            ApiError::RateLimited { retry_after_ms } => ErrorBody {
                error: "rate_limited".to_string(),
                message: "Rate limit exceeded, slow down".to_string(),
                retry_after_ms: Some(*retry_after_ms),
            },
            ApiError::Internal(err) => {
                // Full detail goes to the log, never to the client.
                error!("internal error: {err:#}");
                ErrorBody {
                    error: "internal_error".to_string(),
                    message: "An internal error occurred".to_string(),
                    retry_after_ms: None,
                }
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_ms } = self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
