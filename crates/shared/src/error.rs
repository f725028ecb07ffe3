use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            429 => ErrorCode::RateLimited,
            400..=499 => ErrorCode::Validation,
            _ => ErrorCode::Internal,
        }
    }
}

/// Error reported by the music service, decoded from a non-success response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?} ({status}): {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, status: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
        }
    }

    /// Decodes either envelope the service uses: the Web API's
    /// `{"error": {"status", "message"}}` or the accounts service's
    /// `{"error": "...", "error_description": "..."}`. Anything else keeps the raw body.
    pub fn from_response_body(status: u16, body: &str) -> Self {
        let message = match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(ErrorEnvelope::Api { error }) => error.message,
            Ok(ErrorEnvelope::OAuth {
                error,
                error_description,
            }) => match error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            },
            Err(_) if body.trim().is_empty() => format!("http status {status}"),
            Err(_) => body.trim().to_string(),
        };
        Self::new(ErrorCode::from_status(status), status, message)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorEnvelope {
    Api {
        error: ApiErrorBody,
    },
    OAuth {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}
