use std::time::Duration;

use shared::error::ApiError;
use thiserror::Error;

/// Failures of the login handshake. Every variant sends the user back to the
/// login entry point.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no client id configured; set STATION_CLIENT_ID or client_id in station.toml")]
    Config,
    #[error("'{0}' is not an absolute url")]
    InvalidUrl(String),
    #[error("no PKCE verifier was persisted for this login; start the login again")]
    MissingVerifier,
    #[error("authorization server refused the login: {0}")]
    AuthorizationDenied(String),
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(ApiError),
    #[error("token exchange timed out after {0:?}")]
    TokenExchangeTimedOut(Duration),
    #[error("token exchange request failed: {0}")]
    TokenExchangeTransport(#[source] reqwest::Error),
    #[error("token response was not understood: {0}")]
    MalformedTokenResponse(String),
    #[error("verifier storage failed: {source}")]
    Storage { source: anyhow::Error },
    #[error("could not open the authorization page: {source}")]
    Navigation { source: anyhow::Error },
}

/// Failures of authenticated reads and writes. Callers log these and continue with
/// stale or absent data.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("{endpoint} answered {error}")]
    Status { endpoint: String, error: ApiError },
    #[error("unexpected body from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            FetchError::Status { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("playback engine never became available")]
    EngineUnavailable,
    #[error("session is already attached to an engine")]
    AlreadyAttached,
}
