use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{AccessToken, ContextUri, DeviceId, PlaylistRef, RepeatMode, TrackRef},
    error::ApiError,
    protocol::{PlaylistsPage, QueueResponse, StartPlaybackBody},
};
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Result of a best-effort transport command. Failures are already logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Preconditions were not met; nothing was sent.
    Skipped,
    Sent,
    Failed,
}

/// Locally tracked repeat mode, advanced before the request that sets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepeatCycle {
    current: RepeatMode,
}

impl RepeatCycle {
    pub fn current(&self) -> RepeatMode {
        self.current
    }

    pub fn advance(&mut self) -> RepeatMode {
        self.current = self.current.next();
        self.current
    }

    /// Replaces the local guess with an authoritative value.
    pub fn sync(&mut self, mode: RepeatMode) {
        self.current = mode;
    }
}

#[derive(Clone)]
pub struct CommandDispatcher {
    http: Client,
    api_base: String,
}

impl CommandDispatcher {
    pub fn new(http: Client, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    /// Playlists in service order, without entries that have no name.
    pub async fn list_playlists(&self, token: &AccessToken) -> Result<Vec<PlaylistRef>, FetchError> {
        let page: PlaylistsPage = self.get_json(token, "v1/me/playlists").await?;
        let playlists = page.into_playlists();
        debug!(count = playlists.len(), "dispatcher: playlists loaded");
        Ok(playlists)
    }

    pub async fn start_playback(
        &self,
        token: &AccessToken,
        device_id: Option<&DeviceId>,
        context_uri: Option<&ContextUri>,
    ) -> CommandOutcome {
        let (Some(device_id), Some(context_uri)) = (device_id, context_uri) else {
            debug!("dispatcher: start_playback skipped, device or context missing");
            return CommandOutcome::Skipped;
        };

        let endpoint = self.endpoint("v1/me/player/play");
        let result = self
            .http
            .put(&endpoint)
            .bearer_auth(token.bearer())
            .query(&[("device_id", device_id.as_str())])
            .json(&StartPlaybackBody {
                context_uri: context_uri.clone(),
            })
            .send()
            .await;

        match check(&endpoint, result).await {
            Ok(_) => {
                info!(device_id = %device_id, context_uri = %context_uri, "dispatcher: playback started");
                CommandOutcome::Sent
            }
            Err(err) => {
                warn!("dispatcher: start_playback failed: {err}");
                CommandOutcome::Failed
            }
        }
    }

    pub async fn set_repeat_mode(&self, token: &AccessToken, mode: RepeatMode) -> CommandOutcome {
        let endpoint = self.endpoint("v1/me/player/repeat");
        let result = self
            .http
            .put(&endpoint)
            .bearer_auth(token.bearer())
            .query(&[("state", mode.as_query())])
            .send()
            .await;

        match check(&endpoint, result).await {
            Ok(_) => {
                info!(mode = %mode, "dispatcher: repeat mode set");
                CommandOutcome::Sent
            }
            Err(err) => {
                warn!("dispatcher: set_repeat_mode failed: {err}");
                CommandOutcome::Failed
            }
        }
    }

    /// Upcoming tracks, in play order.
    pub async fn fetch_queue(&self, token: &AccessToken) -> Result<Vec<TrackRef>, FetchError> {
        let body: QueueResponse = self.get_json(token, "v1/me/player/queue").await?;
        Ok(body
            .queue
            .into_iter()
            .map(|track| track.into_queue_row())
            .collect())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &AccessToken,
        path: &str,
    ) -> Result<T, FetchError> {
        let endpoint = self.endpoint(path);
        let result = self
            .http
            .get(&endpoint)
            .bearer_auth(token.bearer())
            .send()
            .await;
        check(&endpoint, result)
            .await?
            .json()
            .await
            .map_err(|source| FetchError::Decode { endpoint, source })
    }
}

async fn check(endpoint: &str, result: reqwest::Result<Response>) -> Result<Response, FetchError> {
    let response = result.map_err(|source| FetchError::Transport {
        endpoint: endpoint.to_string(),
        source,
    })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(FetchError::Status {
        endpoint: endpoint.to_string(),
        error: ApiError::from_response_body(status.as_u16(), &body),
    })
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
