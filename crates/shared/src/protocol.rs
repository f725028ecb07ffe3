use serde::{Deserialize, Serialize};

use crate::domain::{ContextUri, DeviceId, PlaybackState, PlaylistRef, RepeatMode, TrackRef};

/// Cover shown for queue rows whose album has no thumbnail.
pub const PLACEHOLDER_COVER_URL: &str = "https://placehold.co/40x40/1a1a1a/ffffff?text=?";

/// Events delivered by the playback engine, in the order they occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Ready { device_id: DeviceId },
    NotReady,
    /// `None` means the engine has no active playback state.
    StateChanged(Option<PlaybackState>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenExchangeForm<'a> {
    pub client_id: &'a str,
    pub grant_type: &'a str,
    pub code: &'a str,
    pub redirect_uri: &'a str,
    pub code_verifier: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPlaybackBody {
    pub context_uri: ContextUri,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistsPage {
    #[serde(default)]
    pub items: Vec<PlaylistItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uri: Option<ContextUri>,
}

impl PlaylistsPage {
    /// Playlists in service order; entries without a name or uri are dropped.
    pub fn into_playlists(self) -> Vec<PlaylistRef> {
        self.items
            .into_iter()
            .filter_map(|item| {
                let name = item.name.filter(|name| !name.trim().is_empty())?;
                let uri = item.uri?;
                Some(PlaylistRef { name, uri })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub currently_playing: Option<TrackObject>,
    #[serde(default)]
    pub queue: Vec<TrackObject>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackObject {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artists: Vec<ArtistObject>,
    #[serde(default)]
    pub album: Option<AlbumObject>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtistObject {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlbumObject {
    #[serde(default)]
    pub images: Vec<ImageObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageObject {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl TrackObject {
    fn image_url(&self, index: usize) -> Option<String> {
        self.album
            .as_ref()
            .and_then(|album| album.images.get(index))
            .map(|image| image.url.clone())
    }

    fn into_track_ref(self, cover_url: Option<String>) -> TrackRef {
        TrackRef {
            name: self.name,
            artists: self.artists.into_iter().map(|artist| artist.name).collect(),
            cover_url,
            duration_ms: self.duration_ms,
        }
    }

    /// Now-playing projection: the largest (first) album image.
    pub fn into_now_playing(self) -> TrackRef {
        let cover = self.image_url(0);
        self.into_track_ref(cover)
    }

    /// Queue-row projection: the thumbnail slot (third image), or the placeholder.
    pub fn into_queue_row(self) -> TrackRef {
        let cover = self
            .image_url(2)
            .unwrap_or_else(|| PLACEHOLDER_COVER_URL.to_string());
        self.into_track_ref(Some(cover))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesResponse {
    #[serde(default)]
    pub devices: Vec<DeviceObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceObject {
    #[serde(default)]
    pub id: Option<DeviceId>,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub volume_percent: Option<u8>,
}

/// Body of `GET /v1/me/player`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerStateResponse {
    #[serde(default)]
    pub device: Option<DeviceObject>,
    #[serde(default)]
    pub repeat_state: Option<String>,
    #[serde(default)]
    pub progress_ms: Option<u64>,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub item: Option<TrackObject>,
}

impl PlayerStateResponse {
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device.as_ref().and_then(|device| device.id.as_ref())
    }

    /// `None` when nothing is loaded on the player.
    pub fn into_playback_state(self) -> Option<PlaybackState> {
        let item = self.item?;
        let repeat_mode = self
            .repeat_state
            .as_deref()
            .and_then(|state| state.parse::<RepeatMode>().ok())
            .unwrap_or_default();
        let duration_ms = item.duration_ms;
        Some(PlaybackState {
            paused: !self.is_playing,
            position_ms: self.progress_ms.unwrap_or_default().min(duration_ms),
            duration_ms,
            track: item.into_now_playing(),
            repeat_mode,
        })
    }
}
