//! Boundary to the external playback engine: the capability surface the session
//! controller drives, the event feed it reconciles, and the one-shot signal the
//! engine fires once it is loaded.

use std::time::Duration;

use async_trait::async_trait;
use shared::protocol::EngineEvent;
use tokio::sync::broadcast;

mod ready;
pub mod web_api;

pub use ready::{ready_signal, EngineUnavailable, ReadyNotifier, ReadyWaiter};
pub use web_api::WebApiEngine;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Name the device is known by on the service.
    pub device_name: String,
    /// Applied once, on the first readiness of the device.
    pub initial_volume: Option<f32>,
    pub poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            device_name: "Player Station - Music Station".into(),
            initial_volume: Some(0.5),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[async_trait]
pub trait PlaybackEngine: Send + Sync {
    /// Starts delivering events. Returns whether the engine accepted the connection.
    async fn connect(&self) -> anyhow::Result<bool>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn toggle_play(&self) -> anyhow::Result<()>;
    async fn next_track(&self) -> anyhow::Result<()>;
    async fn previous_track(&self) -> anyhow::Result<()>;
    /// `volume` is in `0.0..=1.0`.
    async fn set_volume(&self, volume: f32) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Converts a `0.0..=1.0` volume to the service's integer percentage.
pub fn volume_percent(volume: f32) -> u8 {
    if volume.is_nan() {
        return 0;
    }
    (volume.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_percent_clamps_and_rounds() {
        assert_eq!(volume_percent(0.5), 50);
        assert_eq!(volume_percent(0.333), 33);
        assert_eq!(volume_percent(1.7), 100);
        assert_eq!(volume_percent(-0.2), 0);
        assert_eq!(volume_percent(f32::NAN), 0);
    }
}
