//! A [`PlaybackEngine`] that drives an existing remote device through the service's
//! player endpoints and derives readiness and state events by polling.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use shared::{
    domain::{AccessToken, DeviceId, PlaybackState},
    error::{ApiError, ErrorCode},
    protocol::{DevicesResponse, EngineEvent, PlayerStateResponse},
};
use tokio::{
    sync::{broadcast, Mutex, Notify},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{ready_signal, volume_percent, EngineOptions, PlaybackEngine, ReadyWaiter};

/// Position jumps larger than this between polls are reported as a new state.
const SEEK_TOLERANCE: Duration = Duration::from_secs(2);

pub struct WebApiEngine {
    shared: Arc<EngineShared>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

struct EngineShared {
    http: Client,
    api_base: String,
    token: AccessToken,
    options: EngineOptions,
    events: broadcast::Sender<EngineEvent>,
    tracker: Mutex<DeviceTracker>,
    poke: Notify,
}

#[derive(Default)]
struct DeviceTracker {
    device_id: Option<DeviceId>,
    initial_volume_applied: bool,
    last_state: Option<(PlaybackState, Instant)>,
    reported_empty: bool,
}

impl WebApiEngine {
    pub fn new(
        http: Client,
        api_base: impl Into<String>,
        token: AccessToken,
        options: EngineOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(EngineShared {
                http,
                api_base: api_base.into().trim_end_matches('/').to_string(),
                token,
                options,
                events,
                tracker: Mutex::new(DeviceTracker::default()),
                poke: Notify::new(),
            }),
            poll_task: Mutex::new(None),
        }
    }

    /// Probes the player API until it answers, then fires the returned signal.
    /// Authorization failures drop the signal, which the waiter sees as unavailable.
    pub fn spawn_loader(&self) -> ReadyWaiter {
        let (notifier, waiter) = ready_signal();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                match shared.fetch_devices().await {
                    Ok(_) => {
                        debug!("engine: player api reachable");
                        notifier.notify();
                        return;
                    }
                    Err(err) if is_auth_failure(&err) => {
                        warn!("engine: player api rejected credentials: {err:#}");
                        return;
                    }
                    Err(err) => {
                        debug!("engine: player api not reachable yet: {err:#}");
                        tokio::time::sleep(shared.options.poll_interval).await;
                    }
                }
            }
        });
        waiter
    }
}

#[async_trait]
impl PlaybackEngine for WebApiEngine {
    async fn connect(&self) -> Result<bool> {
        let mut task = self.poll_task.lock().await;
        if task.is_some() {
            return Ok(true);
        }

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.options.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shared.poke.notified() => {}
                }
                shared.poll_once().await;
            }
        }));
        info!(device = %self.shared.options.device_name, "engine: connected");
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        let was_ready = {
            let mut tracker = self.shared.tracker.lock().await;
            let was_ready = tracker.device_id.is_some();
            *tracker = DeviceTracker::default();
            was_ready
        };
        if was_ready {
            let _ = self.shared.events.send(EngineEvent::NotReady);
        }
        info!("engine: disconnected");
        Ok(())
    }

    async fn toggle_play(&self) -> Result<()> {
        let playing = {
            let tracker = self.shared.tracker.lock().await;
            tracker
                .last_state
                .as_ref()
                .is_some_and(|(state, _)| state.is_playing())
        };
        let path = if playing {
            "v1/me/player/pause"
        } else {
            "v1/me/player/play"
        };
        self.shared.command(Method::PUT, path, &[]).await
    }

    async fn next_track(&self) -> Result<()> {
        self.shared
            .command(Method::POST, "v1/me/player/next", &[])
            .await
    }

    async fn previous_track(&self) -> Result<()> {
        self.shared
            .command(Method::POST, "v1/me/player/previous", &[])
            .await
    }

    async fn set_volume(&self, volume: f32) -> Result<()> {
        let percent = volume_percent(volume).to_string();
        self.shared
            .command(
                Method::PUT,
                "v1/me/player/volume",
                &[("volume_percent", percent)],
            )
            .await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }
}

impl EngineShared {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    async fn fetch_devices(&self) -> Result<Vec<DeviceObjectSummary>> {
        let url = self.endpoint("v1/me/player/devices");
        let res = self
            .http
            .get(&url)
            .bearer_auth(self.token.bearer())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        let res = check_status(res).await?;
        let body: DevicesResponse = res.json().await.context("invalid devices body")?;
        Ok(body
            .devices
            .into_iter()
            .filter_map(|device| {
                Some(DeviceObjectSummary {
                    id: device.id?,
                    name: device.name,
                })
            })
            .collect())
    }

    async fn fetch_player(&self) -> Result<Option<PlayerStateResponse>> {
        let url = self.endpoint("v1/me/player");
        let res = self
            .http
            .get(&url)
            .bearer_auth(self.token.bearer())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let res = check_status(res).await?;
        Ok(Some(res.json().await.context("invalid player body")?))
    }

    async fn command(&self, method: Method, path: &str, extra: &[(&str, String)]) -> Result<()> {
        let device_id = self
            .tracker
            .lock()
            .await
            .device_id
            .clone()
            .ok_or_else(|| anyhow!("no ready device for {path}"))?;

        let mut query = vec![("device_id", device_id.0)];
        query.extend(extra.iter().cloned());

        let url = self.endpoint(path);
        let res = self
            .http
            .request(method, &url)
            .bearer_auth(self.token.bearer())
            .query(&query)
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?;
        check_status(res).await?;
        self.poke.notify_one();
        Ok(())
    }

    /// One reconciliation step: readiness first, then the player snapshot.
    async fn poll_once(&self) {
        let devices = match self.fetch_devices().await {
            Ok(devices) => devices,
            Err(err) => {
                warn!("engine: device poll failed: {err:#}");
                return;
            }
        };
        let found = devices
            .into_iter()
            .find(|device| device.name.eq_ignore_ascii_case(&self.options.device_name))
            .map(|device| device.id);

        let (device_id, apply_volume) = {
            let mut tracker = self.tracker.lock().await;
            match (tracker.device_id.clone(), found) {
                (None, None) => return,
                (Some(_), None) => {
                    info!("engine: device went away");
                    *tracker = DeviceTracker {
                        initial_volume_applied: tracker.initial_volume_applied,
                        ..DeviceTracker::default()
                    };
                    let _ = self.events.send(EngineEvent::NotReady);
                    return;
                }
                (previous, Some(device_id)) => {
                    if previous.as_ref() != Some(&device_id) {
                        if previous.is_some() {
                            let _ = self.events.send(EngineEvent::NotReady);
                        }
                        info!(device_id = %device_id, "engine: device ready");
                        tracker.device_id = Some(device_id.clone());
                        tracker.last_state = None;
                        tracker.reported_empty = false;
                        let _ = self.events.send(EngineEvent::Ready {
                            device_id: device_id.clone(),
                        });
                    }
                    let apply_volume = !tracker.initial_volume_applied
                        && self.options.initial_volume.is_some();
                    tracker.initial_volume_applied = true;
                    (device_id, apply_volume)
                }
            }
        };

        if apply_volume {
            if let Some(volume) = self.options.initial_volume {
                let percent = volume_percent(volume).to_string();
                if let Err(err) = self
                    .command(
                        Method::PUT,
                        "v1/me/player/volume",
                        &[("volume_percent", percent)],
                    )
                    .await
                {
                    warn!("engine: failed to apply initial volume: {err:#}");
                }
            }
        }

        let snapshot = match self.fetch_player().await {
            Ok(Some(player)) if player.device_id() == Some(&device_id) => {
                player.into_playback_state()
            }
            Ok(_) => None,
            Err(err) => {
                warn!("engine: player poll failed: {err:#}");
                return;
            }
        };

        let now = Instant::now();
        let mut tracker = self.tracker.lock().await;
        match snapshot {
            Some(state) => {
                if is_material_change(tracker.last_state.as_ref(), &state, now) {
                    tracker.last_state = Some((state.clone(), now));
                    tracker.reported_empty = false;
                    let _ = self.events.send(EngineEvent::StateChanged(Some(state)));
                }
            }
            None => {
                if !tracker.reported_empty {
                    tracker.last_state = None;
                    tracker.reported_empty = true;
                    let _ = self.events.send(EngineEvent::StateChanged(None));
                }
            }
        }
    }
}

struct DeviceObjectSummary {
    id: DeviceId,
    name: String,
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(ApiError::from_response_body(status.as_u16(), &body).into())
}

fn is_auth_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>().is_some_and(|api| {
        matches!(api.code, ErrorCode::Unauthorized | ErrorCode::Forbidden)
    })
}

/// Whether `next` differs from the last reported snapshot by more than the clock
/// drift a consumer interpolating from `previous` would expect.
fn is_material_change(
    previous: Option<&(PlaybackState, Instant)>,
    next: &PlaybackState,
    now: Instant,
) -> bool {
    let Some((previous, observed_at)) = previous else {
        return true;
    };
    if previous.paused != next.paused
        || previous.track != next.track
        || previous.repeat_mode != next.repeat_mode
        || previous.duration_ms != next.duration_ms
    {
        return true;
    }
    let expected = if previous.paused {
        previous.position_ms
    } else {
        let elapsed = now.saturating_duration_since(*observed_at).as_millis() as u64;
        (previous.position_ms + elapsed).min(previous.duration_ms)
    };
    next.position_ms.abs_diff(expected) > SEEK_TOLERANCE.as_millis() as u64
}

#[cfg(test)]
#[path = "tests/web_api_tests.rs"]
mod tests;
