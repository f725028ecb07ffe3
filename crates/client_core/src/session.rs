//! Playback session controller: reconciles engine readiness and player snapshots,
//! drives the progress clock, and forwards user intents.

use std::sync::Arc;

use playback_engine::{PlaybackEngine, ReadyWaiter};
use shared::{
    domain::{AccessToken, ContextUri, DeviceId, PlaybackState, PlaylistRef, RepeatMode, TrackRef},
    protocol::EngineEvent,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::AutoplayPolicy,
    dispatcher::{CommandDispatcher, CommandOutcome, RepeatCycle},
    error::{FetchError, SessionError},
    progress::{ProgressClock, ProgressView},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePhase {
    Detached,
    Ready(DeviceId),
    NotReady,
}

impl DevicePhase {
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            DevicePhase::Ready(device_id) => Some(device_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistMenu {
    Loaded(Vec<PlaylistRef>),
    Empty,
    /// The listing could not be fetched.
    Unavailable,
}

impl PlaylistMenu {
    /// Menu for a listing result. A failed fetch is logged and shown as `Unavailable`.
    pub fn from_fetch(result: Result<Vec<PlaylistRef>, FetchError>) -> Self {
        match result {
            Ok(playlists) if playlists.is_empty() => PlaylistMenu::Empty,
            Ok(playlists) => PlaylistMenu::Loaded(playlists),
            Err(err) => {
                warn!("session: failed to load playlists: {err}");
                PlaylistMenu::Unavailable
            }
        }
    }

    pub fn first(&self) -> Option<&PlaylistRef> {
        match self {
            PlaylistMenu::Loaded(playlists) => playlists.first(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueView {
    Tracks(Vec<TrackRef>),
    Empty,
    Unavailable,
}

impl QueueView {
    pub fn from_fetch(result: Result<Vec<TrackRef>, FetchError>) -> Self {
        match result {
            Ok(tracks) if tracks.is_empty() => QueueView::Empty,
            Ok(tracks) => QueueView::Tracks(tracks),
            Err(err) => {
                warn!("session: failed to load queue: {err}");
                QueueView::Unavailable
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DeviceReady(DeviceId),
    DeviceLost,
    PlaybackUpdated(PlaybackState),
    Progress(ProgressView),
    RepeatModeChanged(RepeatMode),
    PlaylistsLoaded(PlaylistMenu),
    QueueLoaded(QueueView),
}

struct SessionInner {
    phase: DevicePhase,
    playback: Option<PlaybackState>,
    clock: Option<ProgressClock>,
    repeat: RepeatCycle,
    default_context: Option<ContextUri>,
    autoplay_issued: bool,
}

struct SessionShared {
    engine: Arc<dyn PlaybackEngine>,
    dispatcher: CommandDispatcher,
    token: AccessToken,
    autoplay: AutoplayPolicy,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<SessionInner>,
}

pub struct PlaybackSessionController {
    shared: Arc<SessionShared>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSessionController {
    pub fn new(
        engine: Arc<dyn PlaybackEngine>,
        dispatcher: CommandDispatcher,
        token: AccessToken,
        autoplay: AutoplayPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let default_context = match &autoplay {
            AutoplayPolicy::Context(uri) => Some(uri.clone()),
            AutoplayPolicy::FirstPlaylist | AutoplayPolicy::Disabled => None,
        };
        Self {
            shared: Arc::new(SessionShared {
                engine,
                dispatcher,
                token,
                autoplay,
                events,
                inner: Mutex::new(SessionInner {
                    phase: DevicePhase::Detached,
                    playback: None,
                    clock: None,
                    repeat: RepeatCycle::default(),
                    default_context,
                    autoplay_issued: false,
                }),
            }),
            event_task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Waits for the engine to finish loading, then starts consuming its events and
    /// connects it. Events are handled one at a time, in delivery order.
    pub async fn attach(&self, ready: ReadyWaiter) -> Result<(), SessionError> {
        if self.event_task.lock().await.is_some() {
            return Err(SessionError::AlreadyAttached);
        }
        if let Err(err) = ready.wait().await {
            warn!("session: {err}");
            return Err(SessionError::EngineUnavailable);
        }

        let mut task = self.event_task.lock().await;
        if task.is_some() {
            return Err(SessionError::AlreadyAttached);
        }
        let mut rx = self.shared.engine.subscribe_events();
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => shared.handle_engine_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: engine events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("session: engine event feed closed");
        }));

        let connected = match self.shared.engine.connect().await {
            Ok(connected) => connected,
            Err(err) => {
                warn!("session: engine connect failed: {err:#}");
                false
            }
        };
        if !connected {
            if let Some(task) = task.take() {
                task.abort();
            }
            return Err(SessionError::EngineUnavailable);
        }
        info!("session: attached to playback engine");
        Ok(())
    }

    pub async fn handle_engine_event(&self, event: EngineEvent) {
        self.shared.handle_engine_event(event).await;
    }

    /// Fetches the playlist menu and resolves the autoplay context from it.
    pub async fn load_playlists(&self) -> PlaylistMenu {
        let shared = &self.shared;
        let menu = PlaylistMenu::from_fetch(shared.dispatcher.list_playlists(&shared.token).await);
        if menu == PlaylistMenu::Unavailable {
            let _ = shared.events.send(SessionEvent::PlaylistsLoaded(menu.clone()));
            return menu;
        }

        let autoplay = {
            let mut inner = shared.inner.lock().await;
            if inner.default_context.is_none() && shared.autoplay == AutoplayPolicy::FirstPlaylist {
                inner.default_context = menu.first().map(|playlist| playlist.uri.clone());
            }
            inner.take_autoplay()
        };
        let _ = shared.events.send(SessionEvent::PlaylistsLoaded(menu.clone()));

        if let Some((device_id, context)) = autoplay {
            shared.start_default_context(&device_id, &context).await;
        }
        menu
    }

    /// Starts `context` on the ready device. Skipped while no device is ready.
    pub async fn play_context(&self, context: &ContextUri) -> CommandOutcome {
        let device_id = self.shared.inner.lock().await.phase.device_id().cloned();
        self.shared
            .dispatcher
            .start_playback(&self.shared.token, device_id.as_ref(), Some(context))
            .await
    }

    pub async fn toggle_play(&self) {
        if self.shared.ensure_ready("toggle_play").await {
            if let Err(err) = self.shared.engine.toggle_play().await {
                warn!("session: toggle_play failed: {err:#}");
            }
        }
    }

    pub async fn next_track(&self) {
        if self.shared.ensure_ready("next_track").await {
            if let Err(err) = self.shared.engine.next_track().await {
                warn!("session: next_track failed: {err:#}");
            }
        }
    }

    pub async fn previous_track(&self) {
        if self.shared.ensure_ready("previous_track").await {
            if let Err(err) = self.shared.engine.previous_track().await {
                warn!("session: previous_track failed: {err:#}");
            }
        }
    }

    pub async fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        if self.shared.ensure_ready("set_volume").await {
            if let Err(err) = self.shared.engine.set_volume(volume).await {
                warn!("session: set_volume failed: {err:#}");
            }
        }
    }

    /// Advances the local repeat mode and sends it. The local value is kept even if
    /// the request fails; the next player snapshot overrides it either way.
    pub async fn cycle_repeat_mode(&self) -> Option<RepeatMode> {
        let mode = {
            let mut inner = self.shared.inner.lock().await;
            if inner.phase.device_id().is_none() {
                debug!("session: cycle_repeat_mode suppressed, no ready device");
                return None;
            }
            inner.repeat.advance()
        };
        let outcome = self
            .shared
            .dispatcher
            .set_repeat_mode(&self.shared.token, mode)
            .await;
        if outcome == CommandOutcome::Sent {
            let _ = self.shared.events.send(SessionEvent::RepeatModeChanged(mode));
        }
        Some(mode)
    }

    pub async fn fetch_and_show_queue(&self) -> QueueView {
        let view =
            QueueView::from_fetch(self.shared.dispatcher.fetch_queue(&self.shared.token).await);
        let _ = self.shared.events.send(SessionEvent::QueueLoaded(view.clone()));
        view
    }

    /// Stops event handling and the progress clock, then disconnects the engine.
    pub async fn shutdown(&self) {
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        {
            let mut inner = self.shared.inner.lock().await;
            inner.clock = None;
            inner.phase = DevicePhase::Detached;
        }
        if let Err(err) = self.shared.engine.disconnect().await {
            warn!("session: engine disconnect failed: {err:#}");
        }
        info!("session: shut down");
    }

    pub async fn phase(&self) -> DevicePhase {
        self.shared.inner.lock().await.phase.clone()
    }

    pub async fn playback_state(&self) -> Option<PlaybackState> {
        self.shared.inner.lock().await.playback.clone()
    }

    pub async fn repeat_mode(&self) -> RepeatMode {
        self.shared.inner.lock().await.repeat.current()
    }

    pub async fn default_context(&self) -> Option<ContextUri> {
        self.shared.inner.lock().await.default_context.clone()
    }

    pub async fn progress(&self) -> Option<ProgressView> {
        let inner = self.shared.inner.lock().await;
        match (&inner.clock, &inner.playback) {
            (Some(clock), _) => Some(clock.view()),
            (None, Some(state)) => Some(ProgressView::new(state.position_ms, state.duration_ms)),
            (None, None) => None,
        }
    }

    pub async fn progress_clock_running(&self) -> bool {
        self.shared
            .inner
            .lock()
            .await
            .clock
            .as_ref()
            .is_some_and(ProgressClock::is_running)
    }
}

impl SessionInner {
    /// Claims the one autoplay start if a device is ready and a context is known.
    fn take_autoplay(&mut self) -> Option<(DeviceId, ContextUri)> {
        if self.autoplay_issued {
            return None;
        }
        let device_id = self.phase.device_id()?.clone();
        let context = self.default_context.clone()?;
        self.autoplay_issued = true;
        Some((device_id, context))
    }
}

impl SessionShared {
    async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Ready { device_id } => {
                let autoplay = {
                    let mut inner = self.inner.lock().await;
                    inner.phase = DevicePhase::Ready(device_id.clone());
                    inner.take_autoplay()
                };
                info!(device_id = %device_id, "session: device ready");
                let _ = self.events.send(SessionEvent::DeviceReady(device_id));
                if let Some((device_id, context)) = autoplay {
                    self.start_default_context(&device_id, &context).await;
                }
            }
            EngineEvent::NotReady => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.phase = DevicePhase::NotReady;
                    inner.clock = None;
                }
                info!("session: device not ready");
                let _ = self.events.send(SessionEvent::DeviceLost);
            }
            EngineEvent::StateChanged(None) => {
                debug!("session: engine reported no active state");
            }
            EngineEvent::StateChanged(Some(state)) => self.apply_snapshot(state).await,
        }
    }

    async fn apply_snapshot(&self, state: PlaybackState) {
        let mut inner = self.inner.lock().await;
        inner.clock = None;
        inner.repeat.sync(state.repeat_mode);
        if state.is_playing() {
            let events = self.events.clone();
            inner.clock = Some(ProgressClock::start(
                state.position_ms,
                state.duration_ms,
                move |view| {
                    let _ = events.send(SessionEvent::Progress(view));
                },
            ));
        }
        debug!(
            paused = state.paused,
            position_ms = state.position_ms,
            repeat = %state.repeat_mode,
            "session: snapshot applied"
        );
        let progress = ProgressView::new(state.position_ms, state.duration_ms);
        inner.playback = Some(state.clone());
        drop(inner);

        let _ = self.events.send(SessionEvent::PlaybackUpdated(state));
        let _ = self.events.send(SessionEvent::Progress(progress));
    }

    async fn start_default_context(&self, device_id: &DeviceId, context: &ContextUri) {
        info!(device_id = %device_id, context_uri = %context, "session: starting default context");
        self.dispatcher
            .start_playback(&self.token, Some(device_id), Some(context))
            .await;
    }

    async fn ensure_ready(&self, intent: &str) -> bool {
        let ready = self.inner.lock().await.phase.device_id().is_some();
        if !ready {
            debug!(intent, "session: intent suppressed, no ready device");
        }
        ready
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
