use super::*;
use axum::{
    extract::State,
    http::{Method as HttpMethod, StatusCode as HttpStatus, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::{RepeatMode, TrackRef};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct FakeApi {
    devices: Arc<Mutex<Value>>,
    player: Arc<Mutex<Option<Value>>>,
    commands: Arc<Mutex<Vec<String>>>,
    reject_auth: Arc<Mutex<bool>>,
}

async fn devices(State(api): State<FakeApi>) -> Response {
    if *api.reject_auth.lock().await {
        return (
            HttpStatus::UNAUTHORIZED,
            Json(json!({"error": {"status": 401, "message": "Invalid access token"}})),
        )
            .into_response();
    }
    Json(api.devices.lock().await.clone()).into_response()
}

async fn player(State(api): State<FakeApi>) -> Response {
    match api.player.lock().await.clone() {
        Some(body) => Json(body).into_response(),
        None => HttpStatus::NO_CONTENT.into_response(),
    }
}

async fn record(State(api): State<FakeApi>, method: HttpMethod, uri: Uri) -> HttpStatus {
    api.commands.lock().await.push(format!("{method} {uri}"));
    HttpStatus::NO_CONTENT
}

async fn spawn_fake_api(api: FakeApi) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/v1/me/player/devices", get(devices))
        .route("/v1/me/player", get(player))
        .fallback(record)
        .with_state(api);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn engine_for(base: &str, initial_volume: Option<f32>) -> WebApiEngine {
    WebApiEngine::new(
        Client::new(),
        base,
        AccessToken::new("token-1"),
        EngineOptions {
            device_name: "Kitchen".into(),
            initial_volume,
            poll_interval: Duration::from_millis(50),
        },
    )
}

fn kitchen_devices() -> Value {
    json!({"devices": [
        {"id": "other", "name": "Phone", "is_active": false},
        {"id": "d1", "name": "kitchen", "is_active": true, "volume_percent": 30}
    ]})
}

fn playing_on(device_id: &str, progress_ms: u64) -> Value {
    json!({
        "device": {"id": device_id, "name": "Kitchen", "is_active": true},
        "repeat_state": "track",
        "progress_ms": progress_ms,
        "is_playing": true,
        "item": {
            "name": "Song",
            "artists": [{"name": "Band"}],
            "album": {"images": [{"url": "cover"}]},
            "duration_ms": 200000
        }
    })
}

fn snapshot(paused: bool, position_ms: u64) -> PlaybackState {
    PlaybackState {
        paused,
        position_ms,
        duration_ms: 200_000,
        track: TrackRef {
            name: "Song".into(),
            artists: vec!["Band".into()],
            cover_url: None,
            duration_ms: 200_000,
        },
        repeat_mode: RepeatMode::Off,
    }
}

#[tokio::test]
async fn poll_reports_ready_then_state() {
    let api = FakeApi::default();
    *api.devices.lock().await = kitchen_devices();
    *api.player.lock().await = Some(playing_on("d1", 1_000));
    let base = spawn_fake_api(api.clone()).await;

    let engine = engine_for(&base, None);
    let mut events = engine.subscribe_events();
    engine.shared.poll_once().await;

    assert_eq!(
        events.try_recv().expect("ready"),
        EngineEvent::Ready {
            device_id: DeviceId::from("d1")
        }
    );
    match events.try_recv().expect("state") {
        EngineEvent::StateChanged(Some(state)) => {
            assert!(state.is_playing());
            assert_eq!(state.position_ms, 1_000);
            assert_eq!(state.repeat_mode, RepeatMode::Track);
        }
        other => panic!("unexpected event {other:?}"),
    }

    engine.shared.poll_once().await;
    assert!(
        events.try_recv().is_err(),
        "an unchanged player should not be reported again"
    );
}

#[tokio::test]
async fn player_on_another_device_is_reported_as_empty_state() {
    let api = FakeApi::default();
    *api.devices.lock().await = kitchen_devices();
    *api.player.lock().await = Some(playing_on("other", 1_000));
    let base = spawn_fake_api(api.clone()).await;

    let engine = engine_for(&base, None);
    let mut events = engine.subscribe_events();
    engine.shared.poll_once().await;

    assert!(matches!(events.try_recv(), Ok(EngineEvent::Ready { .. })));
    assert_eq!(
        events.try_recv().expect("state"),
        EngineEvent::StateChanged(None)
    );
}

#[tokio::test]
async fn vanished_device_reports_not_ready() {
    let api = FakeApi::default();
    *api.devices.lock().await = kitchen_devices();
    let base = spawn_fake_api(api.clone()).await;

    let engine = engine_for(&base, None);
    let mut events = engine.subscribe_events();
    engine.shared.poll_once().await;
    assert!(matches!(events.try_recv(), Ok(EngineEvent::Ready { .. })));
    let _ = events.try_recv();

    *api.devices.lock().await = json!({"devices": []});
    engine.shared.poll_once().await;
    assert_eq!(events.try_recv().expect("not ready"), EngineEvent::NotReady);

    let err = engine.next_track().await.expect_err("no device");
    assert!(err.to_string().contains("no ready device"));
    assert!(api.commands.lock().await.is_empty());
}

#[tokio::test]
async fn toggle_play_pauses_a_playing_device() {
    let api = FakeApi::default();
    *api.devices.lock().await = kitchen_devices();
    *api.player.lock().await = Some(playing_on("d1", 5_000));
    let base = spawn_fake_api(api.clone()).await;

    let engine = engine_for(&base, None);
    engine.shared.poll_once().await;
    engine.toggle_play().await.expect("toggle");
    engine.set_volume(0.25).await.expect("volume");

    let commands = api.commands.lock().await.clone();
    assert_eq!(
        commands,
        vec![
            "PUT /v1/me/player/pause?device_id=d1".to_string(),
            "PUT /v1/me/player/volume?device_id=d1&volume_percent=25".to_string(),
        ]
    );
}

#[tokio::test]
async fn initial_volume_is_applied_once() {
    let api = FakeApi::default();
    *api.devices.lock().await = kitchen_devices();
    let base = spawn_fake_api(api.clone()).await;

    let engine = engine_for(&base, Some(0.5));
    engine.shared.poll_once().await;
    engine.shared.poll_once().await;

    let commands = api.commands.lock().await.clone();
    assert_eq!(
        commands,
        vec!["PUT /v1/me/player/volume?device_id=d1&volume_percent=50".to_string()]
    );
}

#[tokio::test]
async fn loader_fires_ready_signal_when_api_answers() {
    let api = FakeApi::default();
    *api.devices.lock().await = json!({"devices": []});
    let base = spawn_fake_api(api).await;

    let engine = engine_for(&base, None);
    tokio::time::timeout(Duration::from_secs(5), engine.spawn_loader().wait())
        .await
        .expect("loader finished")
        .expect("engine available");
}

#[tokio::test]
async fn loader_gives_up_on_rejected_credentials() {
    let api = FakeApi::default();
    *api.reject_auth.lock().await = true;
    let base = spawn_fake_api(api).await;

    let engine = engine_for(&base, None);
    let outcome = tokio::time::timeout(Duration::from_secs(5), engine.spawn_loader().wait())
        .await
        .expect("loader finished");
    assert_eq!(outcome, Err(crate::EngineUnavailable));
}

#[tokio::test]
async fn disconnect_reports_not_ready_for_a_ready_device() {
    let api = FakeApi::default();
    *api.devices.lock().await = kitchen_devices();
    let base = spawn_fake_api(api).await;

    let engine = engine_for(&base, None);
    let mut events = engine.subscribe_events();
    engine.shared.poll_once().await;
    while events.try_recv().is_ok() {}

    engine.disconnect().await.expect("disconnect");
    assert_eq!(events.try_recv().expect("not ready"), EngineEvent::NotReady);
}

#[test]
fn drift_within_tolerance_is_not_a_change() {
    let observed = Instant::now();
    let previous = (snapshot(false, 10_000), observed);
    let later = observed + Duration::from_secs(3);

    assert!(!is_material_change(
        Some(&previous),
        &snapshot(false, 13_400),
        later
    ));
    assert!(is_material_change(
        Some(&previous),
        &snapshot(false, 60_000),
        later
    ));
    assert!(is_material_change(
        Some(&previous),
        &snapshot(true, 13_000),
        later
    ));
    assert!(is_material_change(None, &snapshot(true, 0), later));
}

#[test]
fn paused_position_is_expected_to_hold() {
    let observed = Instant::now();
    let previous = (snapshot(true, 10_000), observed);
    let later = observed + Duration::from_secs(30);

    assert!(!is_material_change(
        Some(&previous),
        &snapshot(true, 10_000),
        later
    ));
}
