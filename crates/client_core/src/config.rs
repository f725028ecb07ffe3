use std::{collections::HashMap, fmt, fs, path::Path, str::FromStr, time::Duration};

use shared::domain::ContextUri;
use tracing::warn;

use crate::pkce::{MAX_VERIFIER_LEN, MIN_VERIFIER_LEN};

pub const DEFAULT_SCOPES: &[&str] = &[
    "streaming",
    "user-read-email",
    "user-read-private",
    "user-read-playback-state",
    "user-modify-playback-state",
    "user-read-currently-playing",
    "playlist-read-private",
    "playlist-read-collaborative",
];

/// Which context, if any, starts playing when the device first becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AutoplayPolicy {
    /// First playlist of the listing, in service order.
    #[default]
    FirstPlaylist,
    Disabled,
    Context(ContextUri),
}

impl FromStr for AutoplayPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some(uri) = value.strip_prefix("context:") {
            if uri.is_empty() {
                return Err("autoplay context uri is empty".into());
            }
            return Ok(AutoplayPolicy::Context(ContextUri::from(uri)));
        }
        match value.to_ascii_lowercase().as_str() {
            "first_playlist" | "first-playlist" => Ok(AutoplayPolicy::FirstPlaylist),
            "none" | "off" | "disabled" => Ok(AutoplayPolicy::Disabled),
            other => Err(format!("unknown autoplay policy '{other}'")),
        }
    }
}

impl fmt::Display for AutoplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoplayPolicy::FirstPlaylist => f.write_str("first_playlist"),
            AutoplayPolicy::Disabled => f.write_str("none"),
            AutoplayPolicy::Context(uri) => write!(f, "context:{uri}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub client_id: Option<String>,
    pub redirect_uri: String,
    pub auth_base_url: String,
    pub api_base_url: String,
    pub scopes: Vec<String>,
    pub verifier_length: usize,
    pub token_timeout: Duration,
    pub callback_timeout: Duration,
    pub database_url: String,
    pub device_name: String,
    pub initial_volume: Option<f32>,
    pub autoplay: AutoplayPolicy,
    pub engine_poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: None,
            redirect_uri: "http://127.0.0.1:8888/callback".into(),
            auth_base_url: "https://accounts.spotify.com".into(),
            api_base_url: "https://api.spotify.com".into(),
            scopes: DEFAULT_SCOPES.iter().map(|scope| scope.to_string()).collect(),
            verifier_length: MAX_VERIFIER_LEN,
            token_timeout: Duration::from_secs(30),
            callback_timeout: Duration::from_secs(300),
            database_url: "sqlite://./data/station.db".into(),
            device_name: "Player Station - Music Station".into(),
            initial_volume: Some(0.5),
            autoplay: AutoplayPolicy::FirstPlaylist,
            engine_poll_interval: Duration::from_secs(1),
        }
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new("station.toml"), |key| std::env::var(key).ok())
}

/// Defaults, then `path` (a flat table of strings), then the environment.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in &file_cfg {
                    apply(&mut settings, key, value);
                }
            }
            Err(err) => warn!("ignoring unreadable {}: {err}", path.display()),
        }
    }

    for key in KEYS {
        if let Some(v) = env(&format!("APP__{}", key.to_ascii_uppercase())) {
            apply(&mut settings, key, &v);
        }
    }
    if let Some(v) = env("STATION_CLIENT_ID") {
        apply(&mut settings, "client_id", &v);
    }

    settings
}

const KEYS: &[&str] = &[
    "client_id",
    "redirect_uri",
    "auth_base_url",
    "api_base_url",
    "scopes",
    "verifier_length",
    "token_timeout_secs",
    "callback_timeout_secs",
    "database_url",
    "device_name",
    "initial_volume",
    "autoplay",
    "poll_interval_ms",
];

fn apply(settings: &mut Settings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "client_id" => {
            settings.client_id = (!value.is_empty()).then(|| value.to_string());
        }
        "redirect_uri" => settings.redirect_uri = value.to_string(),
        "auth_base_url" => settings.auth_base_url = value.trim_end_matches('/').to_string(),
        "api_base_url" => settings.api_base_url = value.trim_end_matches('/').to_string(),
        "scopes" => {
            settings.scopes = value
                .split([' ', ','])
                .filter(|scope| !scope.is_empty())
                .map(str::to_string)
                .collect();
        }
        "verifier_length" => match value.parse::<usize>() {
            Ok(length) => {
                let clamped = length.clamp(MIN_VERIFIER_LEN, MAX_VERIFIER_LEN);
                if clamped != length {
                    warn!("verifier_length {length} out of range; using {clamped}");
                }
                settings.verifier_length = clamped;
            }
            Err(_) => warn!("ignoring non-numeric verifier_length '{value}'"),
        },
        "token_timeout_secs" => {
            if let Ok(parsed) = value.parse::<u64>() {
                settings.token_timeout = Duration::from_secs(parsed);
            }
        }
        "callback_timeout_secs" => {
            if let Ok(parsed) = value.parse::<u64>() {
                settings.callback_timeout = Duration::from_secs(parsed);
            }
        }
        "database_url" => settings.database_url = value.to_string(),
        "device_name" => settings.device_name = value.to_string(),
        "initial_volume" => {
            if value.eq_ignore_ascii_case("none") {
                settings.initial_volume = None;
            } else if let Ok(parsed) = value.parse::<f32>() {
                settings.initial_volume = Some(parsed.clamp(0.0, 1.0));
            }
        }
        "autoplay" => match value.parse::<AutoplayPolicy>() {
            Ok(policy) => settings.autoplay = policy,
            Err(err) => warn!("ignoring autoplay setting: {err}"),
        },
        "poll_interval_ms" => {
            if let Ok(parsed) = value.parse::<u64>() {
                settings.engine_poll_interval = Duration::from_millis(parsed.max(100));
            }
        }
        other => warn!("ignoring unknown setting '{other}'"),
    }
}
