use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    auth::{AuthConfig, AuthFlowManager, CallbackListener, LaunchOutcome, PrintNavigator},
    config::{load_settings_from, Settings},
    dispatcher::CommandDispatcher,
    progress::format_time,
    session::{PlaybackSessionController, PlaylistMenu, QueueView, SessionEvent},
};
use playback_engine::{EngineOptions, WebApiEngine};
use reqwest::Client;
use shared::domain::AccessToken;
use storage::Storage;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "station", about = "Log in and drive a remote music player")]
struct Cli {
    /// Settings file; missing files fall back to defaults and environment.
    #[arg(long, default_value = "station.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in through the browser and wait for the redirect.
    Login {
        /// Only open the authorization page; finish later with `complete`.
        #[arg(long)]
        no_wait: bool,
    },
    /// Finish a login from the url the browser was redirected to.
    Complete {
        #[arg(long)]
        url: String,
    },
    /// Forget any pending login.
    Logout,
    Playlists,
    Queue,
    /// Interactive player.
    Play,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings_from(&cli.config, |key| std::env::var(key).ok());
    let storage = Storage::new(&settings.database_url).await?;
    let http = Client::new();
    let auth = AuthFlowManager::new(
        AuthConfig::from_settings(&settings),
        http.clone(),
        Arc::new(storage),
        Arc::new(PrintNavigator),
    );

    match cli.command {
        Command::Login { no_wait: true } => {
            auth.begin_login().await?;
            println!("Run `station complete --url <redirected url>` once you have approved.");
        }
        Command::Login { no_wait: false } => {
            let token = authenticate(&settings, &auth).await?;
            report_token(&token);
        }
        Command::Complete { url } => match auth.handle_launch(&url).await? {
            LaunchOutcome::Authenticated(token) => report_token(&token),
            LaunchOutcome::Redirected(_) => {
                println!("No code in that url; started a new login instead.");
            }
        },
        Command::Logout => {
            auth.logout().await?;
            println!("Logged out.");
        }
        Command::Playlists => {
            let token = authenticate(&settings, &auth).await?;
            let dispatcher = CommandDispatcher::new(http, &settings.api_base_url);
            let menu = PlaylistMenu::from_fetch(dispatcher.list_playlists(&token).await);
            print_menu(&menu);
        }
        Command::Queue => {
            let token = authenticate(&settings, &auth).await?;
            let dispatcher = CommandDispatcher::new(http, &settings.api_base_url);
            print_queue(&QueueView::from_fetch(dispatcher.fetch_queue(&token).await));
        }
        Command::Play => {
            let token = authenticate(&settings, &auth).await?;
            run_player(&settings, http, token, &auth).await?;
        }
    }

    Ok(())
}

async fn authenticate(settings: &Settings, auth: &AuthFlowManager) -> Result<AccessToken> {
    let listener =
        CallbackListener::bind(&settings.redirect_uri, settings.callback_timeout).await?;
    auth.begin_login().await?;
    let launch_url = listener.wait_for_redirect().await?;
    match auth.handle_launch(&launch_url).await? {
        LaunchOutcome::Authenticated(token) => Ok(token),
        LaunchOutcome::Redirected(_) => bail!("redirect carried no authorization code"),
    }
}

fn report_token(token: &AccessToken) {
    match token.expires_at {
        Some(expires_at) => println!("Logged in; token valid until {expires_at}."),
        None => println!("Logged in."),
    }
}

async fn run_player(
    settings: &Settings,
    http: Client,
    token: AccessToken,
    auth: &AuthFlowManager,
) -> Result<()> {
    let engine = Arc::new(WebApiEngine::new(
        http.clone(),
        settings.api_base_url.clone(),
        token.clone(),
        EngineOptions {
            device_name: settings.device_name.clone(),
            initial_volume: settings.initial_volume,
            poll_interval: settings.engine_poll_interval,
        },
    ));
    let ready = engine.spawn_loader();
    let session = PlaybackSessionController::new(
        engine,
        CommandDispatcher::new(http, settings.api_base_url.clone()),
        token,
        settings.autoplay.clone(),
    );

    let printer = tokio::spawn(print_events(session.subscribe()));
    info!(device = %settings.device_name, "station: waiting for playback engine");
    session.attach(ready).await?;

    let mut menu = session.load_playlists().await;
    print_menu(&menu);
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("p") => session.toggle_play().await,
            Some("n") => session.next_track().await,
            Some("b") => session.previous_track().await,
            Some("v") => match parts.next().and_then(|v| v.parse::<f32>().ok()) {
                Some(percent) => session.set_volume(percent / 100.0).await,
                None => println!("usage: v <0-100>"),
            },
            Some("r") => {
                if session.cycle_repeat_mode().await.is_none() {
                    println!("No ready device.");
                }
            }
            Some("s") => print_status(&session).await,
            Some("q") => {
                session.fetch_and_show_queue().await;
            }
            Some("l") => {
                menu = session.load_playlists().await;
                print_menu(&menu);
            }
            Some("x") => {
                session.shutdown().await;
                auth.logout().await?;
                println!("Logged out.");
                printer.abort();
                return Ok(());
            }
            Some("quit") | Some("exit") => break,
            Some("h") | Some("?") => print_help(),
            Some(other) => match other.parse::<usize>() {
                Ok(index) => match &menu {
                    PlaylistMenu::Loaded(playlists) if (1..=playlists.len()).contains(&index) => {
                        session.play_context(&playlists[index - 1].uri).await;
                    }
                    _ => println!("No playlist {index}."),
                },
                Err(_) => println!("Unknown command '{other}'; h for help."),
            },
            None => {}
        }
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::DeviceReady(device_id)) => println!("Device ready ({device_id})."),
            Ok(SessionEvent::DeviceLost) => println!("Device went away."),
            Ok(SessionEvent::PlaybackUpdated(state)) => {
                let marker = if state.paused { "paused" } else { "playing" };
                println!(
                    "[{marker}] {} - {}  {} / {}  repeat {}",
                    state.track.name,
                    state.track.artist_line(),
                    format_time(state.position_ms),
                    format_time(state.duration_ms),
                    state.repeat_mode,
                );
            }
            Ok(SessionEvent::Progress(view)) => debug!(progress = %view.label(), "station: tick"),
            Ok(SessionEvent::RepeatModeChanged(mode)) => println!("Repeat: {mode}"),
            Ok(SessionEvent::PlaylistsLoaded(_)) => {}
            Ok(SessionEvent::QueueLoaded(view)) => print_queue(&view),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "station: dropped session events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_status(session: &PlaybackSessionController) {
    match (session.playback_state().await, session.progress().await) {
        (Some(state), Some(view)) => println!(
            "{} - {}  {} ({:.0}%)",
            state.track.name,
            state.track.artist_line(),
            view.label(),
            view.percent
        ),
        _ => println!("Nothing playing."),
    }
}

fn print_menu(menu: &PlaylistMenu) {
    match menu {
        PlaylistMenu::Loaded(playlists) => {
            println!("Playlists:");
            for (index, playlist) in playlists.iter().enumerate() {
                println!("{:>3}. {}", index + 1, playlist.name);
            }
        }
        PlaylistMenu::Empty => println!("No playlists."),
        PlaylistMenu::Unavailable => println!("Playlists unavailable."),
    }
}

fn print_queue(view: &QueueView) {
    match view {
        QueueView::Tracks(tracks) => {
            println!("Up next:");
            for track in tracks {
                println!(
                    "  {} - {}  {}",
                    track.name,
                    track.artist_line(),
                    format_time(track.duration_ms)
                );
            }
        }
        QueueView::Empty => println!("Queue is empty."),
        QueueView::Unavailable => println!("Queue unavailable."),
    }
}

fn print_help() {
    println!(
        "p play/pause  n next  b back  v <0-100> volume  r repeat  s status\n\
         q queue  l playlists  <number> play playlist  x logout  quit"
    );
}
