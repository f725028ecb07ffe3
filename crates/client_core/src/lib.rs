pub mod auth;
pub mod callback;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pkce;
pub mod progress;
pub mod session;

pub use auth::{AuthConfig, AuthFlowManager, AuthState, LaunchOutcome, LaunchRoute, Navigator};
pub use config::{load_settings, AutoplayPolicy, Settings};
pub use dispatcher::{CommandDispatcher, CommandOutcome};
pub use error::{AuthError, FetchError, SessionError};
pub use session::{PlaybackSessionController, PlaylistMenu, QueueView, SessionEvent};
