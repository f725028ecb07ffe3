//! Authorization-code login with PKCE. The flow is split in two legs around a
//! redirect: [`AuthFlowManager::begin_login`] persists the verifier and sends the
//! user to the authorization server, [`AuthFlowManager::complete_login`] runs after
//! the redirect comes back, possibly in a new process.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::AccessToken,
    error::ApiError,
    protocol::{TokenExchangeForm, TokenResponse},
};
use storage::VerifierStore;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::{config::Settings, error::AuthError, pkce::PkcePair};

pub use crate::callback::CallbackListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    AwaitingRedirect,
    ExchangingCode,
    Authenticated,
    Failed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::AwaitingRedirect => "awaiting_redirect",
            AuthState::ExchangingCode => "exchanging_code",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: Option<String>,
    pub redirect_uri: String,
    pub auth_base_url: String,
    pub scopes: Vec<String>,
    pub verifier_length: usize,
    pub token_timeout: Duration,
}

impl AuthConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            client_id: settings.client_id.clone(),
            redirect_uri: settings.redirect_uri.clone(),
            auth_base_url: settings.auth_base_url.clone(),
            scopes: settings.scopes.clone(),
            verifier_length: settings.verifier_length,
            token_timeout: settings.token_timeout,
        }
    }
}

/// Where the authorization page gets opened.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn navigate(&self, url: &Url) -> anyhow::Result<()>;
}

/// Prints the authorization url for the user to open.
pub struct PrintNavigator;

#[async_trait]
impl Navigator for PrintNavigator {
    async fn navigate(&self, url: &Url) -> anyhow::Result<()> {
        println!("Open this page to log in:\n\n  {url}\n");
        Ok(())
    }
}

/// What a launch (or redirect) url asks the client to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchRoute {
    BeginLogin,
    CompleteLogin { code: String },
    AuthorizationDenied { error: String },
}

impl LaunchRoute {
    /// Accepts an absolute url or a bare `?query`.
    pub fn from_url(raw: &str) -> Self {
        let parsed = Url::parse(raw).or_else(|_| {
            Url::parse("http://localhost/").and_then(|base| base.join(raw.trim()))
        });
        let Ok(url) = parsed else {
            return LaunchRoute::BeginLogin;
        };

        let mut code = None;
        let mut error = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" if !value.is_empty() => code = Some(value.into_owned()),
                "error" if !value.is_empty() => error = Some(value.into_owned()),
                _ => {}
            }
        }
        match (error, code) {
            (Some(error), _) => LaunchRoute::AuthorizationDenied { error },
            (None, Some(code)) => LaunchRoute::CompleteLogin { code },
            (None, None) => LaunchRoute::BeginLogin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginRedirect {
    pub authorize_url: Url,
    pub challenge: String,
}

#[derive(Debug)]
pub enum LaunchOutcome {
    Redirected(LoginRedirect),
    Authenticated(AccessToken),
}

/// Redirect uri as sent to the authorization server: no query, no fragment.
pub fn normalize_redirect_uri(raw: &str) -> Result<String, AuthError> {
    let mut url =
        Url::parse(raw.trim()).map_err(|_| AuthError::InvalidUrl(raw.to_string()))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

pub struct AuthFlowManager {
    config: AuthConfig,
    http: Client,
    store: Arc<dyn VerifierStore>,
    navigator: Arc<dyn Navigator>,
    state: Mutex<AuthState>,
}

impl AuthFlowManager {
    pub fn new(
        config: AuthConfig,
        http: Client,
        store: Arc<dyn VerifierStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            config,
            http,
            store,
            navigator,
            state: Mutex::new(AuthState::Unauthenticated),
        }
    }

    pub async fn state(&self) -> AuthState {
        *self.state.lock().await
    }

    async fn set_state(&self, next: AuthState) {
        let mut state = self.state.lock().await;
        if *state != next {
            info!(from = %*state, to = %next, "auth: state changed");
            *state = next;
        }
    }

    async fn fail(&self, err: AuthError) -> AuthError {
        warn!("auth: login failed: {err}");
        self.set_state(AuthState::Failed).await;
        err
    }

    fn client_id(&self) -> Result<&str, AuthError> {
        self.config
            .client_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(AuthError::Config)
    }

    /// First leg: persists a fresh verifier (replacing any earlier one) and opens the
    /// authorization page. Nothing is persisted or opened without a client id.
    pub async fn begin_login(&self) -> Result<LoginRedirect, AuthError> {
        let client_id = self.client_id()?.to_string();
        let redirect_uri = normalize_redirect_uri(&self.config.redirect_uri)?;

        let pair = PkcePair::generate(self.config.verifier_length);
        self.store
            .save_verifier(&pair.verifier)
            .await
            .map_err(|source| AuthError::Storage { source })?;

        let mut authorize_url = Url::parse(&format!("{}/authorize", self.config.auth_base_url))
            .map_err(|_| AuthError::InvalidUrl(self.config.auth_base_url.clone()))?;
        authorize_url
            .query_pairs_mut()
            .append_pair("client_id", &client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &pair.challenge);

        if let Err(source) = self.navigator.navigate(&authorize_url).await {
            return Err(self.fail(AuthError::Navigation { source }).await);
        }
        self.set_state(AuthState::AwaitingRedirect).await;

        Ok(LoginRedirect {
            authorize_url,
            challenge: pair.challenge,
        })
    }

    /// Second leg: exchanges `code` using the verifier persisted by the first leg.
    pub async fn complete_login(&self, code: &str) -> Result<AccessToken, AuthError> {
        let client_id = self.client_id()?.to_string();
        let redirect_uri = normalize_redirect_uri(&self.config.redirect_uri)?;
        self.set_state(AuthState::AwaitingRedirect).await;

        let verifier = match self.store.load_verifier().await {
            Ok(Some(verifier)) => verifier,
            Ok(None) => return Err(self.fail(AuthError::MissingVerifier).await),
            Err(source) => return Err(self.fail(AuthError::Storage { source }).await),
        };

        self.set_state(AuthState::ExchangingCode).await;
        let form = TokenExchangeForm {
            client_id: &client_id,
            grant_type: "authorization_code",
            code,
            redirect_uri: &redirect_uri,
            code_verifier: &verifier,
        };
        let exchange = tokio::time::timeout(self.config.token_timeout, self.exchange(&form));
        let token = match exchange.await {
            Ok(Ok(token)) => token,
            Ok(Err(err)) => return Err(self.fail(err).await),
            Err(_) => {
                return Err(self
                    .fail(AuthError::TokenExchangeTimedOut(self.config.token_timeout))
                    .await)
            }
        };

        if let Err(err) = self.store.clear_verifier().await {
            warn!("auth: failed to clear consumed verifier: {err:#}");
        }
        self.set_state(AuthState::Authenticated).await;
        Ok(token)
    }

    async fn exchange(&self, form: &TokenExchangeForm<'_>) -> Result<AccessToken, AuthError> {
        let res = self
            .http
            .post(format!("{}/api/token", self.config.auth_base_url))
            .form(form)
            .send()
            .await
            .map_err(AuthError::TokenExchangeTransport)?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(AuthError::TokenExchangeTransport)?;
        if !status.is_success() {
            return Err(AuthError::TokenExchangeFailed(ApiError::from_response_body(
                status.as_u16(),
                &body,
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| AuthError::MalformedTokenResponse(err.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::MalformedTokenResponse(
                "access_token is empty".into(),
            ));
        }

        let mut token = AccessToken::new(parsed.access_token).with_scope(parsed.scope);
        if let Some(expires_in) = parsed.expires_in {
            token = token.with_lifetime(expires_in).ok_or_else(|| {
                AuthError::MalformedTokenResponse(format!(
                    "expires_in {expires_in} is out of range"
                ))
            })?;
        }
        Ok(token)
    }

    /// Routes a launch url: a `code` completes the login, an `error` reports the
    /// refusal, anything else begins a new login.
    pub async fn handle_launch(&self, launch_url: &str) -> Result<LaunchOutcome, AuthError> {
        match LaunchRoute::from_url(launch_url) {
            LaunchRoute::BeginLogin => self.begin_login().await.map(LaunchOutcome::Redirected),
            LaunchRoute::CompleteLogin { code } => self
                .complete_login(&code)
                .await
                .map(LaunchOutcome::Authenticated),
            LaunchRoute::AuthorizationDenied { error } => {
                Err(self.fail(AuthError::AuthorizationDenied(error)).await)
            }
        }
    }

    /// Forgets the persisted verifier. The token is not revoked server-side.
    pub async fn logout(&self) -> Result<(), AuthError> {
        self.store
            .clear_verifier()
            .await
            .map_err(|source| AuthError::Storage { source })?;
        self.set_state(AuthState::Unauthenticated).await;
        info!("auth: logged out");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
