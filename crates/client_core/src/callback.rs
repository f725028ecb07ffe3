//! Loopback receiver for the authorization redirect. Accepts a single request on the
//! redirect path and hands back the url it was called with.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use axum::{extract::State, http::Uri, response::Html, routing::get, Router};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
};
use tracing::{debug, info};
use url::{Host, Url};

const LANDING_PAGE: &str = "<!doctype html><html><body>\
<h3>Login received.</h3><p>You can close this tab and return to the terminal.</p>\
</body></html>";

#[derive(Clone)]
struct CallbackState {
    origin: String,
    tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

pub struct CallbackListener {
    listener: TcpListener,
    path: String,
    timeout: Duration,
}

impl CallbackListener {
    /// Binds the host and port named by `redirect_uri`.
    pub async fn bind(redirect_uri: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(redirect_uri)
            .with_context(|| format!("invalid redirect uri '{redirect_uri}'"))?;
        let (host, port) = listen_target(&url)?;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .with_context(|| format!("failed to bind redirect listener on {host} port {port}"))?;
        Ok(Self::from_listener(listener, url.path(), timeout))
    }

    pub fn from_listener(listener: TcpListener, path: &str, timeout: Duration) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            listener,
            path,
            timeout,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until the first request on the redirect path, then returns its full url.
    pub async fn wait_for_redirect(self) -> Result<String> {
        let addr = self.local_addr()?;
        let (tx, rx) = oneshot::channel();
        let state = CallbackState {
            origin: format!("http://{addr}"),
            tx: Arc::new(Mutex::new(Some(tx))),
        };
        let app = Router::new()
            .route(&self.path, get(receive_redirect))
            .with_state(state);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let listener = self.listener;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await;
        });
        info!(%addr, path = %self.path, "auth: waiting for redirect");

        let received = tokio::time::timeout(self.timeout, rx).await;
        let _ = stop_tx.send(());
        // Bounded wait for in-flight responses.
        if tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .is_err()
        {
            debug!("auth: redirect listener did not stop in time");
        }

        match received {
            Ok(Ok(url)) => Ok(url),
            Ok(Err(_)) => Err(anyhow!("redirect listener stopped unexpectedly")),
            Err(_) => Err(anyhow!("no redirect received within {:?}", self.timeout)),
        }
    }
}

/// Host and port to listen on. IPv6 literals come back without brackets.
fn listen_target(url: &Url) -> Result<(String, u16)> {
    let host = match url.host() {
        Some(Host::Domain(name)) => name.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(anyhow!("redirect uri '{url}' has no host")),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("redirect uri '{url}' has no port"))?;
    Ok((host, port))
}

async fn receive_redirect(State(state): State<CallbackState>, uri: Uri) -> Html<&'static str> {
    if let Some(tx) = state.tx.lock().await.take() {
        let _ = tx.send(format!("{}{}", state.origin, uri));
    }
    Html(LANDING_PAGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LaunchRoute;

    async fn local_listener() -> TcpListener {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        TcpListener::bind("127.0.0.1:0").await.expect("bind")
    }

    #[tokio::test]
    async fn returns_the_redirect_url() {
        let listener = CallbackListener::from_listener(
            local_listener().await,
            "/callback",
            Duration::from_secs(5),
        );
        let addr = listener.local_addr().expect("addr");
        let waiting = tokio::spawn(listener.wait_for_redirect());

        let page = reqwest::get(format!("http://{addr}/callback?code=abc123&state=x"))
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
        assert!(page.contains("Login received"));

        let url = waiting.await.expect("join").expect("redirect");
        assert_eq!(
            LaunchRoute::from_url(&url),
            LaunchRoute::CompleteLogin {
                code: "abc123".into()
            }
        );
    }

    #[tokio::test]
    async fn other_paths_are_not_accepted() {
        let listener = CallbackListener::from_listener(
            local_listener().await,
            "/callback",
            Duration::from_secs(5),
        );
        let addr = listener.local_addr().expect("addr");
        let waiting = tokio::spawn(listener.wait_for_redirect());

        let status = reqwest::get(format!("http://{addr}/favicon.ico"))
            .await
            .expect("request")
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

        reqwest::get(format!("http://{addr}/callback?error=access_denied"))
            .await
            .expect("request");
        let url = waiting.await.expect("join").expect("redirect");
        assert_eq!(
            LaunchRoute::from_url(&url),
            LaunchRoute::AuthorizationDenied {
                error: "access_denied".into()
            }
        );
    }

    #[tokio::test]
    async fn gives_up_after_timeout() {
        let listener = CallbackListener::from_listener(
            local_listener().await,
            "/callback",
            Duration::from_millis(100),
        );
        let err = listener.wait_for_redirect().await.expect_err("timeout");
        assert!(err.to_string().contains("no redirect received"));
    }

    #[test]
    fn listen_target_unwraps_ipv6_literals() {
        let v6 = Url::parse("http://[::1]:8888/callback").expect("url");
        assert_eq!(listen_target(&v6).expect("target"), ("::1".to_string(), 8888));

        let v4 = Url::parse("http://127.0.0.1/callback").expect("url");
        assert_eq!(listen_target(&v4).expect("target"), ("127.0.0.1".to_string(), 80));

        let named = Url::parse("http://localhost:8888/callback").expect("url");
        assert_eq!(
            listen_target(&named).expect("target"),
            ("localhost".to_string(), 8888)
        );
    }

    #[tokio::test]
    async fn bind_rejects_invalid_uri() {
        let err = CallbackListener::bind("not a url", Duration::from_secs(1))
            .await
            .err()
            .expect("invalid");
        assert!(err.to_string().contains("invalid redirect uri"));
    }
}
