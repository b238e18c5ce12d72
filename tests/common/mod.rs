use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitbucket_mcp::auth::BrowserLauncher;
use bitbucket_mcp::config::{ApiConfig, AuthConfig, Config, OAuthConfig};
use tempfile::TempDir;
use wiremock::MockServer;

pub const CLIENT_ID: &str = "test-client";
pub const CLIENT_SECRET: &str = "test-secret";

/// Returns a port that was free a moment ago.
#[allow(dead_code)]
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .expect("failed to reserve a local port")
}

/// Configuration pointing every endpoint at `server`, with an OAuth
/// consumer and a token file inside `dir`.
#[allow(dead_code)]
pub fn oauth_config(server: &MockServer, dir: &TempDir, callback_port: u16) -> Config {
    Config {
        auth: AuthConfig {
            client_id: Some(CLIENT_ID.to_string()),
            client_secret: Some(CLIENT_SECRET.to_string()),
            ..AuthConfig::default()
        },
        oauth: OAuthConfig {
            authorize_url: format!("{}/site/oauth2/authorize", server.uri()),
            token_url: format!("{}/site/oauth2/access_token", server.uri()),
            callback_port,
            scopes: Vec::new(),
            timeout_seconds: 10,
        },
        api: ApiConfig {
            base_url: format!("{}/2.0", server.uri()),
            timeout_seconds: 10,
        },
        token_file: Some(dir.path().join("tokens.json")),
    }
}

/// Same as [`oauth_config`] without consumer credentials.
#[allow(dead_code)]
pub fn plain_config(server: &MockServer, dir: &TempDir) -> Config {
    let mut config = oauth_config(server, dir, free_port());
    config.auth = AuthConfig::default();
    config
}

/// Path of the token endpoint mocked by [`oauth_config`].
#[allow(dead_code)]
pub const TOKEN_PATH: &str = "/site/oauth2/access_token";

/// Token endpoint response body.
#[allow(dead_code)]
pub fn token_body(access_token: &str, refresh_token: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_in": 7200,
        "token_type": "bearer",
        "scopes": "repository pullrequest"
    })
}

// ---------------------------------------------------------------------------
// Scripted browser
// ---------------------------------------------------------------------------

/// What the scripted user does after the authorization URL is opened.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Redirect {
    /// Approve: redirect with `code` and the URL's `state`
    Code(String),
    /// Deny: redirect with `error` and `error_description` (pre-encoded)
    Error(String, String),
    /// Never come back
    Ignore,
}

/// A [`BrowserLauncher`] that plays the user by hitting the callback.
#[allow(dead_code)]
pub struct CallbackBrowser {
    port: u16,
    redirect: Redirect,
    launches: AtomicUsize,
    statuses: Arc<Mutex<Vec<u16>>>,
}

#[allow(dead_code)]
impl CallbackBrowser {
    pub fn new(port: u16, redirect: Redirect) -> Arc<Self> {
        Arc::new(Self {
            port,
            redirect,
            launches: AtomicUsize::new(0),
            statuses: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn approving(port: u16, code: &str) -> Arc<Self> {
        Self::new(port, Redirect::Code(code.to_string()))
    }

    pub fn denying(port: u16, error: &str, description: &str) -> Arc<Self> {
        Self::new(
            port,
            Redirect::Error(error.to_string(), description.to_string()),
        )
    }

    pub fn idle(port: u16) -> Arc<Self> {
        Self::new(port, Redirect::Ignore)
    }

    /// Number of times the authorization URL was opened.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Waits briefly for the callback page status seen by the "browser".
    pub async fn last_status(&self) -> Option<u16> {
        for _ in 0..100 {
            if let Some(status) = self.statuses.lock().unwrap().last().copied() {
                return Some(status);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }
}

impl BrowserLauncher for CallbackBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let state = state_from_url(url).unwrap_or_default();
        let query = match &self.redirect {
            Redirect::Code(code) => format!("code={code}&state={state}"),
            Redirect::Error(error, description) => {
                format!("error={error}&error_description={description}&state={state}")
            }
            Redirect::Ignore => return Ok(()),
        };

        let callback = format!("http://127.0.0.1:{}/callback?{}", self.port, query);
        let statuses = Arc::clone(&self.statuses);
        tokio::spawn(async move {
            if let Ok(response) = reqwest::get(&callback).await {
                statuses.lock().unwrap().push(response.status().as_u16());
            }
        });
        Ok(())
    }
}

/// A launcher that always fails, leaving the test to drive the callback.
#[allow(dead_code)]
pub struct BrokenBrowser;

impl BrowserLauncher for BrokenBrowser {
    fn open(&self, _url: &str) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no browser available",
        ))
    }
}

/// Extracts the `state` parameter of an authorization URL.
#[allow(dead_code)]
pub fn state_from_url(url: &str) -> Option<String> {
    url::Url::parse(url).ok().and_then(|u| {
        u.query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
    })
}
