//! Browser-based OAuth authorization code flow
//!
//! [`AuthorizationFlow::start`] binds the local redirect listener, presents
//! the authorization URL and returns a [`PendingAuthorization`]. The pending
//! value settles exactly once, on whichever of these happens first:
//!
//! 1. A `/callback?code=...` redirect whose code is redeemed (or fails to be).
//! 2. A `/callback?error=...` redirect from the provider.
//! 3. The watchdog timer expiring.
//! 4. The listener dying before any of the above.
//!
//! The listener and the watchdog are torn down on every one of these paths
//! before [`PendingAuthorization::wait`] returns.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use futures::FutureExt as _;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

use crate::auth::credentials::{CredentialSet, PersistedCredential};
use crate::auth::exchange::TokenClient;
use crate::auth::token_store::TokenStore;
use crate::config::OAuthConfig;
use crate::error::{AuthError, BitbucketError, Result};

/// How long a stopping listener may spend finishing its last response.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type FlowResult = std::result::Result<CredentialSet, AuthError>;

// ---------------------------------------------------------------------------
// Browser launching
// ---------------------------------------------------------------------------

/// Opens the authorization URL for the user.
///
/// Implementations are best-effort. A returned error never fails the flow;
/// the URL is printed instead.
pub trait BrowserLauncher: Send + Sync {
    /// Opens `url` in a browser.
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Launches the platform's default browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        #[cfg(target_os = "macos")]
        let mut command = {
            let mut c = std::process::Command::new("open");
            c.arg(url);
            c
        };
        #[cfg(target_os = "windows")]
        let mut command = {
            let mut c = std::process::Command::new("cmd");
            c.args(["/C", "start", "", url]);
            c
        };
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let mut command = {
            let mut c = std::process::Command::new("xdg-open");
            c.arg(url);
            c
        };

        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// AuthorizationFlow
// ---------------------------------------------------------------------------

/// Drives one browser consent and code exchange per [`start`](Self::start).
///
/// # Examples
///
/// ```no_run
/// use bitbucket_mcp::auth::{AuthorizationFlow, ClientIdentity, TokenClient, TokenStore};
/// use bitbucket_mcp::config::OAuthConfig;
///
/// # async fn example() -> anyhow::Result<()> {
/// let oauth = OAuthConfig::default();
/// let tokens = TokenClient::new(
///     reqwest::Client::new(),
///     oauth.token_url.clone(),
///     ClientIdentity::new("key", "secret"),
/// );
/// let flow = AuthorizationFlow::new(&oauth, tokens, TokenStore::new())?;
///
/// let credential = flow.start().await?.wait().await?;
/// println!("authorized until {}", credential.expires_at);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AuthorizationFlow {
    authorize_url: Url,
    callback_port: u16,
    scopes: Vec<String>,
    timeout: Duration,
    tokens: TokenClient,
    store: TokenStore,
    launcher: Arc<dyn BrowserLauncher>,
}

impl std::fmt::Debug for AuthorizationFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationFlow")
            .field("authorize_url", &self.authorize_url.as_str())
            .field("callback_port", &self.callback_port)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AuthorizationFlow {
    /// Creates a flow using the system browser.
    ///
    /// # Errors
    ///
    /// Returns [`BitbucketError::Config`] if the authorization endpoint is not
    /// a valid URL.
    pub fn new(oauth: &OAuthConfig, tokens: TokenClient, store: TokenStore) -> Result<Self> {
        let authorize_url = Url::parse(&oauth.authorize_url).map_err(|e| {
            BitbucketError::Config(format!(
                "invalid authorization endpoint {}: {}",
                oauth.authorize_url, e
            ))
        })?;

        Ok(Self {
            authorize_url,
            callback_port: oauth.callback_port,
            scopes: oauth.scopes.clone(),
            timeout: Duration::from_secs(oauth.timeout_seconds),
            tokens,
            store,
            launcher: Arc::new(SystemBrowser),
        })
    }

    /// Replaces the browser launcher.
    pub fn with_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Replaces the watchdog duration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the authorization URL carrying `state`.
    pub fn authorization_url(&self, state: &str) -> String {
        let mut url = self.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.tokens.identity().client_id);
            query.append_pair("response_type", "code");
            query.append_pair("state", state);
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
        }
        url.to_string()
    }

    /// Starts the listener and the watchdog, then presents the URL.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Listener`] when the callback port cannot be bound.
    /// Later failures are reported by [`PendingAuthorization::wait`].
    pub async fn start(&self) -> std::result::Result<PendingAuthorization, AuthError> {
        let state = generate_state();
        let authorization_url = self.authorization_url(&state);

        // Bind before presenting the URL so the redirect has a destination.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.callback_port))
            .await
            .map_err(|e| {
                AuthError::Listener(format!(
                    "failed to bind 127.0.0.1:{}: {}",
                    self.callback_port, e
                ))
            })?;
        let callback_addr = listener
            .local_addr()
            .map_err(|e| AuthError::Listener(format!("failed to get local address: {e}")))?;

        // `localhost` may resolve to ::1 first; serve it too when available.
        let listener_v6 = match TcpListener::bind((Ipv6Addr::LOCALHOST, callback_addr.port())).await
        {
            Ok(listener) => Some(listener),
            Err(e) => {
                tracing::debug!("IPv6 loopback listener unavailable: {}", e);
                None
            }
        };

        let (result_tx, result_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route("/callback", get(handle_callback))
            .fallback(not_found)
            .with_state(Arc::new(CallbackState {
                expected_state: state,
                tokens: self.tokens.clone(),
                store: self.store.clone(),
                settle: Mutex::new(Some(result_tx)),
            }));

        let shutdown = shutdown_rx.map(|_| ()).shared();
        let server = AbortOnDrop(tokio::spawn(async move {
            let v4 = axum::serve(listener, app.clone())
                .with_graceful_shutdown(shutdown.clone())
                .into_future();
            match listener_v6 {
                Some(listener_v6) => {
                    let v6 = axum::serve(listener_v6, app)
                        .with_graceful_shutdown(shutdown)
                        .into_future();
                    let (v4, v6) = futures::future::join(v4, v6).await;
                    v4.and(v6)
                }
                None => v4.await,
            }
        }));
        tracing::debug!("OAuth callback listener started on {}", callback_addr);

        let timeout = self.timeout;
        let supervisor = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, result_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AuthError::Listener(
                    "callback listener stopped before a redirect arrived".to_string(),
                )),
                Err(_) => {
                    tracing::warn!("OAuth flow timed out after {}s", timeout.as_secs());
                    Err(AuthError::Timeout(timeout.as_secs()))
                }
            };

            let _ = shutdown_tx.send(());
            stop_server(server).await;
            tracing::debug!("OAuth callback listener on {} stopped", callback_addr);
            outcome
        });

        self.present(&authorization_url);

        Ok(PendingAuthorization {
            callback_addr,
            authorization_url,
            task: Some(supervisor),
        })
    }

    /// Runs the whole flow and waits for its outcome.
    pub async fn run(&self) -> FlowResult {
        self.start().await?.wait().await
    }

    fn present(&self, url: &str) {
        tracing::info!("Waiting for Bitbucket authorization in the browser");
        eprintln!("\nAuthorize Bitbucket access by opening this URL:\n\n  {}\n", url);

        if let Err(e) = self.launcher.open(url) {
            tracing::warn!("Could not open browser automatically: {}", e);
            eprintln!("Please open this URL manually: {}", url);
        }
    }
}

// ---------------------------------------------------------------------------
// PendingAuthorization
// ---------------------------------------------------------------------------

/// A started authorization that settles exactly once.
///
/// Dropping it without calling [`wait`](Self::wait) cancels the flow and
/// closes the listener.
#[derive(Debug)]
pub struct PendingAuthorization {
    callback_addr: SocketAddr,
    authorization_url: String,
    task: Option<JoinHandle<FlowResult>>,
}

impl PendingAuthorization {
    /// IPv4 loopback address the redirect listener is bound to.
    ///
    /// The same port is also served on `::1` when IPv6 is available.
    pub fn callback_addr(&self) -> SocketAddr {
        self.callback_addr
    }

    /// URL the user was asked to open.
    pub fn authorization_url(&self) -> &str {
        &self.authorization_url
    }

    /// Waits for the flow to settle.
    ///
    /// The listener is closed when this returns.
    pub async fn wait(mut self) -> FlowResult {
        let Some(task) = self.task.take() else {
            return Err(AuthError::Listener("authorization already awaited".to_string()));
        };
        task.await.unwrap_or_else(|e| {
            Err(AuthError::Listener(format!("authorization task failed: {e}")))
        })
    }
}

impl Drop for PendingAuthorization {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Listener internals
// ---------------------------------------------------------------------------

struct AbortOnDrop(JoinHandle<std::io::Result<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn stop_server(mut server: AbortOnDrop) {
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut server.0).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!("OAuth callback listener failed: {}", e),
        Ok(Err(e)) => tracing::warn!("OAuth callback listener task failed: {}", e),
        Err(_) => {
            server.0.abort();
            let _ = (&mut server.0).await;
        }
    }
}

struct CallbackState {
    expected_state: String,
    tokens: TokenClient,
    store: TokenStore,
    settle: Mutex<Option<oneshot::Sender<FlowResult>>>,
}

impl CallbackState {
    /// Claims the right to settle the flow. Only the first caller gets it.
    fn claim(&self) -> Option<oneshot::Sender<FlowResult>> {
        self.settle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    if let Some(error) = params.get("error") {
        let description = params.get("error_description").cloned().unwrap_or_default();
        let Some(settle) = state.claim() else {
            return already_completed();
        };

        tracing::warn!("Authorization rejected by provider: {}", error);
        let page = error_page(
            "Authorization failed",
            &format!("{}: {}", error, description),
        );
        let _ = settle.send(Err(AuthError::Denied {
            error: error.clone(),
            description,
        }));
        return (StatusCode::BAD_REQUEST, page);
    }

    let Some(code) = params.get("code") else {
        return (
            StatusCode::BAD_REQUEST,
            error_page("Invalid callback", "No authorization code was provided."),
        );
    };

    if params.get("state") != Some(&state.expected_state) {
        tracing::warn!("Ignoring OAuth callback with mismatched state");
        return (
            StatusCode::BAD_REQUEST,
            error_page("Invalid callback", "The state parameter does not match."),
        );
    }

    let Some(settle) = state.claim() else {
        return already_completed();
    };

    tracing::info!("Received authorization code");
    match state.tokens.exchange_code(code).await {
        Ok(credential) => {
            state.store.save(&PersistedCredential::new(
                credential.clone(),
                state.tokens.identity().client_id.clone(),
            ));
            let _ = settle.send(Ok(credential));
            (StatusCode::OK, success_page())
        }
        Err(e) => {
            tracing::warn!("{}", e);
            let page = error_page("Token exchange failed", &e.to_string());
            let _ = settle.send(Err(e));
            (StatusCode::INTERNAL_SERVER_ERROR, page)
        }
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

fn already_completed() -> (StatusCode, Html<String>) {
    (
        StatusCode::BAD_REQUEST,
        error_page(
            "Authorization already completed",
            "This authorization request has already been handled.",
        ),
    )
}

/// 16 random bytes encoded as base64url without padding.
fn generate_state() -> String {
    use rand::RngCore as _;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn success_page() -> Html<String> {
    Html(
        "<!DOCTYPE html><html><head><title>Authorization successful</title></head>\
         <body style=\"font-family: sans-serif; text-align: center; padding: 3em;\">\
         <h1>Authorization successful</h1>\
         <p>Bitbucket access has been granted. You can close this window.</p>\
         </body></html>"
            .to_string(),
    )
}

fn error_page(title: &str, detail: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head>\
         <body style=\"font-family: sans-serif; text-align: center; padding: 3em;\">\
         <h1>{title}</h1><p>{detail}</p>\
         <p>You can close this window and try again.</p>\
         </body></html>",
        title = escape_html(title),
        detail = escape_html(detail),
    ))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
