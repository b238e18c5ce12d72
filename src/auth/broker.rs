//! In-memory credential state and the single-flight authorization discipline
//!
//! The broker is constructed once per process and cloned into every consumer
//! that needs authenticated access. It decides, on every token request,
//! whether the held credential can be used as-is, needs a refresh, or has to
//! be obtained through the browser.
//!
//! At most one refresh or authorization runs at a time. The running attempt
//! is stored as a [`Shared`] future; callers arriving while it runs clone and
//! await it, so they all observe the same credential or the same error. The
//! attempt clears itself from the state when it settles.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::auth::credentials::{
    AuthStrategy, CredentialSet, PersistedCredential, DEFAULT_TOKEN_LIFETIME_SECS,
};
use crate::auth::exchange::TokenClient;
use crate::auth::flow::{AuthorizationFlow, BrowserLauncher, SystemBrowser};
use crate::auth::token_store::TokenStore;
use crate::config::Config;
use crate::error::{AuthError, BitbucketError, Result};

/// Remaining lifetime below which a credential is refreshed proactively.
pub const REFRESH_MARGIN_SECS: i64 = 300;

type SharedAttempt = Shared<BoxFuture<'static, std::result::Result<CredentialSet, AuthError>>>;

fn refresh_margin() -> Duration {
    Duration::seconds(REFRESH_MARGIN_SECS)
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerState {
    credential: Option<CredentialSet>,
    in_flight: Option<SharedAttempt>,
}

/// Token endpoint and browser flow, present when a consumer is configured.
struct OAuthClients {
    tokens: TokenClient,
    flow: AuthorizationFlow,
}

struct Inner {
    strategy: Option<AuthStrategy>,
    oauth: Option<OAuthClients>,
    store: TokenStore,
    guidance: String,
    state: Mutex<BrokerState>,
}

#[derive(Clone)]
enum AttemptKind {
    Refresh(String),
    Interactive,
}

enum Step {
    Ready(CredentialSet),
    Begin(AttemptKind),
}

// ---------------------------------------------------------------------------
// CredentialBroker
// ---------------------------------------------------------------------------

/// Produces a valid bearer string on demand.
///
/// Cloning is cheap; all clones share the same state.
///
/// # Examples
///
/// ```
/// use bitbucket_mcp::auth::CredentialBroker;
/// use bitbucket_mcp::config::Config;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let mut config = Config::default();
/// config.auth.access_token = Some("tok123".to_string());
///
/// let broker = CredentialBroker::new(&config, reqwest::Client::new())?;
/// assert_eq!(broker.get_access_token().await?, "tok123");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CredentialBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("strategy", &self.inner.strategy.as_ref().map(AuthStrategy::label))
            .field("token_file", &self.inner.store.path())
            .finish_non_exhaustive()
    }
}

impl CredentialBroker {
    /// Creates a broker that opens the system browser for authorization.
    ///
    /// # Errors
    ///
    /// Returns [`BitbucketError::Config`] if the OAuth endpoints are invalid.
    /// Missing credentials are not an error here; they are reported by the
    /// first [`get_access_token`](Self::get_access_token) call.
    pub fn new(config: &Config, http: reqwest::Client) -> Result<Self> {
        Self::with_launcher(config, http, Arc::new(SystemBrowser))
    }

    /// Creates a broker with a custom browser launcher.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_launcher(
        config: &Config,
        http: reqwest::Client,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Self> {
        let strategy = AuthStrategy::from_config(&config.auth);
        let store = TokenStore::from_config(config);

        let oauth = match strategy.as_ref().and_then(AuthStrategy::identity) {
            Some(identity) => {
                let tokens =
                    TokenClient::new(http, config.oauth.token_url.clone(), identity.clone());
                let flow = AuthorizationFlow::new(&config.oauth, tokens.clone(), store.clone())?
                    .with_launcher(launcher);
                Some(OAuthClients { tokens, flow })
            }
            None => None,
        };

        let credential = match &strategy {
            Some(AuthStrategy::InteractiveOAuth { identity }) => {
                let stored = store.load_for(&identity.client_id);
                if stored.is_some() {
                    tracing::info!("Using stored credential from {}", store.path().display());
                }
                stored
            }
            Some(other) => static_credential(other),
            None => None,
        };

        match &strategy {
            Some(s) => tracing::debug!("Authentication strategy: {}", s.label()),
            None => tracing::debug!("No Bitbucket credentials configured"),
        }

        Ok(Self {
            inner: Arc::new(Inner {
                strategy,
                oauth,
                store,
                guidance: guidance(config.oauth.callback_port),
                state: Mutex::new(BrokerState {
                    credential,
                    in_flight: None,
                }),
            }),
        })
    }

    /// Returns a currently valid access token.
    ///
    /// Refreshes a credential that expires within five minutes, and runs the
    /// browser flow when none is held and a consumer is configured. Callers
    /// arriving while a refresh or authorization is running share its result.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotAuthenticated`] when nothing is configured,
    /// or the failure of the refresh/authorization attempt.
    pub async fn get_access_token(&self) -> Result<String> {
        let credential = self
            .valid_credential()
            .await
            .map_err(BitbucketError::from)?;
        Ok(credential.access_token)
    }

    /// Runs the browser flow even if a valid credential is held.
    ///
    /// Joins an attempt that is already running instead of starting another.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotAuthenticated`] when no OAuth consumer is
    /// configured, or the failure of the authorization.
    pub async fn login(&self) -> Result<CredentialSet> {
        let attempt = {
            let mut state = self.lock();
            let joined = state.in_flight.clone();
            match joined {
                Some(attempt) => attempt,
                None => {
                    if self.inner.oauth.is_none() {
                        return Err(BitbucketError::from(AuthError::NotAuthenticated(
                            "Interactive login requires BITBUCKET_CLIENT_ID and \
                             BITBUCKET_CLIENT_SECRET."
                                .to_string(),
                        ))
                        .into());
                    }
                    let attempt = self.begin_attempt(AttemptKind::Interactive);
                    state.in_flight = Some(attempt.clone());
                    attempt
                }
            }
        };

        Ok(attempt.await.map_err(BitbucketError::from)?)
    }

    /// Discards the held credential so the next request re-authenticates.
    ///
    /// A running attempt is left alone and still installs its result.
    pub fn clear_auth(&self) {
        self.lock().credential = None;
        tracing::debug!("Cleared in-memory credential");
    }

    /// Discards the held credential only if it is still `rejected_token`.
    ///
    /// Requests that were sent with the same stale token can be rejected
    /// after another caller already re-authenticated; their clear must leave
    /// the fresh credential in place. Returns whether anything was cleared.
    pub fn clear_auth_if(&self, rejected_token: &str) -> bool {
        let mut state = self.lock();
        let stale = state
            .credential
            .as_ref()
            .is_some_and(|c| c.access_token == rejected_token);
        if stale {
            state.credential = None;
            tracing::debug!("Cleared rejected in-memory credential");
        } else {
            tracing::debug!("Rejected credential already replaced");
        }
        stale
    }

    /// Returns `true` while an unexpired credential is held.
    pub fn is_authenticated(&self) -> bool {
        self.lock()
            .credential
            .as_ref()
            .is_some_and(|c| !c.expires_within(Duration::zero()))
    }

    /// The held credential, if any.
    pub fn current_credential(&self) -> Option<CredentialSet> {
        self.lock().credential.clone()
    }

    /// The strategy chosen at construction.
    pub fn strategy(&self) -> Option<&AuthStrategy> {
        self.inner.strategy.as_ref()
    }

    /// Username to combine with the token in basic-auth mode.
    pub fn basic_username(&self) -> Option<&str> {
        match &self.inner.strategy {
            Some(AuthStrategy::BasicAuth { username, .. }) => Some(username),
            _ => None,
        }
    }

    /// Returns `true` when a consumer id and secret are configured, which
    /// makes refresh and browser re-authorization possible.
    pub fn has_interactive_credentials(&self) -> bool {
        self.inner.oauth.is_some()
    }

    /// Store the broker persists credentials to.
    pub fn token_store(&self) -> &TokenStore {
        &self.inner.store
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn valid_credential(&self) -> std::result::Result<CredentialSet, AuthError> {
        let attempt = {
            let mut state = self.lock();
            let joined = state.in_flight.clone();
            match joined {
                Some(attempt) => {
                    tracing::debug!("Joining in-flight authorization attempt");
                    attempt
                }
                None => match self.next_step(&mut state)? {
                    Step::Ready(credential) => return Ok(credential),
                    Step::Begin(kind) => {
                        let attempt = self.begin_attempt(kind);
                        state.in_flight = Some(attempt.clone());
                        attempt
                    }
                },
            }
        };

        attempt.await
    }

    fn next_step(&self, state: &mut BrokerState) -> std::result::Result<Step, AuthError> {
        // Static strategies re-seed from configuration after a clear.
        if state.credential.is_none() && self.inner.oauth.is_none() {
            state.credential = self.inner.strategy.as_ref().and_then(static_credential);
        }

        match (&state.credential, &self.inner.oauth) {
            (Some(credential), _) if !credential.expires_within(refresh_margin()) => {
                tracing::debug!("Using cached credential");
                Ok(Step::Ready(credential.clone()))
            }
            (Some(credential), Some(_)) => Ok(Step::Begin(match &credential.refresh_token {
                Some(refresh_token) => AttemptKind::Refresh(refresh_token.clone()),
                None => AttemptKind::Interactive,
            })),
            (Some(credential), None) => {
                tracing::warn!(
                    "Credential expires at {} and cannot be refreshed without \
                     BITBUCKET_CLIENT_ID and BITBUCKET_CLIENT_SECRET",
                    credential.expires_at.to_rfc3339()
                );
                Ok(Step::Ready(credential.clone()))
            }
            (None, Some(_)) => Ok(Step::Begin(AttemptKind::Interactive)),
            (None, None) => Err(AuthError::NotAuthenticated(self.inner.guidance.clone())),
        }
    }

    /// Builds the shared attempt. It installs its own outcome when it settles.
    fn begin_attempt(&self, kind: AttemptKind) -> SharedAttempt {
        let broker = self.clone();
        async move {
            let outcome = broker.run_attempt(kind).await;
            {
                let mut state = broker.lock();
                state.in_flight = None;
                if let Ok(credential) = &outcome {
                    state.credential = Some(credential.clone());
                }
            }
            outcome
        }
        .boxed()
        .shared()
    }

    async fn run_attempt(&self, kind: AttemptKind) -> std::result::Result<CredentialSet, AuthError> {
        let Some(oauth) = &self.inner.oauth else {
            return Err(AuthError::NotAuthenticated(self.inner.guidance.clone()));
        };

        match kind {
            AttemptKind::Refresh(refresh_token) => {
                tracing::debug!("Refreshing access token");
                match oauth.tokens.refresh(&refresh_token).await {
                    Ok(credential) => {
                        self.inner.store.save(&PersistedCredential::new(
                            credential.clone(),
                            oauth.tokens.identity().client_id.clone(),
                        ));
                        Ok(credential)
                    }
                    Err(e) => {
                        tracing::warn!("{}; falling back to browser authorization", e);
                        oauth.flow.run().await
                    }
                }
            }
            AttemptKind::Interactive => {
                tracing::info!("Starting browser authorization");
                oauth.flow.run().await
            }
        }
    }
}

/// Credential implied by a strategy that needs no network exchange.
fn static_credential(strategy: &AuthStrategy) -> Option<CredentialSet> {
    match strategy {
        AuthStrategy::BasicAuth { token, .. } => Some(CredentialSet::non_expiring(token.clone())),
        AuthStrategy::DirectToken {
            access_token,
            refresh_token,
            ..
        } => Some(CredentialSet::expiring_in(
            access_token.clone(),
            refresh_token.clone(),
            DEFAULT_TOKEN_LIFETIME_SECS,
        )),
        AuthStrategy::InteractiveOAuth { .. } => None,
    }
}

fn guidance(callback_port: u16) -> String {
    format!(
        "Configure one of the following:\n\
         \x20 1. BITBUCKET_USERNAME and BITBUCKET_ACCESS_TOKEN (app password or API token)\n\
         \x20 2. BITBUCKET_ACCESS_TOKEN, optionally with BITBUCKET_REFRESH_TOKEN\n\
         \x20 3. BITBUCKET_CLIENT_ID and BITBUCKET_CLIENT_SECRET for browser authorization\n\
         Create an OAuth consumer at https://bitbucket.org/<workspace>/workspace/settings/oauth-consumers \
         with callback URL http://localhost:{}/callback",
        callback_port
    )
}
