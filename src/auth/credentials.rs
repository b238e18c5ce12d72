//! Credential data model
//!
//! [`CredentialSet`] is what the broker holds in memory, [`PersistedCredential`]
//! is what the token store writes to disk, and [`AuthStrategy`] is the tagged
//! variant chosen once from the configured inputs.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

/// Lifetime assumed for a directly supplied token whose real expiry is unknown.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Horizon used as the synthetic expiry of tokens that never expire.
const NEVER_EXPIRES_DAYS: i64 = 36_500;

// ---------------------------------------------------------------------------
// CredentialSet
// ---------------------------------------------------------------------------

/// An access token with its refresh token and a concrete expiry instant.
///
/// `expires_at` is always set, even for strategies without a real expiry
/// (see [`CredentialSet::non_expiring`]). It is kept at millisecond
/// precision so that it survives the on-disk representation unchanged.
///
/// # Examples
///
/// ```
/// use bitbucket_mcp::auth::CredentialSet;
/// use chrono::Duration;
///
/// let creds = CredentialSet::expiring_in("access", Some("refresh".to_string()), 3600);
/// assert!(!creds.expires_within(Duration::minutes(5)));
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    /// Bearer string placed in the `Authorization` header
    pub access_token: String,

    /// Refresh token, if the issuer returned one
    #[serde(default, deserialize_with = "empty_as_none")]
    pub refresh_token: Option<String>,

    /// Instant at which the access token stops being valid
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl CredentialSet {
    /// Builds a credential expiring at `expires_at` (truncated to milliseconds).
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expires_at: expires_at.trunc_subsecs(3),
        }
    }

    /// Builds a credential expiring `seconds` from now.
    pub fn expiring_in(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        seconds: i64,
    ) -> Self {
        Self::new(
            access_token,
            refresh_token,
            Utc::now() + Duration::seconds(seconds),
        )
    }

    /// Builds a credential for a long-lived secret, with a far-future expiry.
    pub fn non_expiring(access_token: impl Into<String>) -> Self {
        Self::new(
            access_token,
            None,
            Utc::now() + Duration::days(NEVER_EXPIRES_DAYS),
        )
    }

    /// Returns `true` when less than `margin` remains before expiry.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at - Utc::now() < margin
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_empty()))
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PersistedCredential
// ---------------------------------------------------------------------------

/// The single record stored in the token file.
///
/// Serialized as `{ accessToken, refreshToken, expiresAt, clientId }` with
/// `expiresAt` in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCredential {
    /// The stored credential
    #[serde(flatten)]
    pub credential: CredentialSet,

    /// OAuth consumer the credential was issued to
    pub client_id: String,
}

impl PersistedCredential {
    /// Pairs a credential with the consumer it was issued to.
    pub fn new(credential: CredentialSet, client_id: impl Into<String>) -> Self {
        Self {
            credential,
            client_id: client_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ClientIdentity
// ---------------------------------------------------------------------------

/// OAuth consumer key and secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// OAuth consumer key
    pub client_id: String,
    /// OAuth consumer secret
    pub client_secret: String,
}

impl ClientIdentity {
    /// Creates a new identity.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AuthStrategy
// ---------------------------------------------------------------------------

/// How requests are authenticated for the lifetime of the process.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    /// A pre-issued bearer token, optionally refreshable through `identity`.
    DirectToken {
        /// Supplied access token
        access_token: String,
        /// Supplied refresh token
        refresh_token: Option<String>,
        /// Consumer credentials enabling refresh and interactive recovery
        identity: Option<ClientIdentity>,
    },

    /// Username plus app password sent as HTTP Basic credentials.
    BasicAuth {
        /// Bitbucket username
        username: String,
        /// App password or API token
        token: String,
    },

    /// Browser-based authorization with the consumer credentials.
    InteractiveOAuth {
        /// Consumer credentials
        identity: ClientIdentity,
    },
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectToken {
                refresh_token,
                identity,
                ..
            } => f
                .debug_struct("DirectToken")
                .field("access_token", &"<redacted>")
                .field("refresh_token", &refresh_token.as_ref().map(|_| "<redacted>"))
                .field("identity", identity)
                .finish(),
            Self::BasicAuth { username, .. } => f
                .debug_struct("BasicAuth")
                .field("username", username)
                .field("token", &"<redacted>")
                .finish(),
            Self::InteractiveOAuth { identity } => f
                .debug_struct("InteractiveOAuth")
                .field("identity", identity)
                .finish(),
        }
    }
}

impl AuthStrategy {
    /// Selects the strategy from the shape of the configured inputs.
    ///
    /// Username + token wins over token alone, which wins over consumer
    /// credentials alone. Returns `None` when no shape is satisfied.
    ///
    /// # Examples
    ///
    /// ```
    /// use bitbucket_mcp::auth::AuthStrategy;
    /// use bitbucket_mcp::config::AuthConfig;
    ///
    /// let auth = AuthConfig {
    ///     access_token: Some("tok123".to_string()),
    ///     ..Default::default()
    /// };
    /// assert!(matches!(
    ///     AuthStrategy::from_config(&auth),
    ///     Some(AuthStrategy::DirectToken { .. })
    /// ));
    /// assert!(AuthStrategy::from_config(&AuthConfig::default()).is_none());
    /// ```
    pub fn from_config(auth: &AuthConfig) -> Option<Self> {
        fn present(value: &Option<String>) -> Option<String> {
            value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
        }

        let identity = match (present(&auth.client_id), present(&auth.client_secret)) {
            (Some(id), Some(secret)) => Some(ClientIdentity::new(id, secret)),
            _ => None,
        };
        let access_token = present(&auth.access_token);

        match (present(&auth.username), access_token) {
            (Some(username), Some(token)) => Some(Self::BasicAuth { username, token }),
            (None, Some(access_token)) => Some(Self::DirectToken {
                access_token,
                refresh_token: present(&auth.refresh_token),
                identity,
            }),
            (_, None) => identity.map(|identity| Self::InteractiveOAuth { identity }),
        }
    }

    /// Consumer credentials, when interactive authorization is possible.
    pub fn identity(&self) -> Option<&ClientIdentity> {
        match self {
            Self::DirectToken { identity, .. } => identity.as_ref(),
            Self::BasicAuth { .. } => None,
            Self::InteractiveOAuth { identity } => Some(identity),
        }
    }

    /// Short label used in status output and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DirectToken { .. } => "direct token",
            Self::BasicAuth { .. } => "basic auth",
            Self::InteractiveOAuth { .. } => "interactive oauth",
        }
    }
}
