//! Token endpoint client
//!
//! Redeems authorization codes and refresh tokens. Both grants are sent as
//! form-encoded `POST`s authenticated with HTTP Basic consumer credentials.

use crate::auth::credentials::{ClientIdentity, CredentialSet, DEFAULT_TOKEN_LIFETIME_SECS};
use crate::error::AuthError;

// ---------------------------------------------------------------------------
// Token response
// ---------------------------------------------------------------------------

/// Raw JSON body returned by the token endpoint.
#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    /// Converts the response into a [`CredentialSet`].
    ///
    /// `expires_in` becomes an absolute expiry; when it is missing the
    /// default lifetime is assumed. `previous_refresh` is kept when the
    /// endpoint does not rotate the refresh token.
    fn into_credential(self, previous_refresh: Option<&str>) -> CredentialSet {
        let lifetime = self
            .expires_in
            .map(|secs| i64::from(u32::try_from(secs).unwrap_or(u32::MAX)))
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string));

        CredentialSet::expiring_in(self.access_token, refresh_token, lifetime)
    }
}

// ---------------------------------------------------------------------------
// TokenClient
// ---------------------------------------------------------------------------

/// Client for the OAuth token endpoint of one consumer.
///
/// # Examples
///
/// ```no_run
/// use bitbucket_mcp::auth::{ClientIdentity, TokenClient};
///
/// # async fn example() -> Result<(), bitbucket_mcp::error::AuthError> {
/// let client = TokenClient::new(
///     reqwest::Client::new(),
///     "https://bitbucket.org/site/oauth2/access_token",
///     ClientIdentity::new("key", "secret"),
/// );
/// let creds = client.exchange_code("code-from-redirect").await?;
/// println!("expires at {}", creds.expires_at);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    token_url: String,
    identity: ClientIdentity,
}

impl TokenClient {
    /// Creates a token client.
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        identity: ClientIdentity,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            identity,
        }
    }

    /// Consumer this client authenticates as.
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Redeems an authorization code.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Exchange`] carrying the endpoint's response body
    /// on a non-success status, or the transport/parse failure otherwise.
    pub async fn exchange_code(&self, code: &str) -> Result<CredentialSet, AuthError> {
        let params = [("grant_type", "authorization_code"), ("code", code)];
        let response = self.post(&params).await.map_err(AuthError::Exchange)?;
        tracing::info!("Authorization code exchanged for tokens");
        Ok(response.into_credential(None))
    }

    /// Redeems a refresh token.
    ///
    /// The returned credential keeps `refresh_token` when the endpoint does
    /// not issue a new one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Refresh`] carrying the endpoint's response body
    /// on a non-success status, or the transport/parse failure otherwise.
    pub async fn refresh(&self, refresh_token: &str) -> Result<CredentialSet, AuthError> {
        let params = [("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        let response = self.post(&params).await.map_err(AuthError::Refresh)?;
        tracing::info!("Tokens refreshed successfully");
        Ok(response.into_credential(Some(refresh_token)))
    }

    async fn post(&self, params: &[(&str, &str)]) -> Result<TokenResponse, String> {
        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.identity.client_id, Some(&self.identity.client_secret))
            .form(params)
            .send()
            .await
            .map_err(|e| format!("token endpoint request failed: {e}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!("Token endpoint returned {}", status);
            return Err(if body.is_empty() {
                status.to_string()
            } else {
                body
            });
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| format!("failed to parse token response: {e}"))
    }
}
