//! Configuration management for bitbucket-mcp
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//!
//! Credentials normally arrive through the environment. Their presence is
//! deliberately not validated here: the credential broker fails closed at
//! the first token request instead.

use crate::error::{BitbucketError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for bitbucket-mcp
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Credential material used to select the authentication strategy
    #[serde(default)]
    pub auth: AuthConfig,

    /// OAuth endpoints and interactive flow settings
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Bitbucket REST API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Location of the persisted credential file
    ///
    /// Defaults to `~/.config/bitbucket-mcp/tokens.json` when unset.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

/// Raw credential inputs
///
/// Which of these are present decides the authentication strategy; see
/// [`AuthStrategy::from_config`](crate::auth::AuthStrategy::from_config).
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// OAuth consumer key
    #[serde(default)]
    pub client_id: Option<String>,

    /// OAuth consumer secret
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Directly supplied access token (or app password in basic-auth mode)
    #[serde(default)]
    pub access_token: Option<String>,

    /// Refresh token accompanying `access_token`
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Bitbucket username; together with `access_token` selects basic auth
    #[serde(default)]
    pub username: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(value: &Option<String>) -> Option<&'static str> {
            value.as_ref().map(|_| "<redacted>")
        }

        f.debug_struct("AuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("username", &self.username)
            .finish()
    }
}

/// OAuth 2.0 endpoint and browser flow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Authorization endpoint the user is sent to
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,

    /// Token endpoint used for code exchange and refresh
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Local port of the redirect listener
    ///
    /// Must match the callback URL registered on the OAuth consumer.
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,

    /// Scopes requested in the authorization URL (empty: consumer defaults)
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Authorization watchdog (seconds)
    #[serde(default = "default_flow_timeout")]
    pub timeout_seconds: u64,
}

fn default_authorize_url() -> String {
    "https://bitbucket.org/site/oauth2/authorize".to_string()
}

fn default_token_url() -> String {
    "https://bitbucket.org/site/oauth2/access_token".to_string()
}

fn default_callback_port() -> u16 {
    9876
}

fn default_flow_timeout() -> u64 {
    300
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            callback_port: default_callback_port(),
            scopes: Vec::new(),
            timeout_seconds: default_flow_timeout(),
        }
    }
}

/// Bitbucket REST API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL prepended to relative endpoints
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Per-request HTTP timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,
}

fn default_api_base_url() -> String {
    "https://api.bitbucket.org/2.0".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_seconds: default_request_timeout(),
        }
    }
}

/// Reads an environment variable, treating empty values as absent
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BitbucketError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| BitbucketError::Config(format!("Failed to parse config: {}", e)).into())
    }

    /// Applies `BITBUCKET_*` environment variables on top of the file values
    pub fn apply_env_vars(&mut self) {
        if let Some(client_id) = env_value("BITBUCKET_CLIENT_ID") {
            self.auth.client_id = Some(client_id);
        }

        if let Some(client_secret) = env_value("BITBUCKET_CLIENT_SECRET") {
            self.auth.client_secret = Some(client_secret);
        }

        // BITBUCKET_TOKEN is the older name and only used as a fallback.
        if let Some(token) =
            env_value("BITBUCKET_ACCESS_TOKEN").or_else(|| env_value("BITBUCKET_TOKEN"))
        {
            self.auth.access_token = Some(token);
        }

        if let Some(refresh_token) = env_value("BITBUCKET_REFRESH_TOKEN") {
            self.auth.refresh_token = Some(refresh_token);
        }

        if let Some(username) = env_value("BITBUCKET_USERNAME") {
            self.auth.username = Some(username);
        }

        if let Some(base_url) = env_value("BITBUCKET_API_URL") {
            self.api.base_url = base_url;
        }

        if let Some(port) = env_value("BITBUCKET_CALLBACK_PORT") {
            if let Ok(value) = port.parse() {
                self.oauth.callback_port = value;
            } else {
                tracing::warn!("Invalid BITBUCKET_CALLBACK_PORT: {}", port);
            }
        }

        if let Some(token_file) = env_value("BITBUCKET_TOKEN_FILE") {
            self.token_file = Some(PathBuf::from(token_file));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }

        if let Some(token_file) = &cli.token_file {
            self.token_file = Some(token_file.clone());
        }
    }

    /// Validate the configuration
    ///
    /// Ensures URLs parse and numeric settings are within acceptable ranges.
    /// Credential presence is not checked.
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("oauth.authorize_url", &self.oauth.authorize_url),
            ("oauth.token_url", &self.oauth.token_url),
            ("api.base_url", &self.api.base_url),
        ] {
            url::Url::parse(value).map_err(|e| {
                BitbucketError::Config(format!("{} is not a valid URL ({}): {}", name, value, e))
            })?;
        }

        if self.oauth.timeout_seconds == 0 {
            return Err(BitbucketError::Config(
                "oauth.timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.api.timeout_seconds == 0 {
            return Err(BitbucketError::Config(
                "api.timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
