//! Error types for bitbucket-mcp
//!
//! This module defines all error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.
//!
//! Authentication failures live in [`AuthError`], which is `Clone` so that
//! every caller attached to a shared authorization attempt observes the same
//! failure. Everything the broker and transport return is wrapped in
//! [`BitbucketError`] before it is turned into an `anyhow::Error`.

use thiserror::Error;

/// Failures of the credential lifecycle
///
/// Covers missing configuration, provider-side denial, watchdog timeouts,
/// callback listener problems, and token endpoint errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable credential strategy was configured
    ///
    /// Carries guidance text describing the supported configuration shapes.
    #[error("Not authenticated. {0}")]
    NotAuthenticated(String),

    /// The provider redirected back with an `error` parameter
    #[error("OAuth error: {error} - {description}")]
    Denied {
        /// The `error` query parameter (e.g. `access_denied`)
        error: String,
        /// The `error_description` query parameter, empty when absent
        description: String,
    },

    /// The authorization watchdog fired before a redirect arrived
    #[error("OAuth flow timed out after {0} seconds")]
    Timeout(u64),

    /// The local redirect listener could not be started or stopped early
    #[error("OAuth callback server error: {0}")]
    Listener(String),

    /// The authorization code could not be redeemed
    #[error("Failed to exchange code for token: {0}")]
    Exchange(String),

    /// The refresh token could not be redeemed
    #[error("Failed to refresh token: {0}")]
    Refresh(String),
}

/// Main error type for bitbucket-mcp operations
#[derive(Error, Debug)]
pub enum BitbucketError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential lifecycle errors
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A Bitbucket API call failed after the retry budget was spent
    #[error("Bitbucket API error ({status}): {message}")]
    Api {
        /// Numeric HTTP status returned by Bitbucket
        status: u16,
        /// Message extracted from the error body
        message: String,
    },

    /// Token file read/write problems. Logged, never propagated by the store.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for bitbucket-mcp operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
