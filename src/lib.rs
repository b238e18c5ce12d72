//! bitbucket-mcp - Bitbucket Cloud credential broker library
//!
//! This library provides the credential lifecycle and authenticated-request
//! layer that a Bitbucket tool server builds its resource wrappers on.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `auth`: Credential strategies, persistence, browser authorization, and
//!   the single-flight credential broker
//! - `api`: Authenticated REST transport with one-shot 401 recovery
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//! - `commands`: Handlers for the CLI commands
//!
//! # Example
//!
//! ```no_run
//! use bitbucket_mcp::{BitbucketClient, Config, CredentialBroker};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::default();
//!     config.apply_env_vars();
//!     config.validate()?;
//!
//!     let broker = CredentialBroker::new(&config, reqwest::Client::new())?;
//!     let client = BitbucketClient::new(&config.api, broker)?;
//!     let repos = client.get("/repositories/acme", &[("pagelen", "10")]).await?;
//!     println!("{}", repos["size"]);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use api::{BitbucketClient, RequestOptions};
pub use auth::{AuthStrategy, CredentialBroker, CredentialSet, TokenStore};
pub use config::Config;
pub use error::{AuthError, BitbucketError, Result};

#[cfg(test)]
pub mod test_utils;
