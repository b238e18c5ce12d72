/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `login`: Run the browser authorization and persist the credential
- `status`: Describe the configured strategy and the stored credential
- `logout`: Remove the stored credential
- `get`: Perform one authenticated GET against the REST API

Standard output carries only command results; diagnostics go to stderr.
*/

use std::time::Duration;

use crate::api::BitbucketClient;
use crate::auth::{CredentialBroker, TokenStore};
use crate::config::Config;
use crate::error::{BitbucketError, Result};

/// Builds the broker with an HTTP client honoring the API timeout.
fn build_broker(config: &Config) -> Result<CredentialBroker> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.timeout_seconds))
        .build()
        .map_err(BitbucketError::from)?;
    CredentialBroker::new(config, http)
}

// Login command handler
pub mod login {
    use super::*;

    /// Force a browser authorization
    ///
    /// # Arguments
    ///
    /// * `config` - Global configuration
    /// * `show_tokens` - Print the issued tokens to stdout
    ///
    /// # Errors
    ///
    /// Returns an error if no OAuth consumer is configured or the
    /// authorization fails.
    pub async fn run_login(config: &Config, show_tokens: bool) -> Result<()> {
        let broker = build_broker(config)?;
        let credential = broker.login().await?;

        println!(
            "Authorization successful. Credential stored at {}",
            broker.token_store().path().display()
        );
        println!("Access token expires at {}", credential.expires_at.to_rfc3339());

        if show_tokens {
            println!("access_token: {}", credential.access_token);
            if let Some(refresh_token) = &credential.refresh_token {
                println!("refresh_token: {}", refresh_token);
            }
        }

        Ok(())
    }
}

// Status command handler
pub mod status {
    use super::*;

    /// Describe the active strategy and the stored credential
    ///
    /// Makes no network calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be constructed.
    pub fn show_status(config: &Config) -> Result<()> {
        let broker = build_broker(config)?;

        let strategy = broker
            .strategy()
            .map(|s| s.label())
            .unwrap_or("not configured");
        println!("Strategy:          {}", strategy);

        if let Some(username) = broker.basic_username() {
            println!("Username:          {}", username);
        }

        let store = broker.token_store();
        println!("Token file:        {}", store.path().display());
        match store.load() {
            Some(record) => println!(
                "Stored credential: client {} (expires {})",
                record.client_id,
                record.credential.expires_at.to_rfc3339()
            ),
            None => println!("Stored credential: none"),
        }

        println!(
            "Authenticated:     {}",
            if broker.is_authenticated() { "yes" } else { "no" }
        );

        Ok(())
    }
}

// Logout command handler
pub mod logout {
    use super::*;

    /// Remove the stored credential
    ///
    /// Never fails; a missing file is reported as such.
    pub fn run_logout(config: &Config) -> Result<()> {
        let store = TokenStore::from_config(config);
        if store.clear() {
            println!("Removed stored credential at {}", store.path().display());
        } else {
            println!("No stored credential at {}", store.path().display());
        }
        Ok(())
    }
}

// Get command handler
pub mod get {
    use super::*;

    /// Perform an authenticated GET and print the response
    ///
    /// # Arguments
    ///
    /// * `config` - Global configuration
    /// * `endpoint` - API path or absolute URL
    /// * `raw` - Print the body as text instead of pretty JSON
    /// * `query` - Query parameters
    ///
    /// # Errors
    ///
    /// Returns an error if authentication or the request fails.
    pub async fn run_get(
        config: &Config,
        endpoint: &str,
        raw: bool,
        query: &[(String, String)],
    ) -> Result<()> {
        let broker = build_broker(config)?;
        let client = BitbucketClient::new(&config.api, broker)?;
        let query: Vec<(&str, &str)> = query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        if raw {
            let body = client.get_raw(endpoint, &query).await?;
            print!("{}", body);
        } else {
            let value = client.get(endpoint, &query).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&value).map_err(BitbucketError::from)?
            );
        }

        Ok(())
    }
}
