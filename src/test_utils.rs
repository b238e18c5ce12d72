//! Test utilities for bitbucket-mcp
//!
//! This module provides common test utilities including temporary token
//! files, configuration builders, and assertion helpers.

use crate::auth::{CredentialSet, PersistedCredential, TokenStore};
use crate::config::Config;
use crate::error::BitbucketError;
use tempfile::TempDir;

/// Create a temporary directory for testing
///
/// # Returns
///
/// Returns a TempDir that will be cleaned up when dropped
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Create a configuration whose token file lives in `dir`
///
/// # Examples
///
/// ```ignore
/// let dir = temp_dir();
/// let config = test_config(&dir);
/// assert!(config.token_file.unwrap().starts_with(dir.path()));
/// ```
pub fn test_config(dir: &TempDir) -> Config {
    Config {
        token_file: Some(dir.path().join("tokens.json")),
        ..Config::default()
    }
}

/// Like [`test_config`], with OAuth consumer credentials set
pub fn oauth_config(dir: &TempDir, client_id: &str) -> Config {
    let mut config = test_config(dir);
    config.auth.client_id = Some(client_id.to_string());
    config.auth.client_secret = Some("test-secret".to_string());
    config
}

/// Persist a credential for `client_id` in the config's token file
pub fn store_credential(config: &Config, client_id: &str, credential: CredentialSet) {
    TokenStore::from_config(config).save(&PersistedCredential::new(credential, client_id));
}

/// Assert that an error contains the expected message
///
/// # Panics
///
/// Panics if the result is Ok or if the error doesn't contain the expected message
pub fn assert_error_contains<T>(result: Result<T, BitbucketError>, expected: &str) {
    match result {
        Ok(_) => panic!("Expected error containing '{}' but got Ok", expected),
        Err(e) => {
            let error_msg = e.to_string();
            assert!(
                error_msg.contains(expected),
                "Error message '{}' does not contain '{}'",
                error_msg,
                expected
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialBroker;

    #[test]
    fn test_temp_dir_creation() {
        let dir = temp_dir();
        assert!(dir.path().exists());
    }

    #[test]
    fn test_store_credential_is_adopted_by_broker() {
        let dir = temp_dir();
        let config = oauth_config(&dir, "consumer");
        let credential = CredentialSet::expiring_in("stored", None, 3600);
        store_credential(&config, "consumer", credential.clone());

        let broker = CredentialBroker::new(&config, reqwest::Client::new()).unwrap();
        assert_eq!(broker.current_credential(), Some(credential));
    }

    #[test]
    fn test_assert_error_contains_success() {
        let result: Result<(), BitbucketError> =
            Err(BitbucketError::Config("test error message".to_string()));
        assert_error_contains(result, "test error");
    }

    #[test]
    #[should_panic(expected = "Expected error containing")]
    fn test_assert_error_contains_ok() {
        let result: Result<(), BitbucketError> = Ok(());
        assert_error_contains(result, "error");
    }

    #[test]
    #[should_panic(expected = "does not contain")]
    fn test_assert_error_contains_wrong_message() {
        let result: Result<(), BitbucketError> =
            Err(BitbucketError::Config("different error".to_string()));
        assert_error_contains(result, "not present");
    }

    #[test]
    fn test_test_config_is_valid() {
        let dir = temp_dir();
        assert!(test_config(&dir).validate().is_ok());
    }
}
