//! Credential broker integration tests
//!
//! Covers strategy selection, the refresh margin, refresh fallback, restart
//! persistence, and the single-flight guarantee for concurrent callers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tempfile::TempDir;
use wiremock::matchers::{any, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bitbucket_mcp::auth::{
    BrowserLauncher, CredentialBroker, CredentialSet, PersistedCredential, TokenStore,
};
use bitbucket_mcp::config::Config;
use bitbucket_mcp::error::{AuthError, BitbucketError};

use common::{free_port, oauth_config, plain_config, token_body, CallbackBrowser, CLIENT_ID, TOKEN_PATH};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn broker(config: &Config, launcher: Arc<dyn BrowserLauncher>) -> CredentialBroker {
    CredentialBroker::with_launcher(config, reqwest::Client::new(), launcher)
        .expect("broker construction")
}

fn store_credential(config: &Config, client_id: &str, credential: CredentialSet) {
    TokenStore::from_config(config).save(&PersistedCredential::new(credential, client_id));
}

fn auth_error(err: &anyhow::Error) -> Option<&AuthError> {
    match err.downcast_ref::<BitbucketError>() {
        Some(BitbucketError::Auth(auth)) => Some(auth),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_direct_token_makes_no_network_calls() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut config = plain_config(&server, &dir);
    config.auth.access_token = Some("tok123".to_string());

    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::idle(config.oauth.callback_port);
    let broker = broker(&config, browser.clone());

    assert_eq!(broker.get_access_token().await.unwrap(), "tok123");
    assert_eq!(broker.get_access_token().await.unwrap(), "tok123");
    assert_eq!(browser.launches(), 0);

    server.verify().await;
}

#[tokio::test]
async fn test_missing_configuration_fails_closed() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = plain_config(&server, &dir);

    let browser = CallbackBrowser::idle(config.oauth.callback_port);
    let broker = broker(&config, browser.clone());

    let err = broker.get_access_token().await.unwrap_err();
    assert!(matches!(
        auth_error(&err),
        Some(AuthError::NotAuthenticated(_))
    ));
    assert!(err.to_string().starts_with("Not authenticated."));
    assert_eq!(browser.launches(), 0);
}

// ---------------------------------------------------------------------------
// Refresh margin
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_valid_credential_is_served_from_cache() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);
    store_credential(
        &config,
        CLIENT_ID,
        CredentialSet::expiring_in("cached", Some("r".to_string()), 3600),
    );

    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::idle(port);
    let broker = broker(&config, browser.clone());
    for _ in 0..5 {
        assert_eq!(broker.get_access_token().await.unwrap(), "cached");
    }
    assert_eq!(browser.launches(), 0);

    server.verify().await;
}

#[tokio::test]
async fn test_expiring_credential_is_refreshed_once() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);
    store_credential(
        &config,
        CLIENT_ID,
        CredentialSet::expiring_in("old-access", Some("refresh-1".to_string()), 240),
    );

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("new-access", "refresh-2")))
        .expect(1)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::idle(port);
    let broker = broker(&config, browser.clone());

    assert_eq!(broker.get_access_token().await.unwrap(), "new-access");
    assert_eq!(broker.get_access_token().await.unwrap(), "new-access");
    assert_eq!(browser.launches(), 0);

    let stored = TokenStore::from_config(&config).load_for(CLIENT_ID).unwrap();
    assert_eq!(stored.access_token, "new-access");
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-2"));

    server.verify().await;
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_browser() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);
    store_credential(
        &config,
        CLIENT_ID,
        CredentialSet::expiring_in("old-access", Some("revoked".to_string()), 60),
    );

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("browser-access", "r2")))
        .expect(1)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::approving(port, "fresh-code");
    let broker = broker(&config, browser.clone());

    assert_eq!(broker.get_access_token().await.unwrap(), "browser-access");
    assert_eq!(browser.launches(), 1);

    server.verify().await;
}

#[tokio::test]
async fn test_failed_refresh_without_consumer_is_not_attempted() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut config = plain_config(&server, &dir);
    config.auth.access_token = Some("direct".to_string());
    config.auth.refresh_token = Some("direct-refresh".to_string());

    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let broker = broker(&config, CallbackBrowser::idle(config.oauth.callback_port));
    assert_eq!(broker.get_access_token().await.unwrap(), "direct");

    server.verify().await;
}

// ---------------------------------------------------------------------------
// Persistence across restarts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_authorized_credential_survives_restart() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("persisted", "r")))
        .expect(1)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::approving(port, "code-1");
    let first = broker(&config, browser.clone());
    assert_eq!(first.get_access_token().await.unwrap(), "persisted");
    drop(first);

    let second = broker(&config, browser.clone());
    assert!(second.is_authenticated());
    assert_eq!(second.get_access_token().await.unwrap(), "persisted");
    assert_eq!(browser.launches(), 1);

    server.verify().await;
}

#[tokio::test]
async fn test_credential_from_other_consumer_is_not_adopted() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);
    store_credential(
        &config,
        "some-other-app",
        CredentialSet::expiring_in("foreign", None, 3600),
    );

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("own", "r")))
        .expect(1)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::approving(port, "code");
    let broker = broker(&config, browser.clone());
    assert_eq!(broker.get_access_token().await.unwrap(), "own");
    assert_eq!(browser.launches(), 1);

    let stored = TokenStore::from_config(&config).load().unwrap();
    assert_eq!(stored.client_id, CLIENT_ID);

    server.verify().await;
}

// ---------------------------------------------------------------------------
// Single flight
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_callers_share_one_authorization() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("shared-access", "r"))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::approving(port, "single-use-code");
    let broker = broker(&config, browser.clone());

    let results = join_all((0..8).map(|_| broker.get_access_token())).await;
    for result in results {
        assert_eq!(result.unwrap(), "shared-access");
    }
    assert_eq!(browser.launches(), 1);

    server.verify().await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);
    store_credential(
        &config,
        CLIENT_ID,
        CredentialSet::expiring_in("old", Some("refresh-1".to_string()), 30),
    );

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("refreshed", "refresh-2"))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let broker = broker(&config, CallbackBrowser::idle(port));
    let results = join_all((0..5).map(|_| broker.get_access_token())).await;
    assert!(results.iter().all(|r| r.as_deref().ok() == Some("refreshed")));

    server.verify().await;
}

#[tokio::test]
async fn test_concurrent_callers_share_one_failure_then_retry_fresh() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);

    let browser = CallbackBrowser::denying(port, "access_denied", "denied");
    let broker = broker(&config, browser.clone());

    let results = join_all((0..4).map(|_| broker.get_access_token())).await;
    for result in &results {
        let err = result.as_ref().unwrap_err();
        assert!(matches!(auth_error(err), Some(AuthError::Denied { .. })));
        assert!(err.to_string().contains("access_denied"));
    }
    assert_eq!(browser.launches(), 1);

    // The settled attempt is gone; the next caller starts a new one.
    assert!(broker.get_access_token().await.is_err());
    assert_eq!(browser.launches(), 2);
}

// ---------------------------------------------------------------------------
// Explicit login and clearing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_login_replaces_valid_credential() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);
    store_credential(
        &config,
        CLIENT_ID,
        CredentialSet::expiring_in("still-valid", None, 3600),
    );

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("after-login", "r")))
        .expect(1)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::approving(port, "login-code");
    let broker = broker(&config, browser.clone());

    let credential = broker.login().await.unwrap();
    assert_eq!(credential.access_token, "after-login");
    assert_eq!(broker.get_access_token().await.unwrap(), "after-login");
    assert_eq!(browser.launches(), 1);

    server.verify().await;
}

#[tokio::test]
async fn test_clear_auth_forces_reauthorization() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let config = oauth_config(&server, &dir, port);
    store_credential(
        &config,
        CLIENT_ID,
        CredentialSet::expiring_in("before-clear", None, 3600),
    );

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("after-clear", "r")))
        .expect(1)
        .mount(&server)
        .await;

    let browser = CallbackBrowser::approving(port, "code");
    let broker = broker(&config, browser.clone());

    assert_eq!(broker.get_access_token().await.unwrap(), "before-clear");
    broker.clear_auth();
    broker.clear_auth();
    assert!(!broker.is_authenticated());
    assert_eq!(broker.get_access_token().await.unwrap(), "after-clear");
    assert_eq!(browser.launches(), 1);

    server.verify().await;
}
