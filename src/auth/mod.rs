//! Bitbucket credential lifecycle
//!
//! This module obtains, refreshes, and persists the credential used for
//! every Bitbucket API call:
//!
//! - [`credentials`]: credential data types and strategy selection
//! - [`token_store`]: single-slot persistence on disk
//! - [`exchange`]: code exchange and refresh against the token endpoint
//! - [`flow`]: browser consent through a one-shot local redirect listener
//! - [`broker`]: in-memory state and single-flight refresh/authorization

pub mod broker;
pub mod credentials;
pub mod exchange;
pub mod flow;
pub mod token_store;

pub use broker::{CredentialBroker, REFRESH_MARGIN_SECS};
pub use credentials::{
    AuthStrategy, ClientIdentity, CredentialSet, PersistedCredential, DEFAULT_TOKEN_LIFETIME_SECS,
};
pub use exchange::TokenClient;
pub use flow::{AuthorizationFlow, BrowserLauncher, PendingAuthorization, SystemBrowser};
pub use token_store::TokenStore;
