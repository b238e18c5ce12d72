//! Credential persistence in a single-slot JSON file
//!
//! The store survives process restarts so that an interactive authorization
//! does not have to be repeated on every launch. Every operation fails soft:
//! read and write problems are logged and reported as "absent" or ignored,
//! since the broker can always re-authenticate.
//!
//! The default location is `~/.config/bitbucket-mcp/tokens.json`. The file
//! is replaced as a whole on every save and is readable by the owner only.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::auth::credentials::{CredentialSet, PersistedCredential};
use crate::config::Config;
use crate::error::{BitbucketError, Result};

const CONFIG_DIR_NAME: &str = "bitbucket-mcp";
const TOKEN_FILE_NAME: &str = "tokens.json";

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

/// File-based store for the one [`PersistedCredential`] of this process.
///
/// # Examples
///
/// ```
/// use bitbucket_mcp::auth::{CredentialSet, PersistedCredential, TokenStore};
///
/// let dir = tempfile::tempdir().unwrap();
/// let store = TokenStore::with_path(dir.path().join("tokens.json"));
///
/// let creds = CredentialSet::expiring_in("access", Some("refresh".to_string()), 3600);
/// store.save(&PersistedCredential::new(creds.clone(), "consumer"));
///
/// assert_eq!(store.load_for("consumer"), Some(creds));
/// assert_eq!(store.load_for("someone-else"), None);
/// ```
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Creates a store at the default per-user location.
    pub fn new() -> Self {
        Self {
            path: Self::default_path(),
        }
    }

    /// Creates a store at the configured `token_file`, or the default location.
    pub fn from_config(config: &Config) -> Self {
        config
            .token_file
            .clone()
            .map(Self::with_path)
            .unwrap_or_default()
    }

    /// Creates a store at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns `~/.config/bitbucket-mcp/tokens.json`.
    ///
    /// Falls back to a path relative to the working directory when no home
    /// directory can be determined.
    pub fn default_path() -> PathBuf {
        let base = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".config"))
            .unwrap_or_else(|| PathBuf::from(".config"));
        base.join(CONFIG_DIR_NAME).join(TOKEN_FILE_NAME)
    }

    /// Location of the credential file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored record.
    ///
    /// Returns `None` when the file is missing or unreadable. Only the
    /// missing case is silent; anything else is logged as a warning.
    pub fn load(&self) -> Option<PersistedCredential> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read token file {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<PersistedCredential>(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Ignoring malformed token file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Reads the stored credential if it was issued to `client_id`.
    ///
    /// A record issued to another OAuth consumer is never returned.
    pub fn load_for(&self, client_id: &str) -> Option<CredentialSet> {
        let record = self.load()?;
        if record.client_id != client_id {
            tracing::debug!(
                "Stored credential belongs to a different client id, ignoring it"
            );
            return None;
        }
        Some(record.credential)
    }

    /// Replaces the stored record.
    ///
    /// Failures are logged and otherwise ignored.
    pub fn save(&self, record: &PersistedCredential) {
        match self.try_save(record) {
            Ok(()) => tracing::debug!("Saved credential to {}", self.path.display()),
            Err(e) => tracing::warn!("Failed to save credential: {}", e),
        }
    }

    /// Deletes the stored record, returning whether one existed.
    pub fn clear(&self) -> bool {
        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!("Failed to remove token file {}: {}", self.path.display(), e);
                false
            }
        }
    }

    fn try_save(&self, record: &PersistedCredential) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                BitbucketError::Persistence(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let data = serde_json::to_vec_pretty(record)?;

        // Write a sibling file first so a crash never leaves a truncated record.
        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = open_private(&tmp_path).map_err(|e| {
            BitbucketError::Persistence(format!("cannot create {}: {}", tmp_path.display(), e))
        })?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            BitbucketError::Persistence(format!(
                "cannot replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation; tighten a leftover temp file too.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
