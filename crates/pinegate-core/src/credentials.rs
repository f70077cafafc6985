//! Session credential storage.
//!
//! The remote service authenticates with two opaque session cookies that an
//! operator captures out-of-band and rotates through the surrounding
//! system. They persist in a small JSON file
//! (`{"tv_sessionid", "tv_sessionid_sign", "cookies_updated_at"}`) and are
//! wrapped in [`secrecy::SecretString`] in memory so they never leak
//! through `Debug` output or logs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from credential file operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// The credential file could not be read or written.
    #[error("credential file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The credential file exists but is not valid JSON.
    #[error("credential file parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// No credentials have been stored yet.
    #[error("no session credentials stored at {0}")]
    Missing(PathBuf),
}

/// The two opaque session credentials plus their capture time.
#[derive(Clone)]
pub struct SessionCredentials {
    /// `sessionid` cookie value.
    pub session_id: SecretString,
    /// `sessionid_sign` cookie value.
    pub session_sign: SecretString,
    /// When the operator last rotated the credentials.
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionCredentials {
    /// Builds credentials captured now.
    #[must_use]
    pub fn new(session_id: impl Into<String>, session_sign: impl Into<String>) -> Self {
        Self {
            session_id: SecretString::new(session_id.into()),
            session_sign: SecretString::new(session_sign.into()),
            updated_at: Some(Utc::now()),
        }
    }

    /// Returns true when both cookie values are non-empty.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.session_id.expose_secret().is_empty()
            && !self.session_sign.expose_secret().is_empty()
    }
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("session_id", &"[REDACTED]")
            .field("session_sign", &"[REDACTED]")
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// On-disk representation; field names match the operator-facing file the
/// original admin panel wrote.
#[derive(Serialize, Deserialize)]
struct CredentialRecord {
    #[serde(default)]
    tv_sessionid: String,
    #[serde(default)]
    tv_sessionid_sign: String,
    #[serde(default)]
    cookies_updated_at: Option<DateTime<Utc>>,
}

/// JSON-file-backed credential store.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    /// Creates a store at `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true when a credential file with both cookie values exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.load().map(|c| c.is_complete()).unwrap_or(false)
    }

    /// Loads the stored credentials.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Missing`] when the file does not exist,
    /// [`CredentialError::Io`] / [`CredentialError::Parse`] on read or
    /// decode failure.
    pub fn load(&self) -> Result<SessionCredentials, CredentialError> {
        if !self.path.exists() {
            return Err(CredentialError::Missing(self.path.clone()));
        }
        let content = std::fs::read_to_string(&self.path)?;
        let record: CredentialRecord = serde_json::from_str(&content)?;
        Ok(SessionCredentials {
            session_id: SecretString::new(record.tv_sessionid),
            session_sign: SecretString::new(record.tv_sessionid_sign),
            updated_at: record.cookies_updated_at,
        })
    }

    /// Persists `credentials`, creating the parent directory on demand.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] on write failure.
    pub fn save(&self, credentials: &SessionCredentials) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let record = CredentialRecord {
            tv_sessionid: credentials.session_id.expose_secret().clone(),
            tv_sessionid_sign: credentials.session_sign.expose_secret().clone(),
            cookies_updated_at: credentials.updated_at,
        };
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Deletes the credential file if present.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Io`] on removal failure.
    pub fn clear(&self) -> Result<(), CredentialError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialFile::new(dir.path().join("nested/cookies.json"));

        assert!(!store.exists());
        assert!(matches!(
            store.load(),
            Err(CredentialError::Missing(_))
        ));

        let credentials = SessionCredentials::new("sid-123", "sign-456");
        store.save(&credentials).unwrap();

        assert!(store.exists());
        let loaded = store.load().unwrap();
        assert_eq!(loaded.session_id.expose_secret(), "sid-123");
        assert_eq!(loaded.session_sign.expose_secret(), "sign-456");
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn clear_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialFile::new(dir.path().join("cookies.json"));
        store
            .save(&SessionCredentials::new("sid", "sign"))
            .unwrap();

        store.clear().unwrap();
        assert!(!store.exists());
        // Clearing an absent file is not an error.
        store.clear().unwrap();
    }

    #[test]
    fn empty_credentials_are_incomplete() {
        let credentials = SessionCredentials::new("", "sign");
        assert!(!credentials.is_complete());
    }

    #[test]
    fn debug_output_redacts_cookie_values() {
        let credentials = SessionCredentials::new("very-secret", "also-secret");
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("REDACTED"));
    }
}
