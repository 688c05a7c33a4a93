//! Per-session credential persistence.
//!
//! Each session owns one scope (a directory under the configured root). The
//! backend hands over credential material whenever it rotates; the session
//! manager forwards it here before processing the next event.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::backend::CredentialState;

const CREDS_FILE: &str = "creds.json";

/// Storage for opaque per-session credential state.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Create the session's scope if it does not exist.
    async fn ensure_scope(&self, session: &str) -> Result<(), CredentialError>;

    /// Load stored credentials. `None` means the session has never logged in.
    async fn load(&self, session: &str) -> Result<Option<CredentialState>, CredentialError>;

    /// Replace stored credentials.
    async fn save(&self, session: &str, state: &CredentialState) -> Result<(), CredentialError>;
}

// ============================================================================
// FileCredentialStore
// ============================================================================

/// Stores credentials as `<root>/<session>/creds.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    root: PathBuf,
}

impl FileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scope_dir(&self, session: &str) -> PathBuf {
        self.root.join(session)
    }

    fn creds_path(&self, session: &str) -> PathBuf {
        self.scope_dir(session).join(CREDS_FILE)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn ensure_scope(&self, session: &str) -> Result<(), CredentialError> {
        let dir = self.scope_dir(session);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CredentialError::file_io(&dir, e))
    }

    async fn load(&self, session: &str) -> Result<Option<CredentialState>, CredentialError> {
        let path = self.creds_path(session);
        let contents = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CredentialError::file_io(&path, e)),
        };
        let state = serde_json::from_slice(&contents).map_err(|e| CredentialError::Corrupt {
            path: path.clone(),
            source: e,
        })?;
        Ok(Some(state))
    }

    async fn save(&self, session: &str, state: &CredentialState) -> Result<(), CredentialError> {
        let data = serde_json::to_vec_pretty(state).map_err(|e| CredentialError::Corrupt {
            path: self.creds_path(session),
            source: e,
        })?;
        atomic_write_file(&self.creds_path(session), &data).await
    }
}

/// Write data to a temp file, fsync it, then atomically rename to the final path.
///
/// The temp file name carries a ULID so concurrent writers never collide.
async fn atomic_write_file(final_path: &Path, data: &[u8]) -> Result<(), CredentialError> {
    let file_name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let temp_path = final_path.with_file_name(format!("{}.{}.tmp", file_name, ulid::Ulid::new()));

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| CredentialError::file_io(&temp_path, e))?;
    file.write_all(data)
        .await
        .map_err(|e| CredentialError::file_io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| CredentialError::file_io(&temp_path, e))?;
    fs::rename(&temp_path, final_path)
        .await
        .map_err(|e| CredentialError::file_io(final_path, e))?;
    Ok(())
}

// ============================================================================
// CredentialError
// ============================================================================

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file io error at {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential file at {path} is not valid json: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CredentialError {
    fn file_io(path: &Path, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ensure_scope_creates_session_directory() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());

        store.ensure_scope("upb").await.unwrap();
        assert!(tmp.path().join("upb").is_dir());

        // Second call is a no-op.
        store.ensure_scope("upb").await.unwrap();
    }

    #[tokio::test]
    async fn load_returns_none_before_first_save() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        store.ensure_scope("upb").await.unwrap();

        assert!(store.load("upb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_returns_latest_state() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        store.ensure_scope("upb").await.unwrap();

        store.save("upb", &json!({"rev": 1})).await.unwrap();
        store.save("upb", &json!({"rev": 2})).await.unwrap();

        assert_eq!(store.load("upb").await.unwrap(), Some(json!({"rev": 2})));

        // No temp files left behind.
        let mut entries = fs::read_dir(tmp.path().join("upb")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec![CREDS_FILE.to_string()]);
    }

    #[tokio::test]
    async fn scopes_are_isolated_per_session() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        store.ensure_scope("upb").await.unwrap();
        store.ensure_scope("tipd").await.unwrap();

        store.save("upb", &json!({"owner": "upb"})).await.unwrap();

        assert!(store.load("tipd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(tmp.path());
        store.ensure_scope("upb").await.unwrap();
        fs::write(tmp.path().join("upb").join(CREDS_FILE), b"{not json")
            .await
            .unwrap();

        let result = store.load("upb").await;
        assert!(matches!(result, Err(CredentialError::Corrupt { .. })));
    }
}
