//! The configuration store holding the backend configuration document.
//!
//! A store hands out the raw document together with a version token and only
//! accepts a write carrying the token of the revision it replaces.
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("document was modified concurrently: {0}")]
    Conflict(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("request to config store failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("config store returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid config store response: {0}")]
    InvalidResponse(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("config store call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// The write was rejected because the version token was stale.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Opaque optimistic-concurrency stamp issued by a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new<T: Into<String>>(token: T) -> Self {
        VersionToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The document bytes as stored, with the token to write them back.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigRevision {
    pub data: Vec<u8>,
    pub version: VersionToken,
}

/// A single named document. Implementations are bound to the document they
/// serve when constructed.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self) -> Result<ConfigRevision, StoreError>;

    /// Replaces the whole document. Fails with [`StoreError::Conflict`] when
    /// `version` no longer identifies the current revision.
    async fn update(&self, data: Vec<u8>, version: &VersionToken) -> Result<(), StoreError>;
}

/// Stores the document in a local file. The token is the SHA-256 of the
/// file contents, so any out-of-band edit invalidates outstanding tokens.
pub struct FilesystemStore {
    path: PathBuf,
    // Serializes check-then-write within this process.
    write_lock: Mutex<()>,
}

impl FilesystemStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FilesystemStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(self.path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn digest(data: &[u8]) -> VersionToken {
    VersionToken(hex::encode(Sha256::digest(data)))
}

#[async_trait]
impl ConfigStore for FilesystemStore {
    async fn get(&self) -> Result<ConfigRevision, StoreError> {
        let data = self.read().await?;
        let version = digest(&data);
        Ok(ConfigRevision { data, version })
    }

    async fn update(&self, data: Vec<u8>, version: &VersionToken) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let current = digest(&self.read().await?);
        if &current != version {
            return Err(StoreError::Conflict(format!(
                "{} changed since version {version}",
                self.path.display()
            )));
        }

        // Write next to the target and rename so readers never see a partial file.
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, &data).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        tracing::debug!(path = %self.path.display(), bytes = data.len(), "stored document");
        Ok(())
    }
}
