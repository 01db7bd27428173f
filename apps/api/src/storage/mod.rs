//! Artifact Store Adapter.
//!
//! Uploads always land on local disk first. When remote storage is configured,
//! completed artifacts are migrated to it and the record's location switches
//! to the remote URL. Without remote configuration that path is skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::models::analysis::AnalysisRow;

pub mod local;
pub mod remote;

pub use local::{remove_local, LocalArtifact};
pub use remote::{RemoteStorage, S3Storage};

const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "txt"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Remote(String),
}

/// Where an artifact currently lives.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactLocation {
    Local(PathBuf),
    Remote { url: String, key: String },
}

impl ArtifactLocation {
    pub fn of(record: &AnalysisRow) -> Self {
        match &record.storage_key {
            Some(key) => ArtifactLocation::Remote {
                url: record.file_url.clone(),
                key: key.clone(),
            },
            None => ArtifactLocation::Local(PathBuf::from(&record.file_url)),
        }
    }
}

/// A remote object produced by a migration.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub url: String,
    pub key: String,
}

/// An artifact made readable on local disk. Downloaded copies are removed on drop.
pub enum FetchedArtifact {
    Local(PathBuf),
    Downloaded(tempfile::TempPath),
}

impl FetchedArtifact {
    pub fn path(&self) -> &Path {
        match self {
            FetchedArtifact::Local(path) => path.as_path(),
            FetchedArtifact::Downloaded(temp) => &**temp,
        }
    }
}

/// Lower-cased extension of a file name, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("doc") | Some("docx") => "application/msword",
        _ => "application/octet-stream",
    }
}

/// Object key for a migrated artifact: `uploads/<owner>_<millis>.<ext>`.
pub fn remote_key(user_id: Uuid, original_file_name: &str, millis: i64) -> String {
    match extension_of(original_file_name) {
        Some(ext) => format!("uploads/{user_id}_{millis}.{ext}"),
        None => format!("uploads/{user_id}_{millis}"),
    }
}

#[derive(Clone)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    max_upload_bytes: usize,
    remote: Option<Arc<dyn RemoteStorage>>,
}

impl ArtifactStore {
    pub fn new(
        upload_dir: PathBuf,
        max_upload_bytes: usize,
        remote: Option<Arc<dyn RemoteStorage>>,
    ) -> Self {
        Self {
            upload_dir,
            max_upload_bytes,
            remote,
        }
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Rejects uploads that are empty, too large, or of an unsupported type.
    pub fn validate_upload(&self, original_file_name: &str, len: usize) -> Result<(), StorageError> {
        if len == 0 {
            return Err(StorageError::Rejected("Uploaded file is empty".to_string()));
        }
        if len > self.max_upload_bytes {
            return Err(StorageError::Rejected(format!(
                "Uploaded file exceeds the {} byte limit",
                self.max_upload_bytes
            )));
        }
        match extension_of(original_file_name) {
            Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
            _ => Err(StorageError::Rejected(format!(
                "Unsupported file type for '{original_file_name}'. Upload a PDF or text file."
            ))),
        }
    }

    /// Writes an upload to the local upload directory and returns its path.
    pub async fn save_upload(
        &self,
        user_id: Uuid,
        original_file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, StorageError> {
        self.validate_upload(original_file_name, bytes.len())?;
        tokio::fs::create_dir_all(&self.upload_dir).await?;

        let ext = extension_of(original_file_name).unwrap_or_default();
        let file_name = format!(
            "{}_{}_{}.{}",
            user_id,
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..8],
            ext
        );
        let path = self.upload_dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Copies a local artifact to remote storage. `Ok(None)` when remote storage is off.
    pub async fn migrate(
        &self,
        user_id: Uuid,
        original_file_name: &str,
        local: &Path,
    ) -> Result<Option<RemoteObject>, StorageError> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let key = remote_key(user_id, original_file_name, Utc::now().timestamp_millis());
        let url = remote.upload(local, &key).await?;
        Ok(Some(RemoteObject { url, key }))
    }

    /// Makes an artifact readable from local disk, downloading it if it is remote.
    pub async fn fetch(&self, location: &ArtifactLocation) -> Result<FetchedArtifact, StorageError> {
        match location {
            ArtifactLocation::Local(path) => {
                if tokio::fs::try_exists(path).await? {
                    Ok(FetchedArtifact::Local(path.clone()))
                } else {
                    Err(StorageError::Rejected(
                        "The original document is no longer available".to_string(),
                    ))
                }
            }
            ArtifactLocation::Remote { key, .. } => {
                let remote = self.remote.as_ref().ok_or_else(|| {
                    StorageError::Remote("remote storage is not configured".to_string())
                })?;
                let bytes = remote.download(key).await?;
                let suffix = extension_of(key)
                    .map(|ext| format!(".{ext}"))
                    .unwrap_or_default();
                let temp = tempfile::Builder::new()
                    .prefix("cv-")
                    .suffix(&suffix)
                    .tempfile()?
                    .into_temp_path();
                tokio::fs::write(&temp, bytes).await?;
                Ok(FetchedArtifact::Downloaded(temp))
            }
        }
    }

    /// Best-effort removal of an artifact wherever it lives.
    pub async fn discard(&self, location: &ArtifactLocation) {
        match location {
            ArtifactLocation::Local(path) => {
                if let Err(e) = remove_local(path).await {
                    warn!("Could not remove local artifact {}: {e}", path.display());
                }
            }
            ArtifactLocation::Remote { key, .. } => {
                if let Some(remote) = &self.remote {
                    if let Err(e) = remote.delete(key).await {
                        warn!("Could not remove remote artifact {key}: {e}");
                    }
                }
            }
        }
    }
}
