//! Text extraction collaborator.
//!
//! PDFs go through `pdf-extract` on a blocking thread; plain-text uploads are
//! read as UTF-8. Output is trimmed but otherwise left as extracted, so length
//! checks downstream see the document's own spacing.

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::storage::extension_of;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Could not extract text from the document: {0}")]
    Unreadable(String),

    #[error("The uploaded document is no longer available")]
    Missing,

    #[error("I/O error while reading the document: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ExtractError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == ErrorKind::NotFound {
            ExtractError::Missing
        } else {
            ExtractError::Io(e)
        }
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String, ExtractError>;
}

/// Default extractor for `.pdf` and `.txt` artifacts.
pub struct DocumentExtractor;

#[async_trait]
impl TextExtractor for DocumentExtractor {
    async fn extract(&self, path: &Path) -> Result<String, ExtractError> {
        let bytes = tokio::fs::read(path).await?;
        let name = path.to_string_lossy();

        let raw = match extension_of(&name).as_deref() {
            Some("txt") => String::from_utf8_lossy(&bytes).into_owned(),
            Some("pdf") => tokio::task::spawn_blocking(move || {
                pdf_extract::extract_text_from_mem(&bytes)
            })
            .await
            .map_err(|e| ExtractError::Unreadable(format!("PDF parser aborted: {e}")))?
            .map_err(|e| ExtractError::Unreadable(e.to_string()))?,
            _ => {
                return Err(ExtractError::Unreadable(format!(
                    "unsupported document type: {name}"
                )))
            }
        };

        let text = raw.trim().to_string();
        debug!("Extracted {} characters from {}", text.len(), path.display());
        Ok(text)
    }
}
