//! Remote document fetching for outbound document jobs.
//!
//! A document job carries only a URL. Before sending, the resource is probed
//! for its content type, streamed to `<temp_dir>/<job_id>.<ext>`, checked for
//! emptiness and read back into memory. The temp file is removed after a short
//! grace period whether or not the send succeeded.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::backend::OutboundContent;
use crate::config::AttachmentConfig;

/// Extension used when the content type maps to nothing known.
pub const FALLBACK_EXTENSION: &str = "bin";

/// Canonical extensions for types where the registered list is ambiguous or
/// badly ordered (`text/plain` also maps to `asm`, `def`, `conf`, ...).
const CANONICAL_EXTENSIONS: &[(&str, &str)] = &[
    ("application/gzip", "gz"),
    ("application/json", "json"),
    ("application/msword", "doc"),
    ("application/octet-stream", "bin"),
    ("application/vnd.ms-excel", "xls"),
    ("application/vnd.ms-powerpoint", "ppt"),
    ("application/vnd.openxmlformats-officedocument.presentationml.presentation", "pptx"),
    ("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet", "xlsx"),
    ("application/vnd.openxmlformats-officedocument.wordprocessingml.document", "docx"),
    ("application/vnd.rar", "rar"),
    ("application/xml", "xml"),
    ("application/zip", "zip"),
    ("audio/mp4", "m4a"),
    ("audio/mpeg", "mpga"),
    ("audio/ogg", "oga"),
    ("image/jpeg", "jpeg"),
    ("image/svg+xml", "svg"),
    ("image/tiff", "tif"),
    ("text/calendar", "ics"),
    ("text/csv", "csv"),
    ("text/html", "html"),
    ("text/markdown", "md"),
    ("text/plain", "txt"),
    ("video/mp4", "mp4"),
    ("video/mpeg", "mpeg"),
];

/// A document to fetch, as requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDocument {
    pub url: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
}

/// A fetched document ready for sending.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub path: PathBuf,
    pub data: Bytes,
    pub mimetype: String,
    pub file_name: String,
    pub caption: Option<String>,
}

impl PreparedDocument {
    pub fn content(&self) -> OutboundContent {
        OutboundContent::Document {
            data: self.data.clone(),
            mimetype: self.mimetype.clone(),
            file_name: self.file_name.clone(),
            caption: self.caption.clone().unwrap_or_default(),
        }
    }
}

// ============================================================================
// AttachmentPipeline
// ============================================================================

#[derive(Debug, Clone)]
pub struct AttachmentPipeline {
    client: reqwest::Client,
    temp_dir: PathBuf,
    probe_timeout: Duration,
    download_timeout: Duration,
    cleanup_delay: Duration,
}

impl AttachmentPipeline {
    pub fn new(client: reqwest::Client, config: &AttachmentConfig) -> Self {
        Self {
            client,
            temp_dir: config.temp_dir.clone(),
            probe_timeout: config.probe_timeout(),
            download_timeout: config.download_timeout(),
            cleanup_delay: config.cleanup_delay(),
        }
    }

    /// Probe, download and load `source` for job `job_id`.
    ///
    /// On failure after the temp file was created, cleanup is scheduled before
    /// the error is returned.
    pub async fn fetch(
        &self,
        job_id: &str,
        source: &RemoteDocument,
    ) -> Result<PreparedDocument, AttachmentError> {
        let mimetype = self.probe(&source.url).await?;
        let extension = extension_for(&mimetype);

        fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| AttachmentError::io(&self.temp_dir, e))?;
        let path = self.temp_dir.join(format!("{}.{}", job_id, extension));

        debug!(job_id, url = %source.url, mimetype = %mimetype, path = %path.display(), "Downloading attachment");
        let data = match self.download(&source.url, &path).await {
            Ok(data) => data,
            Err(e) => {
                self.schedule_cleanup(job_id, path);
                return Err(e);
            }
        };

        let file_name = source
            .file_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.{}", job_id, extension));

        Ok(PreparedDocument {
            path,
            data,
            mimetype,
            file_name,
            caption: source.caption.clone(),
        })
    }

    /// Remove `path` after the cleanup delay. Failures are logged, never raised.
    pub fn schedule_cleanup(&self, job_id: &str, path: PathBuf) {
        let delay = self.cleanup_delay;
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match fs::remove_file(&path).await {
                Ok(()) => debug!(job_id = %job_id, path = %path.display(), "Temp file removed"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(
                    job_id = %job_id,
                    path = %path.display(),
                    error = %e,
                    status = "CLEANUP_FAILED",
                    "Failed to remove temp file"
                ),
            }
        });
    }

    /// Lightweight metadata request; the content type is mandatory.
    async fn probe(&self, url: &str) -> Result<String, AttachmentError> {
        let response = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AttachmentError::Probe)?;

        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or(AttachmentError::MissingContentType)
    }

    /// Stream the body to `path`, then read it back.
    async fn download(&self, url: &str, path: &Path) -> Result<Bytes, AttachmentError> {
        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(AttachmentError::Download)?;

        let mut file = fs::File::create(path)
            .await
            .map_err(|e| AttachmentError::io(path, e))?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(AttachmentError::Download)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| AttachmentError::io(path, e))?;
        }
        file.flush().await.map_err(|e| AttachmentError::io(path, e))?;
        drop(file);

        let size = match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(AttachmentError::Missing),
            Err(e) => return Err(AttachmentError::io(path, e)),
        };
        if size == 0 {
            return Err(AttachmentError::Empty);
        }

        let data = fs::read(path)
            .await
            .map_err(|e| AttachmentError::io(path, e))?;
        Ok(Bytes::from(data))
    }
}

/// Pick a file extension for a content type, ignoring parameters.
///
/// Looks in [`CANONICAL_EXTENSIONS`] first, then prefers the registered
/// extension equal to the subtype, then the first registered one, and finally
/// [`FALLBACK_EXTENSION`].
pub fn extension_for(content_type: &str) -> String {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if let Some((_, ext)) = CANONICAL_EXTENSIONS.iter().find(|(mime, _)| *mime == essence) {
        return ext.to_string();
    }

    let Some(extensions) = mime_guess::get_mime_extensions_str(&essence) else {
        return FALLBACK_EXTENSION.to_string();
    };
    let subtype = essence.split('/').nth(1).unwrap_or_default();

    extensions
        .iter()
        .find(|ext| **ext == subtype)
        .or_else(|| extensions.first())
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

// ============================================================================
// AttachmentError
// ============================================================================

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("resource probe failed: {0}")]
    Probe(#[source] reqwest::Error),

    #[error("resource did not report a content type")]
    MissingContentType,

    #[error("download failed: {0}")]
    Download(#[source] reqwest::Error),

    #[error("downloaded file not found")]
    Missing,

    #[error("downloaded file is empty (0 bytes)")]
    Empty,

    #[error("temp file io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AttachmentError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
