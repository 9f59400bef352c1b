//! Input resolution: turn a path or URL into an in-memory upload.
//!
//! The scheduler only ever sees [`UploadedFile`]s (a name plus bytes), the
//! same shape an HTTP multipart upload produces. This module is how the CLI
//! and library callers get there from a local path or an HTTP(S) URL.

use crate::error::BatchError;
use std::path::PathBuf;
use tracing::{debug, info};

/// A file submitted to a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Original file name; drives type detection and output naming.
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a local path or HTTP(S) URL into an [`UploadedFile`].
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<UploadedFile, BatchError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(input).await
    }
}

async fn read_local(path_str: &str) -> Result<UploadedFile, BatchError> {
    if path_str.trim().is_empty() {
        return Err(BatchError::InvalidInput {
            input: path_str.to_string(),
        });
    }
    let path = PathBuf::from(path_str);
    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => BatchError::PermissionDenied { path: path.clone() },
        std::io::ErrorKind::NotFound => BatchError::FileNotFound { path: path.clone() },
        _ => BatchError::InvalidInput {
            input: format!("{path_str}: {e}"),
        },
    })?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| BatchError::InvalidInput {
            input: path_str.to_string(),
        })?;

    debug!("Read local input: {} ({} bytes)", path.display(), bytes.len());
    Ok(UploadedFile { filename, bytes })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<UploadedFile, BatchError> {
    info!("Downloading input from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| BatchError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            BatchError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            BatchError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(BatchError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let filename = extract_filename(url, content_type.as_deref());

    let bytes = response
        .bytes()
        .await
        .map_err(|e| BatchError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    info!("Downloaded {} ({} bytes)", filename, bytes.len());
    Ok(UploadedFile {
        filename,
        bytes: bytes.to_vec(),
    })
}

/// Pick a file name from the URL path, else from the content type.
fn extract_filename(url: &str, content_type: Option<&str>) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|s| s.trim().to_ascii_lowercase());
    let ext = match mime.as_deref() {
        Some("image/png") => "png",
        Some("image/jpeg") => "jpg",
        Some("image/webp") => "webp",
        Some("image/bmp") => "bmp",
        Some("image/tiff") => "tiff",
        _ => "pdf",
    };
    format!("downloaded.{ext}")
}
