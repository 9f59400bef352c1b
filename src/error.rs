//! Error types for the docbatch library.
//!
//! Failures are split by how far they are allowed to travel:
//!
//! * [`ModelFailure`] — **Non-fatal**: a single page could not be turned
//!   into text (timeout, bad credentials, garbage response). Stored on the
//!   [`crate::output::Page`] and rendered inline in the Markdown; the rest of
//!   the job carries on.
//!
//! * [`JobError`] — **Fatal to one job**: the file could not be read as a
//!   document, every page failed, or its output could not be stored. Reported
//!   as the per-file entry of the batch response; sibling jobs are untouched.
//!
//! * [`BatchError`] — **Fatal to the caller**: bad configuration or an input
//!   that cannot be resolved, detected before any job starts.
//!
//! [`ExtractionError`] and [`StorageError`] are the component errors that
//! feed into [`JobError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort the whole call before any job runs.
#[derive(Debug, Error)]
pub enum BatchError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Backend errors ────────────────────────────────────────────────────
    /// The configured provider could not be created (missing API key etc.).
    #[error("Model provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or preset validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Storage errors ────────────────────────────────────────────────────
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure to turn a PDF into page images.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    /// The bytes do not start with a PDF header.
    #[error("not a PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    /// Header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {detail}")]
    Malformed { detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF is encrypted and requires a password")]
    PasswordRequired,

    /// A password was provided but it is wrong.
    #[error("wrong password for encrypted PDF")]
    WrongPassword,

    /// Parsed fine, but there is nothing to render.
    #[error("PDF contains no pages")]
    EmptyDocument,

    /// pdfium returned an error for a specific page (1-indexed).
    #[error("rasterisation failed for page {page}: {detail}")]
    Rasterisation { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "failed to bind to pdfium library: {0}\n\
PDFium is normally downloaded automatically on first run.\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    EngineUnavailable(String),

    /// Unexpected internal error (worker thread panicked, channel closed).
    #[error("internal extraction error: {0}")]
    Internal(String),
}

/// Failure to read or write an artifact or the history log.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The history log exists but is not valid JSON; it is never overwritten.
    #[error("history log '{path}' is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// Every candidate name for a file was already taken.
    #[error("no free file name for '{name}' after {attempts} attempts")]
    NameExhausted { name: String, attempts: u32 },

    #[error("failed to serialise history: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A fatal error for a single job.
///
/// Reported as that file's entry in the batch response; never aborts the
/// other files in the batch.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("unsupported file type '{extension}' for '{filename}'")]
    UnsupportedFileType { filename: String, extension: String },

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),

    /// Every page failed; no Markdown is written.
    #[error("all {total} pages failed. First error: {first_error}")]
    AllPagesFailed { total: usize, first_error: String },

    /// The batch was cancelled before this job started.
    #[error("cancelled before processing started")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Stable machine-readable error kind for the batch response.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::UnsupportedFileType { .. } => "unsupported_file_type",
            JobError::Extraction(_) => "extraction_error",
            JobError::Storage(_) => "storage_error",
            JobError::AllPagesFailed { .. } => "all_pages_failed",
            JobError::Cancelled => "cancelled",
            JobError::Internal(_) => "internal_error",
        }
    }
}

/// Why a model invocation did not produce text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    AuthError,
    InvalidResponse,
    TransportError,
    ModelRuntimeError,
    /// Never dispatched because the batch was cancelled.
    Cancelled,
}

impl FailureKind {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::TransportError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::AuthError => "auth_error",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::TransportError => "transport_error",
            FailureKind::ModelRuntimeError => "model_runtime_error",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-fatal failure for a single page.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ModelFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ModelFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("no response within {}s", after.as_secs_f32()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "batch cancelled before dispatch")
    }
}
