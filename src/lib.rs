//! # docbatch
//!
//! Batch-convert PDFs and images into Markdown with a vision language model.
//!
//! ## Why this crate?
//!
//! Scanned invoices, photographed receipts and layout-heavy PDFs defeat
//! text extraction. This crate rasterises each PDF page (or takes the image
//! as-is), asks a vision model to read it under a chosen prompt, strips the
//! model's reasoning and runtime chatter, and writes one Markdown document
//! per file, with a history log of what was produced.
//!
//! ## Pipeline Overview
//!
//! ```text
//! files
//!  │
//!  ├─ 1. Detect    PDF or single image, by extension then magic bytes
//!  ├─ 2. Extract   rasterise up to max_pages via pdfium (spawn_blocking)
//!  ├─ 3. Invoke    local mlx_vlm (one call at a time) or remote API (N at once)
//!  ├─ 4. Filter    drop <think> blocks and runtime noise
//!  ├─ 5. Assemble  page markers, inline error markers, link to original
//!  └─ 6. Persist   outputs/<name>.md + history.json record
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docbatch::{
//!     process_batch, ArtifactStore, BatchConfig, HistoryStore, ModelConfig, PromptSpec,
//!     UploadedFile,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = ArtifactStore::open("data").await?;
//!     let history = Arc::new(HistoryStore::open("data/history.json"));
//!     let model = ModelConfig::Api {
//!         base_url: "https://api.openai.com/v1".into(),
//!         api_key: std::env::var("OPENAI_API_KEY")?,
//!         model_name: "gpt-4.1-mini".into(),
//!     };
//!     let files = vec![UploadedFile::new("invoice.pdf", std::fs::read("invoice.pdf")?)];
//!     let results = process_batch(
//!         files,
//!         &PromptSpec::Named("invoice".into()),
//!         &model,
//!         &BatchConfig::default(),
//!         storage,
//!         history,
//!     )
//!     .await?;
//!     for r in results {
//!         println!("{}", serde_json::to_string_pretty(&r)?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docbatch` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ```toml
//! docbatch = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod error;
pub mod history;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod scheduler;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{ModelBackend, ModelOutcome, ModelRequest, ModelResponse};
pub use config::{BatchConfig, BatchConfigBuilder, GenerationParams, ModelConfig, Presets};
pub use error::{BatchError, ExtractionError, FailureKind, JobError, ModelFailure, StorageError};
pub use history::{HistoryRecord, HistoryStore};
pub use output::{
    BatchResponse, CompletedJob, DeleteResponse, FailedJob, HistoryResponse, Job, JobKind,
    JobResult, MergedOutput, Page, Status,
};
pub use pipeline::extract::{PdfRasterizer, PdfiumRasterizer};
pub use pipeline::input::{resolve_input, UploadedFile};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use prompts::PromptSpec;
pub use scheduler::{merge_results, process_batch, BatchScheduler};
pub use storage::ArtifactStore;
