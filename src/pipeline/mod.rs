//! Pipeline stages for turning one uploaded file into Markdown.
//!
//! Each submodule implements one step and is testable on its own; the
//! [`crate::scheduler`] wires them together per job.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ detect ──▶ extract ──▶ (backend) ──▶ filter ──▶ assemble
//! (path/URL) (pdf|image) (pdfium)    (VLM)     (<think>, noise) (+ polish)
//! ```
//!
//! 1. [`input`]   resolve a path or URL to bytes plus a filename
//! 2. [`detect`]  route by extension, falling back to magic bytes
//! 3. [`extract`] rasterise PDF pages on a blocking thread and stream them
//!    out in order; images skip this step and become a single page
//! 4. [`encode`]  PNG and base64 helpers shared by extraction and backends
//! 5. [`filter`]  drop reasoning traces and runtime noise from model text
//! 6. [`postprocess`] tidy each page body (fences, line endings, blank runs)
//! 7. [`assemble`] stitch pages into the final document

pub mod assemble;
pub mod detect;
pub mod encode;
pub mod extract;
pub mod filter;
pub mod input;
pub mod postprocess;
