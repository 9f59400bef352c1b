//! PDF page extraction: rasterise a PDF into an ordered stream of page images.
//!
//! ## Why a channel?
//!
//! pdfium is not async-safe, so rasterisation runs on a blocking thread
//! (`spawn_blocking`). Pages cross back to the async side through a channel
//! of capacity 1: the worker renders at most one page ahead of whoever is
//! consuming the stream, which keeps memory flat for long documents. When
//! the consumer drops the stream (job deadline, cancellation) the next send
//! fails and the worker stops rendering.
//!
//! ## Why a trait?
//!
//! [`PdfRasterizer`] is the seam between page bookkeeping (limits,
//! truncation, ordering) and the rendering engine. [`PdfiumRasterizer`] is the
//! production engine; tests plug in a fake that needs no native library.

use crate::config::BatchConfig;
use crate::error::ExtractionError;
use crate::pipeline::encode::encode_png;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

/// One rasterised page, PNG-encoded.
#[derive(Debug, Clone)]
pub struct SourcePage {
    /// 0-based page index in the document.
    pub index: usize,
    pub mime_type: &'static str,
    pub bytes: Arc<[u8]>,
}

/// Pages in document order. Lazy and single-pass.
pub type PageStream = Pin<Box<dyn Stream<Item = Result<SourcePage, ExtractionError>> + Send>>;

/// The result of opening a PDF.
pub struct PageExtraction {
    /// Pages in the source document.
    pub document_pages: usize,
    /// Pages the stream will yield: `min(document_pages, max_pages)`.
    pub page_count: usize,
    /// True when `max_pages` dropped pages.
    pub truncated: bool,
    pub pages: PageStream,
}

impl std::fmt::Debug for PageExtraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageExtraction")
            .field("document_pages", &self.document_pages)
            .field("page_count", &self.page_count)
            .field("truncated", &self.truncated)
            .finish_non_exhaustive()
    }
}

/// A rendering engine. Called on a blocking thread.
pub trait PdfRasterizer: Send + Sync {
    /// Open `pdf`, report its page count through [`PageSink::opened`], then
    /// render pages `0..min(count, limit)` in order through
    /// [`PageSink::emit`], stopping early as soon as either returns `false`.
    fn rasterize(&self, pdf: &[u8], limit: usize, sink: &mut PageSink) -> Result<(), ExtractionError>;
}

/// Receives the rasteriser's output and forwards it to the async side.
pub struct PageSink {
    opened: Option<oneshot::Sender<Result<usize, ExtractionError>>>,
    pages: mpsc::Sender<Result<SourcePage, ExtractionError>>,
    limit: usize,
    next_index: usize,
}

impl PageSink {
    fn new(
        opened: oneshot::Sender<Result<usize, ExtractionError>>,
        pages: mpsc::Sender<Result<SourcePage, ExtractionError>>,
        limit: usize,
    ) -> Self {
        Self {
            opened: Some(opened),
            pages,
            limit,
            next_index: 0,
        }
    }

    /// Report the document's page count. Returns `false` when there is
    /// nothing to render or nobody is listening.
    pub fn opened(&mut self, total_pages: usize) -> bool {
        match self.opened.take() {
            Some(tx) => tx.send(Ok(total_pages)).is_ok() && total_pages > 0,
            None => !self.pages.is_closed(),
        }
    }

    /// Hand over the next page in document order. Returns `false` when the
    /// page limit is reached or the consumer has gone away.
    pub fn emit(&mut self, image: DynamicImage) -> bool {
        if self.next_index >= self.limit {
            return false;
        }
        let index = self.next_index;
        self.next_index += 1;

        let item = encode_png(&image)
            .map(|png| SourcePage {
                index,
                mime_type: "image/png",
                bytes: png.into(),
            })
            .map_err(|e| ExtractionError::Rasterisation {
                page: index + 1,
                detail: format!("PNG encoding failed: {e}"),
            });
        let encoded = item.is_ok();
        self.pages.blocking_send(item).is_ok() && encoded && self.next_index < self.limit
    }

    fn fail(&mut self, err: ExtractionError) {
        match self.opened.take() {
            Some(tx) => {
                let _ = tx.send(Err(err));
            }
            None => {
                let _ = self.pages.blocking_send(Err(err));
            }
        }
    }
}

/// Open a PDF and start streaming its first `max_pages` pages.
///
/// Fails up front for non-PDF bytes, unreadable documents and documents
/// with zero pages. Pages beyond `max_pages` are dropped and reported via
/// [`PageExtraction::truncated`].
pub async fn extract_pages(
    pdf: Arc<[u8]>,
    max_pages: usize,
    rasterizer: Arc<dyn PdfRasterizer>,
) -> Result<PageExtraction, ExtractionError> {
    if !pdf.starts_with(b"%PDF") {
        return Err(ExtractionError::NotAPdf {
            magic: pdf.iter().take(4).copied().collect(),
        });
    }

    let limit = max_pages.max(1);
    let (open_tx, open_rx) = oneshot::channel();
    let (page_tx, page_rx) = mpsc::channel(1);

    let worker = tokio::task::spawn_blocking(move || {
        let mut sink = PageSink::new(open_tx, page_tx, limit);
        if let Err(e) = rasterizer.rasterize(&pdf, limit, &mut sink) {
            warn!("PDF extraction failed: {}", e);
            sink.fail(e);
        }
    });

    let document_pages = match open_rx.await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            let detail = match worker.await {
                Err(e) => format!("rasteriser panicked: {e}"),
                Ok(()) => "rasteriser finished without opening the document".to_string(),
            };
            return Err(ExtractionError::Internal(detail));
        }
    };

    if document_pages == 0 {
        return Err(ExtractionError::EmptyDocument);
    }

    let page_count = document_pages.min(limit);
    let truncated = document_pages > limit;
    if truncated {
        info!(
            "PDF has {} pages; processing the first {}",
            document_pages, page_count
        );
    }

    Ok(PageExtraction {
        document_pages,
        page_count,
        truncated,
        pages: Box::pin(ReceiverStream::new(page_rx)),
    })
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Renders pages with pdfium, capping the longest edge in pixels.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    max_rendered_pixels: u32,
    password: Option<String>,
}

impl PdfiumRasterizer {
    pub fn new(max_rendered_pixels: u32, password: Option<String>) -> Self {
        Self {
            max_rendered_pixels,
            password,
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.max_rendered_pixels, config.password.clone())
    }
}

impl Default for PdfiumRasterizer {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

impl PdfRasterizer for PdfiumRasterizer {
    fn rasterize(&self, pdf: &[u8], limit: usize, sink: &mut PageSink) -> Result<(), ExtractionError> {
        let pdfium = pdfium_auto::bind_pdfium_silent()
            .map_err(|e| ExtractionError::EngineUnavailable(e.to_string()))?;

        let document = pdfium
            .load_pdf_from_byte_slice(pdf, self.password.as_deref())
            .map_err(|e| {
                let detail = format!("{:?}", e);
                if detail.to_lowercase().contains("password") {
                    if self.password.is_some() {
                        ExtractionError::WrongPassword
                    } else {
                        ExtractionError::PasswordRequired
                    }
                } else {
                    ExtractionError::Malformed { detail }
                }
            })?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        debug!("PDF loaded: {} pages", total_pages);
        if !sink.opened(total_pages) {
            return Ok(());
        }

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_rendered_pixels as i32)
            .set_maximum_height(self.max_rendered_pixels as i32);

        for idx in 0..total_pages.min(limit) {
            let page = pages
                .get(idx as u16)
                .map_err(|e| ExtractionError::Rasterisation {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                })?;

            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                ExtractionError::Rasterisation {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                }
            })?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            if !sink.emit(image) {
                break;
            }
        }
        Ok(())
    }
}
