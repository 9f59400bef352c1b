//! Batch scheduler: one job per uploaded file, two nested concurrency limits.
//!
//! ```text
//! files ──buffered(batch_size)──▶ job ──▶ pages ──buffer_unordered(n)──▶ backend
//!                                                   │
//!                                      Semaphore(batch_size) per call
//! ```
//!
//! - Files run `batch_size` at a time and results come back in input order.
//! - Pages of one job run `n` at a time, where `n` is the backend's
//!   effective concurrency (1 for local, `batch_size` for remote).
//! - Every page invocation also holds a permit from the batch's own
//!   semaphore, so concurrent jobs together never exceed `batch_size`
//!   calls in flight. Each call to [`BatchScheduler::process`] owns its pool.
//!
//! Upload and output names are claimed one file at a time, in input order,
//! before any job starts, so two files called `scan.png` always become
//! `scan.md` and `scan-2.md` in that order.
//!
//! A failing page is recorded and its siblings carry on. A failing file is a
//! [`FailedJob`] entry and its siblings carry on. Nothing aborts the batch.

use crate::backend::{ModelBackend, ModelOutcome, ModelRequest};
use crate::config::{BatchConfig, ModelConfig};
use crate::error::{BatchError, ExtractionError, FailureKind, JobError, ModelFailure, StorageError};
use crate::history::{HistoryRecord, HistoryStore};
use crate::output::{CompletedJob, FailedJob, Job, JobKind, JobResult, MergedOutput, Page, Status};
use crate::pipeline::assemble::{assemble_job, merge_documents};
use crate::pipeline::detect::{detect, DetectedType};
use crate::pipeline::extract::{
    extract_pages, PageExtraction, PageStream, PdfRasterizer, PdfiumRasterizer, SourcePage,
};
use crate::pipeline::filter::filter_output;
use crate::pipeline::input::UploadedFile;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::PromptSpec;
use crate::storage::{file_stem, ArtifactStore, StoredFile};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drives batches against one backend, artifact store and history log.
pub struct BatchScheduler {
    backend: ModelBackend,
    storage: ArtifactStore,
    history: Arc<HistoryStore>,
    rasterizer: Option<Arc<dyn PdfRasterizer>>,
    progress: ProgressCallback,
}

/// A file whose type is known and whose artifact names are claimed.
struct PreparedJob {
    file: UploadedFile,
    detected: DetectedType,
    upload: StoredFile,
    output: StoredFile,
}

/// Per-batch state shared by every job.
struct BatchContext<'a> {
    prompt: Arc<str>,
    config: &'a BatchConfig,
    permits: Semaphore,
    rasterizer: Arc<dyn PdfRasterizer>,
    cancel: CancellationToken,
}

impl BatchScheduler {
    pub fn new(backend: ModelBackend, storage: ArtifactStore, history: Arc<HistoryStore>) -> Self {
        Self {
            backend,
            storage,
            history,
            rasterizer: None,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// Use a specific PDF engine instead of pdfium.
    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PdfRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn backend(&self) -> &ModelBackend {
        &self.backend
    }

    /// Process every file; one result per file, in input order.
    pub async fn process(
        &self,
        files: Vec<UploadedFile>,
        prompt: &PromptSpec,
        config: &BatchConfig,
    ) -> Vec<JobResult> {
        self.process_with_cancel(files, prompt, config, CancellationToken::new())
            .await
    }

    /// Like [`process`](Self::process), stopping early once `cancel` fires.
    ///
    /// Files not yet started fail with `cancelled`. Running files stop
    /// dispatching pages (those pages fail with `cancelled`), let in-flight
    /// pages finish, and still write their Markdown.
    pub async fn process_with_cancel(
        &self,
        files: Vec<UploadedFile>,
        prompt: &PromptSpec,
        config: &BatchConfig,
        cancel: CancellationToken,
    ) -> Vec<JobResult> {
        let batch_size = config.batch_size.max(1);
        let ctx = BatchContext {
            prompt: Arc::from(prompt.resolve()),
            config,
            permits: Semaphore::new(batch_size),
            rasterizer: self
                .rasterizer
                .clone()
                .unwrap_or_else(|| Arc::new(PdfiumRasterizer::from_config(config))),
            cancel,
        };
        let ctx = &ctx;

        let total = files.len();
        info!(
            "Processing {} file(s) with {} (batch size {})",
            total,
            self.backend.label(),
            batch_size
        );
        self.progress.on_batch_start(total);

        let mut claims = Vec::with_capacity(total);
        for file in files {
            let input = file.filename.clone();
            let claim = if ctx.cancel.is_cancelled() {
                Err(JobError::Cancelled)
            } else {
                self.prepare(file).await
            };
            claims.push((input, claim));
        }

        let results: Vec<JobResult> = stream::iter(claims.into_iter().enumerate())
            .map(|(index, (input, claim))| self.run_job(index, input, claim, ctx))
            .buffered(batch_size)
            .collect()
            .await;

        let succeeded = results.iter().filter(|r| r.is_completed()).count();
        info!("Batch finished: {}/{} file(s) succeeded", succeeded, total);
        self.progress.on_batch_complete(total, succeeded);
        results
    }

    /// Detect the type, retain the upload and reserve the output name.
    async fn prepare(&self, file: UploadedFile) -> Result<PreparedJob, JobError> {
        let detected = detect(&file.filename, &file.bytes)?;
        let upload = self.storage.save_upload(&file.filename, &file.bytes).await?;
        let output = self.storage.reserve_markdown(file_stem(&upload.name)).await?;
        debug!("{}: claimed {} and {}", file.filename, upload.name, output.name);
        Ok(PreparedJob {
            file,
            detected,
            upload,
            output,
        })
    }

    async fn run_job(
        &self,
        index: usize,
        input: String,
        claim: Result<PreparedJob, JobError>,
        ctx: &BatchContext<'_>,
    ) -> JobResult {
        let outcome = match claim {
            Err(e) => Err(e),
            Ok(prepared) => {
                let output = prepared.output.clone();
                let outcome = if ctx.cancel.is_cancelled() {
                    Err(JobError::Cancelled)
                } else {
                    self.execute(index, prepared, ctx).await
                };
                if outcome.is_err() {
                    self.storage.release(&output).await;
                }
                outcome
            }
        };

        match outcome {
            Ok(done) => {
                info!(
                    "{}: {} page(s), {} failed → {}",
                    done.input, done.pages, done.failed_pages, done.output_markdown
                );
                self.progress
                    .on_file_complete(index, &done.input, &done.output_markdown);
                JobResult::Completed(done)
            }
            Err(e) => {
                warn!("{}: {}", input, e);
                self.progress.on_file_error(index, &input, &e.to_string());
                JobResult::Failed(FailedJob::new(input, &e))
            }
        }
    }

    async fn execute(
        &self,
        index: usize,
        prepared: PreparedJob,
        ctx: &BatchContext<'_>,
    ) -> Result<CompletedJob, JobError> {
        let PreparedJob {
            file,
            detected,
            upload,
            output,
        } = prepared;
        let mut job = Job::new(file.filename.as_str(), detected.kind);
        job.status = Status::Running;
        let deadline = ctx.config.job_timeout().map(|t| Instant::now() + t);
        let bytes: Arc<[u8]> = file.bytes.into();

        let (pages, page_count, page_mime) = match detected.kind {
            JobKind::Pdf => {
                let extraction = open_pdf(bytes, ctx, deadline).await?;
                job.document_pages = extraction.document_pages;
                job.truncated = extraction.truncated;
                (extraction.pages, extraction.page_count, "image/png")
            }
            JobKind::Image => {
                job.document_pages = 1;
                let page = SourcePage {
                    index: 0,
                    mime_type: detected.mime_type,
                    bytes,
                };
                let single: PageStream = Box::pin(stream::iter([Ok::<_, ExtractionError>(page)]));
                (single, 1, detected.mime_type)
            }
        };

        debug!("{}: dispatching {} page(s)", job.filename, page_count);
        self.progress.on_file_start(index, &job.filename, page_count);
        job.pages = self
            .run_pages(&job.filename, pages, page_count, page_mime, deadline, ctx)
            .await?;

        if job.settle() == Status::Failed {
            let cancelled = job
                .pages
                .iter()
                .all(|p| matches!(&p.failure, Some(f) if f.kind == FailureKind::Cancelled));
            if cancelled {
                return Err(JobError::Cancelled);
            }
            return Err(JobError::AllPagesFailed {
                total: job.pages.len(),
                first_error: job
                    .first_failure()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "no page produced output".to_string()),
            });
        }

        let markdown = assemble_job(&job, Some(&upload.url));
        self.storage.fill(&output, &markdown).await?;
        let saved_path = output.path_string();
        let original_file = upload.path_string();

        let mut record = HistoryRecord::new(job.filename.as_str(), output.url.as_str());
        record.original_file_url = Some(upload.url.clone());
        record.original_file = Some(original_file.clone());
        record.saved_path = Some(saved_path.clone());
        let history_id = record.id.clone();
        self.history.append(record).await?;

        Ok(CompletedJob {
            input: job.filename.clone(),
            output_markdown: output.url,
            saved_path,
            original_file,
            original_file_url: Some(upload.url),
            markdown,
            history_id,
            status: job.status,
            pages: job.pages.len(),
            failed_pages: job.failed_pages(),
            job,
        })
    }

    /// Run every page to an outcome, in page order.
    ///
    /// Pages still running at the job deadline are dropped and recorded as
    /// timeouts. A rasterisation error ends the job.
    async fn run_pages(
        &self,
        filename: &str,
        pages: PageStream,
        page_count: usize,
        mime_type: &str,
        deadline: Option<Instant>,
        ctx: &BatchContext<'_>,
    ) -> Result<Vec<Page>, JobError> {
        let source: Arc<str> = Arc::from(filename);
        let concurrency = self.backend.effective_concurrency(ctx.config.batch_size);
        let mut slots: Vec<Option<Page>> = (0..page_count).map(|_| None).collect();

        let mut outcomes = pages
            .map(|item| {
                let source = source.clone();
                async move {
                    match item {
                        Ok(page) => Ok(self.run_page(page, source, page_count, ctx).await),
                        Err(e) => Err(e),
                    }
                }
            })
            .buffer_unordered(concurrency);

        let mut timed_out = false;
        loop {
            let next = match deadline {
                Some(at) => match timeout_at(at, outcomes.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => outcomes.next().await,
            };
            match next {
                Some(Ok(page)) => {
                    if let Some(slot) = slots.get_mut(page.index) {
                        *slot = Some(page);
                    }
                }
                Some(Err(e)) => return Err(JobError::Extraction(e)),
                None => break,
            }
        }
        drop(outcomes);

        let unfinished = slots.iter().filter(|s| s.is_none()).count();
        if unfinished > 0 && !timed_out {
            return Err(JobError::Extraction(ExtractionError::Internal(format!(
                "page stream ended after {} of {} pages",
                page_count - unfinished,
                page_count
            ))));
        }
        if timed_out {
            warn!(
                "{}: job deadline reached with {} page(s) unfinished",
                filename, unfinished
            );
        }

        let job_secs = ctx.config.job_timeout_secs.unwrap_or_default();
        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let failure = ModelFailure::new(
                        FailureKind::Timeout,
                        format!("job deadline of {job_secs}s passed before this page finished"),
                    );
                    self.progress
                        .on_page_error(filename, index + 1, page_count, &failure.to_string());
                    Page::failed(index, mime_type, failure)
                })
            })
            .collect())
    }

    async fn run_page(
        &self,
        source_page: SourcePage,
        source: Arc<str>,
        total_pages: usize,
        ctx: &BatchContext<'_>,
    ) -> Page {
        let index = source_page.index;
        let permit = if ctx.cancel.is_cancelled() {
            None
        } else {
            tokio::select! {
                permit = ctx.permits.acquire() => permit.ok(),
                _ = ctx.cancel.cancelled() => None,
            }
        };
        let Some(_permit) = permit else {
            let failure = ModelFailure::cancelled();
            self.progress
                .on_page_error(&source, index + 1, total_pages, &failure.to_string());
            return Page::failed(index, source_page.mime_type, failure);
        };

        let mut page = Page::new(index, source_page.mime_type);
        page.status = Status::Running;
        let request = ModelRequest::new(
            source_page.bytes,
            source_page.mime_type,
            ctx.prompt.clone(),
            ctx.config.generation,
        )
        .with_context(source.clone(), index);

        let response = self.backend.invoke(&request).await;
        page.duration_ms = response.duration_ms;
        match response.outcome {
            ModelOutcome::Success { text } => {
                let filtered = filter_output(&text);
                debug!(
                    "{} page {}: {} → {} chars after filtering",
                    source,
                    index + 1,
                    text.len(),
                    filtered.len()
                );
                self.progress
                    .on_page_complete(&source, index + 1, total_pages, filtered.len());
                page.raw_output = Some(text);
                page.filtered_text = Some(filtered);
                page.status = Status::Done;
            }
            ModelOutcome::Failure(failure) => {
                self.progress
                    .on_page_error(&source, index + 1, total_pages, &failure.to_string());
                page.failure = Some(failure);
                page.status = Status::Failed;
            }
        }
        page
    }
}

async fn open_pdf(
    bytes: Arc<[u8]>,
    ctx: &BatchContext<'_>,
    deadline: Option<Instant>,
) -> Result<PageExtraction, ExtractionError> {
    let opening = extract_pages(bytes, ctx.config.max_pages, ctx.rasterizer.clone());
    match deadline {
        Some(at) => timeout_at(at, opening).await.map_err(|_| {
            ExtractionError::Internal("job deadline passed while opening the document".into())
        })?,
        None => opening.await,
    }
}

/// Build the backend for `model` and process one batch with it.
pub async fn process_batch(
    files: Vec<UploadedFile>,
    prompt: &PromptSpec,
    model: &ModelConfig,
    config: &BatchConfig,
    storage: ArtifactStore,
    history: Arc<HistoryStore>,
) -> Result<Vec<JobResult>, BatchError> {
    let backend = ModelBackend::from_config(model, config)?;
    Ok(BatchScheduler::new(backend, storage, history)
        .process(files, prompt, config)
        .await)
}

/// Write the completed jobs of a batch as one `merged_<timestamp>.md`.
///
/// Returns `None` when no job completed.
pub async fn merge_results(
    results: &[JobResult],
    storage: &ArtifactStore,
) -> Result<Option<MergedOutput>, StorageError> {
    let completed: Vec<&CompletedJob> = results.iter().filter_map(JobResult::as_completed).collect();
    if completed.is_empty() {
        return Ok(None);
    }
    let markdown = merge_documents(&completed);
    let stem = format!("merged_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let saved = storage.save_markdown(&stem, &markdown).await?;
    Ok(Some(MergedOutput {
        saved_path: saved.path_string(),
        output_markdown: saved.url,
        markdown,
        inputs: completed.iter().map(|c| c.input.clone()).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LocalBackend, LocalModel};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixed(&'static str);

    #[async_trait]
    impl LocalModel for Fixed {
        async fn generate(&mut self, _request: &ModelRequest) -> Result<String, ModelFailure> {
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl LocalModel for Failing {
        async fn generate(&mut self, _request: &ModelRequest) -> Result<String, ModelFailure> {
            Err(ModelFailure::new(FailureKind::ModelRuntimeError, "boom"))
        }
    }

    async fn scheduler(
        model: impl LocalModel + 'static,
        dir: &std::path::Path,
    ) -> (BatchScheduler, Arc<HistoryStore>) {
        let storage = ArtifactStore::open(dir).await.unwrap();
        let history = Arc::new(HistoryStore::open(dir.join("history.json")));
        let backend = ModelBackend::Local(LocalBackend::new(model, Duration::from_secs(5)));
        (BatchScheduler::new(backend, storage, history.clone()), history)
    }

    fn png() -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(2, 2);
        crate::pipeline::encode::encode_png(&img).unwrap()
    }

    #[tokio::test]
    async fn image_job_completes_and_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (s, history) = scheduler(Fixed("<think>hmm</think>\n# Receipt"), dir.path()).await;
        let results = s
            .process(
                vec![UploadedFile::new("scan.png", png())],
                &PromptSpec::default(),
                &BatchConfig::default(),
            )
            .await;
        let done = results[0].as_completed().expect("completed");
        assert_eq!(done.status, Status::Done);
        assert!(done.markdown.starts_with("# Receipt"));
        assert!(done.markdown.contains("[Original file: scan.png](/uploads/scan.png)"));
        assert_eq!(done.output_markdown, "/outputs/scan.md");
        let records = history.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, done.history_id);
    }

    #[tokio::test]
    async fn unsupported_file_does_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = scheduler(Fixed("ok"), dir.path()).await;
        let results = s
            .process(
                vec![
                    UploadedFile::new("notes.txt", b"hello".to_vec()),
                    UploadedFile::new("a.png", png()),
                ],
                &PromptSpec::default(),
                &BatchConfig::default(),
            )
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_failed().unwrap().error_kind, "unsupported_file_type");
        assert!(results[1].is_completed());
    }

    #[tokio::test]
    async fn all_pages_failing_fails_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let (s, history) = scheduler(Failing, dir.path()).await;
        let results = s
            .process(
                vec![UploadedFile::new("a.png", png())],
                &PromptSpec::default(),
                &BatchConfig::default(),
            )
            .await;
        let failed = results[0].as_failed().unwrap();
        assert_eq!(failed.error_kind, "all_pages_failed");
        assert!(failed.error.contains("boom"));
        assert!(history.list().await.unwrap().is_empty());
        assert!(!dir.path().join("outputs").join("a.md").exists());
    }

    #[tokio::test]
    async fn cancelled_batch_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = scheduler(Fixed("ok"), dir.path()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = s
            .process_with_cancel(
                vec![UploadedFile::new("a.png", png())],
                &PromptSpec::default(),
                &BatchConfig::default(),
                cancel,
            )
            .await;
        assert_eq!(results[0].as_failed().unwrap().error_kind, "cancelled");
    }

    #[tokio::test]
    async fn merge_writes_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = scheduler(Fixed("body"), dir.path()).await;
        let results = s
            .process(
                vec![UploadedFile::new("a.png", png()), UploadedFile::new("b.png", png())],
                &PromptSpec::default(),
                &BatchConfig::default(),
            )
            .await;
        let storage = ArtifactStore::open(dir.path()).await.unwrap();
        let merged = merge_results(&results, &storage).await.unwrap().unwrap();
        assert!(merged.output_markdown.starts_with("/outputs/merged_"));
        assert!(merged.markdown.contains("# 1. a"));
        assert!(merged.markdown.contains("# 2. b"));
        assert_eq!(merged.inputs, ["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn merge_of_nothing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtifactStore::open(dir.path()).await.unwrap();
        assert!(merge_results(&[], &storage).await.unwrap().is_none());
    }
}
