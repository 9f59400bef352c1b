//! Job/page data model and the serialisable batch response shapes.
//!
//! [`Job`] and [`Page`] are the scheduler's working state. [`JobResult`] is
//! what callers get back per input file; [`BatchResponse`],
//! [`HistoryResponse`] and [`DeleteResponse`] are the JSON bodies an HTTP
//! layer (or the CLI's `--json` mode) renders.

use crate::error::{JobError, ModelFailure};
use crate::history::HistoryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Detected type of an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Pdf,
    Image,
}

/// Lifecycle state shared by jobs and pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

/// One unit of model work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 0-based position in the job; output order follows it.
    pub index: usize,
    pub mime_type: String,
    /// Text exactly as the backend returned it.
    pub raw_output: Option<String>,
    /// `raw_output` after the content filter.
    pub filtered_text: Option<String>,
    pub status: Status,
    pub failure: Option<ModelFailure>,
    pub duration_ms: u64,
}

impl Page {
    pub fn new(index: usize, mime_type: impl Into<String>) -> Self {
        Self {
            index,
            mime_type: mime_type.into(),
            raw_output: None,
            filtered_text: None,
            status: Status::Pending,
            failure: None,
            duration_ms: 0,
        }
    }

    /// A page that never got an outcome from the backend.
    pub fn failed(index: usize, mime_type: impl Into<String>, failure: ModelFailure) -> Self {
        Self {
            status: Status::Failed,
            failure: Some(failure),
            ..Self::new(index, mime_type)
        }
    }

    /// 1-indexed page number for display.
    pub fn page_num(&self) -> usize {
        self.index + 1
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Done
    }
}

/// One uploaded file and its pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub filename: String,
    pub kind: JobKind,
    pub pages: Vec<Page>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    /// Pages in the source document (1 for images).
    pub document_pages: usize,
    /// True when the page limit dropped pages.
    pub truncated: bool,
}

impl Job {
    pub fn new(filename: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            filename: filename.into(),
            kind,
            pages: Vec::new(),
            status: Status::Pending,
            created_at: Utc::now(),
            document_pages: 0,
            truncated: false,
        }
    }

    pub fn succeeded_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_success()).count()
    }

    pub fn failed_pages(&self) -> usize {
        self.pages.len() - self.succeeded_pages()
    }

    pub fn first_failure(&self) -> Option<&ModelFailure> {
        self.pages.iter().find_map(|p| p.failure.as_ref())
    }

    /// Set the final status: `Done` iff at least one page succeeded.
    pub fn settle(&mut self) -> Status {
        self.status = if self.succeeded_pages() > 0 {
            Status::Done
        } else {
            Status::Failed
        };
        self.status
    }
}

// ── Per-file results ─────────────────────────────────────────────────────

/// Result for one input file. Serialises to the success or the error
/// entry shape of the batch response.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobResult {
    Completed(CompletedJob),
    Failed(FailedJob),
}

/// A job that produced Markdown (possibly with failed pages inside).
#[derive(Debug, Clone, Serialize)]
pub struct CompletedJob {
    pub input: String,
    /// Public URL of the Markdown artifact.
    pub output_markdown: String,
    /// Filesystem path of the Markdown artifact.
    pub saved_path: String,
    /// Filesystem path of the retained original.
    pub original_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_file_url: Option<String>,
    pub markdown: String,
    pub history_id: String,
    pub status: Status,
    pub pages: usize,
    pub failed_pages: usize,
    #[serde(skip)]
    pub job: Job,
}

/// A job that produced no Markdown.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub input: String,
    pub error: String,
    pub error_kind: String,
    pub status: Status,
}

impl FailedJob {
    pub fn new(input: impl Into<String>, error: &JobError) -> Self {
        Self {
            input: input.into(),
            error: error.to_string(),
            error_kind: error.kind().to_string(),
            status: Status::Failed,
        }
    }
}

impl JobResult {
    pub fn input(&self) -> &str {
        match self {
            JobResult::Completed(c) => &c.input,
            JobResult::Failed(f) => &f.input,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobResult::Completed(_))
    }

    pub fn as_completed(&self) -> Option<&CompletedJob> {
        match self {
            JobResult::Completed(c) => Some(c),
            JobResult::Failed(_) => None,
        }
    }

    pub fn as_failed(&self) -> Option<&FailedJob> {
        match self {
            JobResult::Failed(f) => Some(f),
            JobResult::Completed(_) => None,
        }
    }
}

// ── Response bodies ──────────────────────────────────────────────────────

/// A combined document built from every completed job of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct MergedOutput {
    pub output_markdown: String,
    pub saved_path: String,
    pub markdown: String,
    pub inputs: Vec<String>,
}

/// `{ok, results}` — one entry per input file, in input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub ok: bool,
    pub results: Vec<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<MergedOutput>,
}

impl BatchResponse {
    pub fn new(results: Vec<JobResult>) -> Self {
        Self {
            ok: true,
            results,
            merged: None,
        }
    }
}

/// `{ok, history}`, most recent first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub ok: bool,
    pub history: Vec<HistoryRecord>,
}

impl HistoryResponse {
    /// Wrap records, sorting newest first.
    pub fn new(mut history: Vec<HistoryRecord>) -> Self {
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Self { ok: true, history }
    }
}

/// `{ok}` — `ok` is false when the id was unknown.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn page(index: usize, ok: bool) -> Page {
        if ok {
            Page {
                status: Status::Done,
                filtered_text: Some("text".into()),
                ..Page::new(index, "image/png")
            }
        } else {
            Page::failed(index, "image/png", ModelFailure::new(FailureKind::Timeout, "slow"))
        }
    }

    #[test]
    fn job_done_with_one_success() {
        let mut job = Job::new("a.pdf", JobKind::Pdf);
        job.pages = vec![page(0, false), page(1, true)];
        assert_eq!(job.settle(), Status::Done);
        assert_eq!(job.failed_pages(), 1);
        assert_eq!(job.first_failure().unwrap().kind, FailureKind::Timeout);
    }

    #[test]
    fn job_failed_with_zero_successes() {
        let mut job = Job::new("a.pdf", JobKind::Pdf);
        job.pages = vec![page(0, false), page(1, false)];
        assert_eq!(job.settle(), Status::Failed);
    }

    #[test]
    fn job_ids_are_hex() {
        let job = Job::new("a.png", JobKind::Image);
        assert_eq!(job.id.len(), 32);
        assert!(job.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn failed_entry_shape() {
        let err = JobError::UnsupportedFileType {
            filename: "x.txt".into(),
            extension: "txt".into(),
        };
        let result = JobResult::Failed(FailedJob::new("x.txt", &err));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["input"], "x.txt");
        assert_eq!(json["error_kind"], "unsupported_file_type");
        assert_eq!(json["status"], "failed");
        assert!(json.get("markdown").is_none());
    }

    #[test]
    fn history_response_sorts_newest_first() {
        let rec = |id: &str, ts: i64| HistoryRecord {
            id: id.into(),
            input: format!("{id}.pdf"),
            output_markdown: format!("/outputs/{id}.md"),
            original_file_url: None,
            original_file: None,
            saved_path: None,
            timestamp: ts,
        };
        let resp = HistoryResponse::new(vec![rec("old", 1), rec("new", 3), rec("mid", 2)]);
        let ids: Vec<_> = resp.history.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid", "old"]);
    }
}
