//! Progress-callback trait for batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::scheduler::BatchScheduler::with_progress`] to receive events as
//! files and pages move through the pipeline. An HTTP layer can forward
//! them to a server-sent-events stream; the CLI drives a progress bar.
//!
//! Files are processed concurrently and pages within a file may complete out
//! of order, so every method can be called from several tasks at once.
//!
//! # Example
//!
//! ```rust
//! use docbatch::BatchProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct PageCounter(AtomicUsize);
//!
//! impl BatchProgressCallback for PageCounter {
//!     fn on_page_complete(&self, _file: &str, _page: usize, _total: usize, _len: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the scheduler as a batch runs.
///
/// All methods have no-op defaults so callers only override what they need.
/// `file_index` is the 0-based position of the file in the batch input.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any file is processed.
    fn on_batch_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called when a file's pages are known and dispatch is about to begin.
    fn on_file_start(&self, file_index: usize, filename: &str, total_pages: usize) {
        let _ = (file_index, filename, total_pages);
    }

    /// Called when a page's text has been received and filtered.
    ///
    /// `page_num` is 1-indexed; `text_len` is the filtered text length.
    fn on_page_complete(&self, filename: &str, page_num: usize, total_pages: usize, text_len: usize) {
        let _ = (filename, page_num, total_pages, text_len);
    }

    /// Called when a page ends in a failure (after retries).
    fn on_page_error(&self, filename: &str, page_num: usize, total_pages: usize, error: &str) {
        let _ = (filename, page_num, total_pages, error);
    }

    /// Called when a file produced Markdown.
    fn on_file_complete(&self, file_index: usize, filename: &str, output_url: &str) {
        let _ = (file_index, filename, output_url);
    }

    /// Called when a file failed as a whole.
    fn on_file_error(&self, file_index: usize, filename: &str, error: &str) {
        let _ = (file_index, filename, error);
    }

    /// Called once after every file has a result.
    fn on_batch_complete(&self, total_files: usize, succeeded: usize) {
        let _ = (total_files, succeeded);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Shared handle stored by the scheduler.
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        files_started: AtomicUsize,
        pages_done: AtomicUsize,
        page_errors: AtomicUsize,
        files_failed: AtomicUsize,
        succeeded: AtomicUsize,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_file_start(&self, _i: usize, _f: &str, _t: usize) {
            self.files_started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_page_complete(&self, _f: &str, _p: usize, _t: usize, _l: usize) {
            self.pages_done.fetch_add(1, Ordering::SeqCst);
        }
        fn on_page_error(&self, _f: &str, _p: usize, _t: usize, _e: &str) {
            self.page_errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_file_error(&self, _i: usize, _f: &str, _e: &str) {
            self.files_failed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_batch_complete(&self, _total: usize, succeeded: usize) {
            self.succeeded.store(succeeded, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(2);
        cb.on_file_start(0, "a.pdf", 3);
        cb.on_page_complete("a.pdf", 1, 3, 42);
        cb.on_page_error("a.pdf", 2, 3, "timeout");
        cb.on_file_complete(0, "a.pdf", "/outputs/a.md");
        cb.on_file_error(1, "b.txt", "unsupported");
        cb.on_batch_complete(2, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let t = TrackingCallback::default();
        t.on_file_start(0, "a.pdf", 2);
        t.on_page_complete("a.pdf", 1, 2, 10);
        t.on_page_error("a.pdf", 2, 2, "auth_error");
        t.on_file_error(1, "b.txt", "unsupported");
        t.on_batch_complete(2, 1);

        assert_eq!(t.files_started.load(Ordering::SeqCst), 1);
        assert_eq!(t.pages_done.load(Ordering::SeqCst), 1);
        assert_eq!(t.page_errors.load(Ordering::SeqCst), 1);
        assert_eq!(t.files_failed.load(Ordering::SeqCst), 1);
        assert_eq!(t.succeeded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(1);
    }
}
