//! Markdown assembly: one document per job, pages in order.
//!
//! PDF jobs get the paged layout:
//!
//! ```text
//! # report.pdf
//!
//! *Processed 3 of 3 pages.*
//!
//! ## Page 1
//!
//! ...
//!
//! ---
//!
//! ## Page 2
//!
//! > **Error:** page 2 could not be processed (timeout): no response within 120s
//!
//! [Original file: report.pdf](/uploads/report.pdf)
//! ```
//!
//! Failed pages keep their slot, so the number of `## Page` headings always
//! equals the number of extracted pages. Image jobs are a single unmarked
//! body followed by the same trailing link.

use super::postprocess::polish_markdown;
use crate::output::{CompletedJob, Job, JobKind, Page};
use crate::storage::file_stem;

const PAGE_SEPARATOR: &str = "\n\n---\n\n";
const EMPTY_PAGE: &str = "*No text was recognised on this page.*";

/// Render a job's pages as one Markdown document.
pub fn assemble_job(job: &Job, original_file_url: Option<&str>) -> String {
    let mut doc = match job.kind {
        JobKind::Pdf => paged_body(job),
        JobKind::Image => job.pages.iter().map(page_body).collect::<Vec<_>>().join("\n\n"),
    };

    if let Some(url) = original_file_url {
        if !doc.is_empty() {
            doc.push_str("\n\n");
        }
        doc.push_str(&format!("[Original file: {}]({})", job.filename, url));
    }
    doc.push('\n');
    doc
}

fn paged_body(job: &Job) -> String {
    let mut out = format!("# {}\n\n{}", job.filename, summary_line(job));

    let pages: Vec<String> = job
        .pages
        .iter()
        .map(|p| format!("## Page {}\n\n{}", p.page_num(), page_body(p)))
        .collect();
    if !pages.is_empty() {
        out.push_str("\n\n");
        out.push_str(&pages.join(PAGE_SEPARATOR));
    }
    out
}

fn summary_line(job: &Job) -> String {
    let processed = job.pages.len();
    let total = job.document_pages.max(processed);
    if job.truncated {
        format!("*Processed {processed} of {total} pages (page limit reached).*")
    } else {
        format!("*Processed {processed} of {total} pages.*")
    }
}

fn page_body(page: &Page) -> String {
    if !page.is_success() {
        return error_marker(page);
    }
    let body = polish_markdown(page.filtered_text.as_deref().unwrap_or_default());
    if body.is_empty() {
        EMPTY_PAGE.to_string()
    } else {
        body
    }
}

fn error_marker(page: &Page) -> String {
    match &page.failure {
        Some(f) => format!(
            "> **Error:** page {} could not be processed ({}): {}",
            page.page_num(),
            f.kind,
            single_line(&f.message)
        ),
        None => format!(
            "> **Error:** page {} could not be processed (unknown): no result",
            page.page_num()
        ),
    }
}

/// Keep the marker inside one blockquote line.
fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Combine the completed jobs of a batch into one document.
pub fn merge_documents(jobs: &[&CompletedJob]) -> String {
    let sections: Vec<String> = jobs
        .iter()
        .enumerate()
        .map(|(i, job)| {
            format!(
                "# {}. {}\n\n{}",
                i + 1,
                file_stem(&job.input),
                job.markdown.trim_end()
            )
        })
        .collect();
    let mut merged = sections.join(PAGE_SEPARATOR);
    merged.push('\n');
    merged
}
