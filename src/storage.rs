//! Artifact storage: retained uploads and generated Markdown.
//!
//! Layout under one root:
//!
//! ```text
//! <root>/uploads/<name>.<ext>   served as /uploads/<name>.<ext>
//! <root>/outputs/<name>.md      served as /outputs/<name>.md
//! ```
//!
//! Names come from the original filename after sanitising. When a name is
//! taken, `-2`, `-3`, ... is appended to the stem. A name is claimed with an
//! exclusive create, so two jobs in the same batch racing for `report.md`
//! end up with `report.md` and `report-2.md`, never one overwriting the
//! other. Callers that need a name before the contents are ready can
//! [`reserve_markdown`](ArtifactStore::reserve_markdown) it first.

use crate::error::StorageError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const UPLOADS_DIR: &str = "uploads";
const OUTPUTS_DIR: &str = "outputs";
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// A file written by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Final file name (after sanitising and de-duplication).
    pub name: String,
    pub path: PathBuf,
    /// Public URL path, e.g. `/outputs/report-2.md`.
    pub url: String,
}

impl StoredFile {
    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Writes uploads and outputs under a data directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    uploads: PathBuf,
    outputs: PathBuf,
}

impl ArtifactStore {
    /// Store rooted at `root`, creating `uploads/` and `outputs/`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        let store = Self {
            uploads: root.join(UPLOADS_DIR),
            outputs: root.join(OUTPUTS_DIR),
        };
        for dir in [&store.uploads, &store.outputs] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StorageError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(store)
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads
    }

    pub fn outputs_dir(&self) -> &Path {
        &self.outputs
    }

    /// Retain an uploaded original under its (sanitised) name.
    pub async fn save_upload(&self, filename: &str, bytes: &[u8]) -> Result<StoredFile, StorageError> {
        let name = sanitize_filename(filename);
        let (stem, ext) = split_name(&name);
        write_unique(&self.uploads, UPLOADS_DIR, stem, ext, bytes).await
    }

    /// Write a Markdown artifact named after `stem`.
    pub async fn save_markdown(&self, stem: &str, markdown: &str) -> Result<StoredFile, StorageError> {
        let stem = sanitize_filename(stem);
        write_unique(&self.outputs, OUTPUTS_DIR, &stem, Some("md"), markdown.as_bytes()).await
    }

    /// Claim a Markdown name now and write its contents later with
    /// [`fill`](Self::fill). The claimed file exists but is empty.
    pub async fn reserve_markdown(&self, stem: &str) -> Result<StoredFile, StorageError> {
        self.save_markdown(stem, "").await
    }

    /// Write the contents of a reserved artifact.
    pub async fn fill(&self, target: &StoredFile, markdown: &str) -> Result<(), StorageError> {
        tokio::fs::write(&target.path, markdown)
            .await
            .map_err(|source| StorageError::Write {
                path: target.path.clone(),
                source,
            })?;
        debug!(path = %target.path.display(), bytes = markdown.len(), "filled artifact");
        Ok(())
    }

    /// Give back a reservation that will not be filled. Best effort.
    pub async fn release(&self, target: &StoredFile) {
        match tokio::fs::remove_file(&target.path).await {
            Ok(()) => debug!(path = %target.path.display(), "released artifact name"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %target.path.display(), error = %e, "could not release artifact name"),
        }
    }
}

/// Replace characters that are unsafe in file names with `_`.
///
/// Path separators, `: * ? " < > |` and control characters are replaced;
/// an empty result becomes `document`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned.to_string()
    }
}

/// File stem without its last extension.
pub fn file_stem(name: &str) -> &str {
    split_name(name).0
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

fn candidate(stem: &str, ext: Option<&str>, n: u32) -> String {
    let stem = if n <= 1 {
        stem.to_string()
    } else {
        format!("{stem}-{n}")
    };
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

/// Percent-encode the characters that break a Markdown link target.
fn url_path(prefix: &str, name: &str) -> String {
    let mut url = format!("/{prefix}/");
    for c in name.chars() {
        match c {
            ' ' => url.push_str("%20"),
            '(' => url.push_str("%28"),
            ')' => url.push_str("%29"),
            '#' => url.push_str("%23"),
            '%' => url.push_str("%25"),
            c => url.push(c),
        }
    }
    url
}

async fn write_unique(
    dir: &Path,
    prefix: &str,
    stem: &str,
    ext: Option<&str>,
    bytes: &[u8],
) -> Result<StoredFile, StorageError> {
    for n in 1..=MAX_NAME_ATTEMPTS {
        let name = candidate(stem, ext, n);
        let path = dir.join(&name);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(StorageError::Write { path, source }),
        };

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(source) = written {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "could not remove partial file");
            }
            return Err(StorageError::Write { path, source });
        }

        debug!(path = %path.display(), bytes = bytes.len(), "stored artifact");
        return Ok(StoredFile {
            url: url_path(prefix, &name),
            name,
            path,
        });
    }
    Err(StorageError::NameExhausted {
        name: candidate(stem, ext, 1),
        attempts: MAX_NAME_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_filename("a:b*c?.pdf"), "a_b_c_.pdf");
        assert_eq!(sanitize_filename("x\"<y>|z.png"), "x__y__z.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\scan.jpg"), "scan.jpg");
        assert_eq!(sanitize_filename("   "), "document");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
    }

    #[test]
    fn stem_splitting() {
        assert_eq!(file_stem("report.final.pdf"), "report.final");
        assert_eq!(file_stem("README"), "README");
        assert_eq!(file_stem(".pdf"), ".pdf");
    }

    #[test]
    fn url_escapes_link_breaking_chars() {
        assert_eq!(url_path("uploads", "my scan (1).png"), "/uploads/my%20scan%20%281%29.png");
    }

    #[tokio::test]
    async fn collisions_get_counter_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();

        let a = store.save_markdown("report", "one").await.unwrap();
        let b = store.save_markdown("report", "two").await.unwrap();
        let c = store.save_markdown("report", "three").await.unwrap();

        assert_eq!(a.name, "report.md");
        assert_eq!(b.name, "report-2.md");
        assert_eq!(c.name, "report-3.md");
        assert_eq!(c.url, "/outputs/report-3.md");
        assert_eq!(std::fs::read_to_string(&a.path).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(&b.path).unwrap(), "two");
    }

    #[tokio::test]
    async fn concurrent_saves_never_share_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let saves = (0..16).map(|i| {
            let store = store.clone();
            async move { store.save_markdown("same", &format!("body {i}")).await }
        });
        let mut names: Vec<_> = futures::future::join_all(saves)
            .await
            .into_iter()
            .map(|r| r.unwrap().name)
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 16);
    }

    #[tokio::test]
    async fn reserved_names_are_held_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let first = store.reserve_markdown("report").await.unwrap();
        let second = store.reserve_markdown("report").await.unwrap();
        assert_eq!(first.url, "/outputs/report.md");
        assert_eq!(second.url, "/outputs/report-2.md");

        store.fill(&second, "# Second").await.unwrap();
        assert_eq!(std::fs::read_to_string(&second.path).unwrap(), "# Second");

        store.release(&first).await;
        assert!(!first.path.exists());
        assert_eq!(store.reserve_markdown("report").await.unwrap().name, "report.md");
    }

    #[tokio::test]
    async fn uploads_keep_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).await.unwrap();
        let a = store.save_upload("scan.jpeg", b"x").await.unwrap();
        let b = store.save_upload("scan.jpeg", b"y").await.unwrap();
        assert_eq!(a.url, "/uploads/scan.jpeg");
        assert_eq!(b.name, "scan-2.jpeg");
        assert!(b.path.starts_with(store.uploads_dir()));
    }
}
