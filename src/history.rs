//! Processing history: a flat JSON log of completed jobs.
//!
//! The log is the one piece of mutable state shared across batches, so every
//! operation takes the store's lock, reads the file, and (for mutations)
//! writes the new contents to a sibling temp file before renaming it over the
//! log. A crash mid-write leaves the previous log intact.
//!
//! The file layout is a JSON array of [`HistoryRecord`]s with Unix-second
//! timestamps.

use crate::error::StorageError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    /// Original input file name.
    pub input: String,
    /// Public URL of the Markdown artifact.
    pub output_markdown: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_url: Option<String>,
    /// Filesystem path of the retained original.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file: Option<String>,
    /// Filesystem path of the Markdown artifact; removed on delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
}

impl HistoryRecord {
    /// New record with a fresh id and the current time.
    pub fn new(input: impl Into<String>, output_markdown: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            input: input.into(),
            output_markdown: output_markdown.into(),
            original_file_url: None,
            original_file: None,
            saved_path: None,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Serialized-access store over one history file.
///
/// Share one instance (behind an `Arc`) per file; two stores opened on the
/// same path do not coordinate with each other.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryStore {
    /// Open (lazily) the log at `path`. A missing file is an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    pub async fn append(&self, record: HistoryRecord) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        debug!(id = %record.id, input = %record.input, "appending history record");
        records.push(record);
        self.store(&records).await
    }

    /// All records in insertion order.
    pub async fn list(&self) -> Result<Vec<HistoryRecord>, StorageError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Remove the record with `id` and, best-effort, its Markdown artifact.
    ///
    /// Returns `false` (and leaves the log untouched) when no record matches.
    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let Some(pos) = records.iter().position(|r| r.id == id) else {
            debug!(id, "history delete: no such record");
            return Ok(false);
        };
        let removed = records.remove(pos);
        self.store(&records).await?;
        info!(id, input = %removed.input, "deleted history record");

        if let Some(saved) = removed.saved_path.as_deref() {
            match tokio::fs::remove_file(saved).await {
                Ok(()) => debug!(path = saved, "removed output artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = saved, error = %e, "could not remove output artifact"),
            }
        }
        Ok(true)
    }

    async fn load(&self) -> Result<Vec<HistoryRecord>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            path: self.path.clone(),
            detail: e.to_string(),
        })
    }

    /// Atomic replace: write a temp file next to the log, then rename.
    async fn store(&self, records: &[HistoryRecord]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let json = serde_json::to_vec_pretty(records)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json)
            .await
            .map_err(|source| StorageError::Write {
                path: tmp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(input: &str) -> HistoryRecord {
        HistoryRecord::new(input, format!("/outputs/{input}.md"))
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json"));
        store.append(record("a.pdf")).await.unwrap();
        store.append(record("b.png")).await.unwrap();
        let inputs: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.input)
            .collect();
        assert_eq!(inputs, ["a.pdf", "b.png"]);
    }

    #[tokio::test]
    async fn delete_unknown_id_leaves_log_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = HistoryStore::open(&path);
        store.append(record("a.pdf")).await.unwrap();
        let before = std::fs::read(&path).unwrap();
        let modified_before = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert!(!store.delete("does-not-exist").await.unwrap());

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            modified_before
        );
    }

    #[tokio::test]
    async fn delete_removes_exactly_one_record_and_its_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json"));
        let artifact = dir.path().join("b.md");
        std::fs::write(&artifact, "# b").unwrap();

        let a = record("a.pdf");
        let mut b = record("b.pdf");
        b.saved_path = Some(artifact.to_string_lossy().into_owned());
        let c = record("c.pdf");
        let b_id = b.id.clone();
        for r in [a.clone(), b, c.clone()] {
            store.append(r).await.unwrap();
        }

        assert!(store.delete(&b_id).await.unwrap());
        let remaining = store.list().await.unwrap();
        assert_eq!(remaining, vec![a, c]);
        assert!(!artifact.exists());

        assert!(!store.delete(&b_id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_survives_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.json"));
        let mut r = record("gone.pdf");
        r.saved_path = Some(dir.path().join("gone.md").to_string_lossy().into_owned());
        let id = r.id.clone();
        store.append(r).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::open(dir.path().join("history.json")));
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.append(record(&format!("f{i}.pdf"))).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let records = store.list().await.unwrap();
        assert_eq!(records.len(), 32);
        let mut ids: Vec<_> = records.iter().map(|r| r.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32, "ids must be unique");
    }

    #[tokio::test]
    async fn corrupt_log_is_an_error_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = HistoryStore::open(&path);
        assert!(matches!(
            store.append(record("a.pdf")).await,
            Err(StorageError::Corrupt { .. })
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn reads_legacy_records_without_saved_path() {
        let json = r#"[{"id":"abc","input":"x.png","output_markdown":"/outputs/x.md","original_file_url":"/uploads/x.png","timestamp":1700000000}]"#;
        let records: Vec<HistoryRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records[0].saved_path, None);
        assert_eq!(records[0].original_file_url.as_deref(), Some("/uploads/x.png"));
    }
}
