//! Append-only result journal with snapshot-consistent views
//!
//! Every committed entry receives the next commit id under the write lock, so
//! ids are unique and strictly increasing. Readers establish a boundary with
//! [`ExecutionJournal::begin_snapshot`] and look results up through a
//! [`ContextView`], which never observes entries committed after it.

mod scope;
mod view;

pub use scope::{Scope, ScopeSegment};
pub use view::ContextView;

use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::types::CheckResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub commit_id: u64,
    pub session_id: String,
    pub scope: Scope,
    pub check_id: String,
    pub result: CheckResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub committed_at: DateTime<Utc>,
}

impl JournalEntry {
    /// A complete entry awaiting its commit id
    pub fn new(
        session_id: impl Into<String>,
        scope: Scope,
        check_id: impl Into<String>,
        result: CheckResult,
        event: Option<String>,
    ) -> Self {
        Self {
            commit_id: 0,
            session_id: session_id.into(),
            scope,
            check_id: check_id.into(),
            result,
            event,
            committed_at: Utc::now(),
        }
    }
}

/// On-disk debug snapshot
#[derive(Debug, Serialize, Deserialize)]
pub struct JournalSnapshot {
    pub version: u32,
    pub session_id: String,
    pub entries: Vec<JournalEntry>,
}

#[derive(Debug)]
pub struct ExecutionJournal {
    session_id: String,
    entries: RwLock<Vec<JournalEntry>>,
}

impl ExecutionJournal {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<JournalEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<JournalEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current maximum commit id; 0 while the journal is empty
    pub fn begin_snapshot(&self) -> u64 {
        self.read().last().map(|e| e.commit_id).unwrap_or(0)
    }

    /// Assign the next commit id and append
    pub fn commit(&self, mut entry: JournalEntry) -> JournalEntry {
        let mut entries = self.write();
        entry.commit_id = entries.last().map(|e| e.commit_id).unwrap_or(0) + 1;
        entry.committed_at = Utc::now();
        debug!(
            "Journal commit #{} for {} at {}",
            entry.commit_id, entry.check_id, entry.scope
        );
        entries.push(entry.clone());
        entry
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.read().clone()
    }

    pub fn view(&self, scope: Scope, event: Option<String>) -> ContextView<'_> {
        ContextView::new(
            self,
            self.session_id.clone(),
            self.begin_snapshot(),
            scope,
            event,
        )
    }

    pub fn to_snapshot(&self) -> JournalSnapshot {
        JournalSnapshot {
            version: SNAPSHOT_VERSION,
            session_id: self.session_id.clone(),
            entries: self.entries(),
        }
    }

    pub async fn save_snapshot(&self, path: &Path) -> EngineResult<()> {
        let content = serde_json::to_string_pretty(&self.to_snapshot()).map_err(|e| {
            EngineError::journal(
                ErrorCode::JOURNAL_SNAPSHOT_FORMAT,
                "failed to serialize journal",
                Some(path.to_path_buf()),
            )
            .with_source(e)
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::journal(
                    ErrorCode::JOURNAL_SNAPSHOT_IO,
                    "failed to create snapshot directory",
                    Some(parent.to_path_buf()),
                )
                .with_source(e)
            })?;
        }
        tokio::fs::write(path, content).await.map_err(|e| {
            EngineError::journal(
                ErrorCode::JOURNAL_SNAPSHOT_IO,
                "failed to write journal snapshot",
                Some(path.to_path_buf()),
            )
            .with_source(e)
        })?;
        debug!("Wrote journal snapshot with {} entries to {}", self.size(), path.display());
        Ok(())
    }

    pub async fn load_snapshot(path: &Path) -> EngineResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::journal(
                ErrorCode::JOURNAL_SNAPSHOT_IO,
                "failed to read journal snapshot",
                Some(path.to_path_buf()),
            )
            .with_source(e)
        })?;
        Self::from_snapshot_str(&content).map_err(|e| match e {
            EngineError::Journal {
                code,
                message,
                source,
                ..
            } => EngineError::Journal {
                code,
                message,
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })
    }

    pub fn from_snapshot_str(content: &str) -> EngineResult<Self> {
        let snapshot: JournalSnapshot = serde_json::from_str(content).map_err(|e| {
            EngineError::journal(
                ErrorCode::JOURNAL_SNAPSHOT_FORMAT,
                "invalid journal snapshot",
                None,
            )
            .with_source(e)
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::journal(
                ErrorCode::JOURNAL_SNAPSHOT_FORMAT,
                format!(
                    "unsupported snapshot version {} (expected {})",
                    snapshot.version, SNAPSHOT_VERSION
                ),
                None,
            ));
        }
        if snapshot
            .entries
            .windows(2)
            .any(|pair| pair[0].commit_id >= pair[1].commit_id)
        {
            return Err(EngineError::journal(
                ErrorCode::JOURNAL_SNAPSHOT_FORMAT,
                "snapshot commit ids are not strictly increasing",
                None,
            ));
        }
        Ok(Self {
            session_id: snapshot.session_id,
            entries: RwLock::new(snapshot.entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry(check: &str, scope: Scope, output: serde_json::Value) -> JournalEntry {
        JournalEntry::new("s1", scope, check, CheckResult::with_output(output), None)
    }

    #[test]
    fn test_commit_ids_increase() {
        let journal = ExecutionJournal::new("s1");
        assert_eq!(journal.begin_snapshot(), 0);
        let first = journal.commit(entry("a", Scope::root(), json!(1)));
        let second = journal.commit(entry("b", Scope::root(), json!(2)));
        assert_eq!(first.commit_id, 1);
        assert_eq!(second.commit_id, 2);
        assert_eq!(journal.begin_snapshot(), 2);
        assert_eq!(journal.size(), 2);
    }

    #[test]
    fn test_concurrent_commits_get_unique_ids() {
        let journal = Arc::new(ExecutionJournal::new("s1"));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let journal = Arc::clone(&journal);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|i| {
                            journal
                                .commit(entry(&format!("c{t}"), Scope::root(), json!(i)))
                                .commit_id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 200);
        assert_eq!(journal.size(), 200);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.json");
        let journal = ExecutionJournal::new("s1");
        journal.commit(entry("a", Scope::root(), json!([1, 2])));
        journal.commit(entry("a", Scope::root().child("a", 0), json!(1)));
        journal.save_snapshot(&path).await.unwrap();

        let loaded = ExecutionJournal::load_snapshot(&path).await.unwrap();
        assert_eq!(loaded.session_id(), "s1");
        assert_eq!(loaded.entries(), journal.entries());
        let view = loaded.view(Scope::root().child("a", 0), None);
        assert_eq!(view.get("a").unwrap().result.output, Some(json!(1)));
    }

    #[test]
    fn test_snapshot_version_is_checked() {
        let err = ExecutionJournal::from_snapshot_str(
            r#"{"version": 7, "session_id": "s", "entries": []}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JOURNAL_SNAPSHOT_FORMAT);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = ExecutionJournal::load_snapshot(&dir.path().join("none.json"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::JOURNAL_SNAPSHOT_IO);
    }
}
