use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{AttrMap, Handle, SyncAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    /// Rejected record, logged and skipped over.
    Failure,
    /// The error that aborted the run.
    Error,
    /// Not attempted because a dependency failed.
    Skipped,
    /// Dry run.
    Planned,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObjectDiff {
    pub before: AttrMap,
    pub after: AttrMap,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncLogEntry {
    pub action: SyncAction,
    pub status: SyncStatus,
    pub entity_type: String,
    pub unique_id: String,
    pub message: String,
    pub diff: ObjectDiff,
    pub synced_object: Option<Handle>,
    pub object_repr: String,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithFailures,
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
    pub planned: usize,
}

/// Result of one run, kept in memory and returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub sync_id: Uuid,
    pub source: String,
    pub target: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub source_fingerprint: Option<String>,
    pub target_fingerprint: Option<String>,
    pub counts: SyncCounts,
    pub entries: Vec<SyncLogEntry>,
    pub error: Option<String>,
}

impl SyncSummary {
    pub fn new(source: &str, target: &str, dry_run: bool) -> Self {
        Self {
            sync_id: Uuid::new_v4(),
            source: source.to_string(),
            target: target.to_string(),
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            source_fingerprint: None,
            target_fingerprint: None,
            counts: SyncCounts::default(),
            entries: Vec::new(),
            error: None,
        }
    }

    pub fn record(&mut self, entry: SyncLogEntry) {
        let counts = &mut self.counts;
        match (entry.status, entry.action) {
            (SyncStatus::Success, SyncAction::Create) => counts.created += 1,
            (SyncStatus::Success, SyncAction::Update) => counts.updated += 1,
            (SyncStatus::Success, SyncAction::Delete) => counts.deleted += 1,
            (SyncStatus::Success, SyncAction::NoChange) => counts.unchanged += 1,
            (SyncStatus::Failure | SyncStatus::Error, _) => counts.failed += 1,
            (SyncStatus::Skipped, _) => counts.skipped += 1,
            (SyncStatus::Planned, _) => counts.planned += 1,
        }
        self.entries.push(entry);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.status = if self.counts.failed > 0 || self.counts.skipped > 0 {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        };
    }

    pub fn abort(&mut self, error: &str) {
        self.finished_at = Some(Utc::now());
        self.status = RunStatus::Aborted;
        self.error = Some(error.to_string());
    }

    pub fn entries_with(&self, status: SyncStatus) -> impl Iterator<Item = &SyncLogEntry> {
        self.entries.iter().filter(move |e| e.status == status)
    }
}
