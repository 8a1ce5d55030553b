//! Sync reports.
//!
//! A [`SyncReport`] is the ephemeral result of one cycle: one entry per
//! document with its outcome and a short detail, grouped by mapping.
//! Producing or printing a report never touches the remote store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use crate::sync::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Synced,
    Skipped,
    ConflictResolved,
    ConflictDeferred,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub document_id: String,
    pub outcome: Outcome,
    pub detail: String,
}

impl ReportEntry {
    pub fn new(document_id: impl Into<String>, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            outcome,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub synced: usize,
    pub skipped: usize,
    pub conflict_resolved: usize,
    pub conflict_deferred: usize,
    pub failed: usize,
}

impl Counts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Synced => self.synced += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::ConflictResolved => self.conflict_resolved += 1,
            Outcome::ConflictDeferred => self.conflict_deferred += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: Counts) {
        self.synced += other.synced;
        self.skipped += other.skipped;
        self.conflict_resolved += other.conflict_resolved;
        self.conflict_deferred += other.conflict_deferred;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.synced + self.skipped + self.conflict_resolved + self.conflict_deferred + self.failed
    }
}

/// Result of one mapping's cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MappingReport {
    pub mapping: String,
    /// `idle` after a completed cycle, `error` if the mapping failed as a whole.
    pub phase: Phase,
    pub error: Option<String>,
    pub dry_run: bool,
    pub entries: Vec<ReportEntry>,
}

impl MappingReport {
    pub fn new(mapping: impl Into<String>, dry_run: bool) -> Self {
        Self {
            mapping: mapping.into(),
            phase: Phase::Idle,
            error: None,
            dry_run,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ReportEntry) {
        self.entries.push(entry);
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts::default();
        for entry in &self.entries {
            counts.add(entry.outcome);
        }
        counts
    }

    pub fn entry(&self, document_id: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.document_id == document_id)
    }

    pub fn outcome(&self, document_id: &str) -> Option<Outcome> {
        self.entry(document_id).map(|e| e.outcome)
    }

    pub fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.document_id.cmp(&b.document_id));
    }
}

/// Result of one orchestration run over several mappings.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mappings: Vec<MappingReport>,
    pub counts: Counts,
}

impl SyncReport {
    pub fn new(started_at: DateTime<Utc>, mut mappings: Vec<MappingReport>) -> Self {
        mappings.sort_by(|a, b| a.mapping.cmp(&b.mapping));
        let mut counts = Counts::default();
        for m in &mappings {
            counts.merge(m.counts());
        }
        Self {
            started_at,
            finished_at: Utc::now(),
            mappings,
            counts,
        }
    }

    pub fn mapping(&self, name: &str) -> Option<&MappingReport> {
        self.mappings.iter().find(|m| m.mapping == name)
    }

    /// Any failed document or failed mapping.
    pub fn has_failures(&self) -> bool {
        self.counts.failed > 0 || self.mappings.iter().any(|m| m.error.is_some())
    }

    /// Plain-text rendering for the terminal. Unchanged documents are
    /// summarized in the counts only.
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        for m in &self.mappings {
            let suffix = if m.dry_run { " (dry-run)" } else { "" };
            let _ = writeln!(out, "sync {}{}", m.mapping, suffix);
            if let Some(err) = &m.error {
                let _ = writeln!(out, "  error: {}", err);
            }
            for e in &m.entries {
                if e.outcome == Outcome::Skipped && e.detail == crate::sync::UNCHANGED {
                    continue;
                }
                let _ = writeln!(
                    out,
                    "  {:<18} {}  {}",
                    outcome_label(e.outcome),
                    e.document_id,
                    e.detail
                );
            }
            let c = m.counts();
            let _ = writeln!(
                out,
                "  synced: {}, skipped: {}, conflicts resolved: {}, conflicts deferred: {}, failed: {}",
                c.synced, c.skipped, c.conflict_resolved, c.conflict_deferred, c.failed
            );
        }
        out.push_str(if self.has_failures() { "completed with failures\n" } else { "ok\n" });
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Synced => "synced",
        Outcome::Skipped => "skipped",
        Outcome::ConflictResolved => "conflict-resolved",
        Outcome::ConflictDeferred => "conflict-deferred",
        Outcome::Failed => "failed",
    }
}
