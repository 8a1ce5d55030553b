//! Sync orchestration.
//!
//! The [`Orchestrator`] drives one reconciliation cycle over a set of
//! mappings. Each mapping walks the phases
//!
//! ```text
//! idle → enumerating → detecting → resolving → applying → committing → idle
//! ```
//!
//! and drops to `error` if it cannot enumerate. That failure is recorded in
//! its [`MappingReport`] and leaves the other mappings untouched.
//!
//! # Applying
//!
//! Documents of one mapping are applied concurrently, up to
//! `sync.parallelism`. Each apply is at-least-once with idempotent effect.
//! Content already present on the destination is not transferred again, and
//! every transient failure is retried with the mapping's backoff policy. A
//! document that still fails is reported as failed. Its sync record is left
//! alone, so it is detected again next cycle.
//!
//! If the remote store rejects an update because the document moved since
//! it was observed, the document is detected again and re-planned once. It
//! is never retried with the stale payload.
//!
//! # Committing
//!
//! Sync records are written only after their transfer is confirmed, in a
//! batch at the end of the mapping's cycle. Every write is a compare-and-swap
//! on the revision read during detection. When the swap loses, the document
//! is reported as failed and re-detected next cycle.
//!
//! # Cancellation
//!
//! Once the [`CancellationToken`] is cancelled no new document apply starts.
//! Applies already in flight run to completion and are committed normally.

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::Instrument;

use crate::config::SyncConfig;
use crate::connector_fs;
use crate::db;
use crate::detect::{Change, DocState, Detector};
use crate::error::SyncError;
use crate::fingerprint;
use crate::models::{Fingerprint, RemoteContent, RemoteMeta, SyncRecord};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::registry::Mapping;
use crate::remote::{RemoteAdapter, RemoteError};
use crate::report::{MappingReport, Outcome, ReportEntry, SyncReport};
use crate::resolve::{self, ConflictResolver, Resolution};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::{BackupManager, SqliteStateStore, StateStore};

/// Report detail of documents that needed no transfer.
pub const UNCHANGED: &str = "unchanged";

/// Where a mapping is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Enumerating,
    Detecting,
    Resolving,
    Applying,
    Committing,
    Error,
}

/// Cooperative cancellation shared by every task of a cycle.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub parallelism: usize,
    pub max_concurrent_mappings: usize,
    pub clock_skew_secs: u64,
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            parallelism: config.parallelism,
            max_concurrent_mappings: config.max_concurrent_mappings,
            clock_skew_secs: config.clock_skew_secs,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Rehash every document instead of trusting size/mtime and version tokens.
    pub full: bool,
    /// Detect and resolve only; nothing is transferred or committed.
    pub dry_run: bool,
}

/// A mapping together with its state store.
#[derive(Clone)]
pub struct Binding {
    pub mapping: Mapping,
    pub state: Arc<dyn StateStore>,
}

impl Binding {
    /// Open the mapping's SQLite state under `state_dir`.
    pub async fn open(state_dir: &Path, mapping: Mapping) -> Result<Self> {
        let path = db::state_path(state_dir, &mapping.name);
        let state = SqliteStateStore::open(&path).await?;
        Ok(Self {
            mapping,
            state: Arc::new(state),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Local content to the remote store (update, or create if absent).
    Push,
    /// Remote content to the local tree.
    Pull,
    DeleteRemote,
    DeleteLocal,
    /// Drop the record of a document gone from both sides.
    Forget,
    /// Both sides already agree; store the current fingerprints.
    Refresh,
}

impl Action {
    fn verb(self) -> &'static str {
        match self {
            Action::Push => "push",
            Action::Pull => "pull",
            Action::DeleteRemote => "delete remote",
            Action::DeleteLocal => "delete local",
            Action::Forget => "forget",
            Action::Refresh => "refresh record",
        }
    }
}

struct Planned {
    doc: DocState,
    action: Action,
    resolution: Option<Resolution>,
}

enum Plan {
    Act(Planned),
    Done(ReportEntry),
}

enum Commit {
    Put {
        id: String,
        expected: Option<i64>,
        record: SyncRecord,
    },
    Delete {
        id: String,
        expected: Option<i64>,
    },
}

struct Applied {
    entry: ReportEntry,
    commit: Option<Commit>,
}

/// Per-mapping collaborators handed to every document apply.
struct MappingCtx<'a> {
    mapping: &'a Mapping,
    state: &'a dyn StateStore,
    detector: Detector<'a>,
    resolver: &'a dyn ConflictResolver,
}

impl MappingCtx<'_> {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.mapping.max_retries, self.mapping.retry_delay)
    }
}

pub struct Orchestrator {
    remote: Arc<dyn RemoteAdapter>,
    settings: SyncSettings,
    progress: Arc<dyn SyncProgressReporter>,
}

impl Orchestrator {
    pub fn new(remote: Arc<dyn RemoteAdapter>, settings: SyncSettings) -> Self {
        Self {
            remote,
            settings,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Run one cycle over every binding, up to `max_concurrent_mappings` at a time.
    pub async fn run_cycle(
        &self,
        bindings: &[Binding],
        cancel: &CancellationToken,
        options: SyncOptions,
    ) -> SyncReport {
        let started_at = Utc::now();
        let reports: Vec<MappingReport> = stream::iter(bindings)
            .map(|binding| self.sync_mapping(binding, cancel, options))
            .buffer_unordered(self.settings.max_concurrent_mappings.max(1))
            .collect()
            .await;
        SyncReport::new(started_at, reports)
    }

    /// Run one mapping's cycle. Never fails: problems land in the report.
    pub async fn sync_mapping(
        &self,
        binding: &Binding,
        cancel: &CancellationToken,
        options: SyncOptions,
    ) -> MappingReport {
        let span = tracing::info_span!("mapping", name = %binding.mapping.name);
        self.sync_mapping_inner(binding, cancel, options)
            .instrument(span)
            .await
    }

    async fn sync_mapping_inner(
        &self,
        binding: &Binding,
        cancel: &CancellationToken,
        options: SyncOptions,
    ) -> MappingReport {
        let mapping = &binding.mapping;
        let mut report = MappingReport::new(&mapping.name, options.dry_run);
        let mut phase = Phase::Idle;

        if cancel.is_cancelled() {
            tracing::info!("cancelled before start");
            return report;
        }

        let resolver = resolve::for_policy(
            mapping.conflict_policy,
            self.remote.capabilities(),
            self.settings.clock_skew_secs,
        );
        let ctx = MappingCtx {
            mapping,
            state: binding.state.as_ref(),
            detector: Detector {
                mapping,
                remote: self.remote.as_ref(),
                state: binding.state.as_ref(),
                parallelism: self.settings.parallelism,
                full: options.full,
            },
            resolver: resolver.as_ref(),
        };

        advance(&mut phase, Phase::Enumerating);
        self.progress.report(SyncProgressEvent::Discovering {
            mapping: mapping.name.clone(),
        });
        let listed = match ctx.detector.enumerate().await {
            Ok(listed) => listed,
            Err(e) => {
                advance(&mut phase, Phase::Error);
                tracing::error!(error = %format!("{:#}", e), "enumeration failed");
                report.phase = Phase::Error;
                report.error = Some(format!("{:#}", e));
                return report;
            }
        };

        advance(&mut phase, Phase::Detecting);
        let docs = ctx.detector.observe_all(listed).await;
        let total = docs.len();

        advance(&mut phase, Phase::Resolving);
        let mut planned = Vec::new();
        for doc in docs {
            match plan(doc, ctx.resolver) {
                Plan::Act(p) => planned.push(p),
                Plan::Done(entry) => report.push(entry),
            }
        }
        self.progress.report(SyncProgressEvent::Detected {
            mapping: mapping.name.clone(),
            total: total as u64,
            pending: planned.iter().filter(|p| p.action != Action::Refresh).count() as u64,
        });

        if options.dry_run {
            for p in planned {
                report.push(dry_run_entry(&p));
            }
            report.sort();
            advance(&mut phase, Phase::Idle);
            return report;
        }

        advance(&mut phase, Phase::Applying);
        let pending = planned.len() as u64;
        let mut applied = Vec::with_capacity(planned.len());
        let mut applying = stream::iter(planned)
            .map(|p| self.apply_document(&ctx, p, cancel))
            .buffer_unordered(self.settings.parallelism.max(1));
        let mut n = 0u64;
        while let Some(result) = applying.next().await {
            n += 1;
            self.progress.report(SyncProgressEvent::Applying {
                mapping: mapping.name.clone(),
                n,
                total: pending,
            });
            applied.push(result);
        }
        drop(applying);

        advance(&mut phase, Phase::Committing);
        for Applied { mut entry, commit } in applied {
            if let Some(commit) = commit {
                match apply_commit(ctx.state, commit).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(document = %entry.document_id, "sync record changed concurrently");
                        entry.outcome = Outcome::Failed;
                        entry.detail =
                            "sync record changed concurrently; re-detected next cycle".to_string();
                    }
                    Err(e) => {
                        tracing::warn!(document = %entry.document_id, error = %format!("{:#}", e), "commit failed");
                        entry.outcome = Outcome::Failed;
                        entry.detail = format!("state store: {:#}", e);
                    }
                }
            }
            report.push(entry);
        }

        report.sort();
        advance(&mut phase, Phase::Idle);
        let counts = report.counts();
        tracing::info!(
            synced = counts.synced,
            conflicts_resolved = counts.conflict_resolved,
            conflicts_deferred = counts.conflict_deferred,
            failed = counts.failed,
            "cycle complete"
        );
        report
    }

    async fn apply_document(
        &self,
        ctx: &MappingCtx<'_>,
        planned: Planned,
        cancel: &CancellationToken,
    ) -> Applied {
        if planned.action != Action::Refresh && cancel.is_cancelled() {
            return Applied {
                entry: ReportEntry::new(&planned.doc.id, Outcome::Skipped, "cancelled"),
                commit: None,
            };
        }

        let mut planned = planned;
        let mut redetected = false;
        loop {
            match self.execute(ctx, &planned).await {
                Ok((detail, commit)) => {
                    tracing::info!(
                        document = %planned.doc.id,
                        action = planned.action.verb(),
                        "applied"
                    );
                    return Applied {
                        entry: entry_for(&planned, detail),
                        commit: Some(commit),
                    };
                }
                Err(e) if e.is_version_conflict() && !redetected => {
                    tracing::info!(document = %planned.doc.id, "remote moved during apply, re-detecting");
                    redetected = true;
                    let doc = ctx.detector.redetect(&planned.doc).await;
                    match plan(doc, ctx.resolver) {
                        Plan::Act(next) => planned = next,
                        Plan::Done(entry) => {
                            return Applied {
                                entry,
                                commit: None,
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(document = %planned.doc.id, error = %e, "apply failed");
                    return Applied {
                        entry: ReportEntry::new(&planned.doc.id, Outcome::Failed, e.to_string()),
                        commit: None,
                    };
                }
            }
        }
    }

    async fn execute(
        &self,
        ctx: &MappingCtx<'_>,
        planned: &Planned,
    ) -> Result<(String, Commit), SyncError> {
        let doc = &planned.doc;
        let expected = doc.slot.revision;
        match planned.action {
            Action::Push => {
                let (detail, record) = self.push(ctx, doc).await?;
                Ok((detail, put(doc, expected, record)))
            }
            Action::Pull => {
                let (detail, record) = self.pull(ctx, doc).await?;
                Ok((detail, put(doc, expected, record)))
            }
            Action::DeleteRemote => {
                if let Some(remote_id) = doc.remote_id() {
                    let deleted =
                        with_retry(ctx.retry_policy(), || self.remote.delete(remote_id)).await;
                    match deleted {
                        Ok(()) | Err(RemoteError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok((
                    "deleted remote".to_string(),
                    Commit::Delete {
                        id: doc.id.clone(),
                        expected,
                    },
                ))
            }
            Action::DeleteLocal => {
                let path = local_path(ctx.mapping, &doc.id)?;
                let content = read_local(ctx, doc, &path).await?;
                BackupManager::new(ctx.state, ctx.mapping.backup_retention)
                    .snapshot(&doc.id, &content)
                    .await
                    .map_err(SyncError::state)?;
                let target = path.as_path();
                with_retry(ctx.retry_policy(), || async move {
                    connector_fs::remove(target)
                        .await
                        .map_err(|e| SyncError::local(target, e))
                })
                .await?;
                Ok((
                    "deleted local".to_string(),
                    Commit::Delete {
                        id: doc.id.clone(),
                        expected,
                    },
                ))
            }
            Action::Forget => Ok((
                "removed on both sides".to_string(),
                Commit::Delete {
                    id: doc.id.clone(),
                    expected,
                },
            )),
            Action::Refresh => {
                let (Some(local), Some(remote)) = (&doc.local, &doc.remote) else {
                    return Err(SyncError::State(format!(
                        "cannot refresh {} without both sides",
                        doc.id
                    )));
                };
                let record = SyncRecord {
                    local_digest: local.fingerprint.digest.clone(),
                    local_size: local.fingerprint.size,
                    local_mtime: local.fingerprint.modified,
                    remote_id: remote.meta.id.clone(),
                    remote_digest: remote.fingerprint.digest.clone(),
                    remote_version: remote.meta.version.clone(),
                    synced_at: Utc::now(),
                    backup_ref: doc.record().and_then(|r| r.backup_ref),
                };
                Ok((UNCHANGED.to_string(), put(doc, expected, record)))
            }
        }
    }

    /// Send local content to the remote store and confirm what it now holds.
    async fn push(&self, ctx: &MappingCtx<'_>, doc: &DocState) -> Result<(String, SyncRecord), SyncError> {
        let path = local_path(ctx.mapping, &doc.id)?;
        let content = read_local(ctx, doc, &path).await?;
        let modified = doc.local.as_ref().and_then(|l| l.fingerprint.modified);
        let local_fp = fingerprint::local(&content, modified);
        let policy = ctx.retry_policy();
        let bytes = content.as_slice();

        let (detail, meta) = match &doc.remote {
            Some(remote) if remote.fingerprint.same_content(&local_fp) => {
                ("remote already up to date".to_string(), remote.meta.clone())
            }
            Some(remote) => {
                let id = remote.meta.id.as_str();
                let version = remote.meta.version.as_deref();
                let meta =
                    with_retry(policy, || self.remote.update(id, bytes, version)).await?;
                ("pushed".to_string(), meta)
            }
            None => {
                let target = ctx.mapping.target_id.as_str();
                let name = doc.id.as_str();
                let attempted = AtomicBool::new(false);
                let meta = with_retry(policy, || {
                    self.create_once(target, name, bytes, &attempted)
                })
                .await?;
                ("created remote".to_string(), meta)
            }
        };

        // Providers that transform content are read back so the record holds
        // the digest of what the remote store will report next cycle.
        let (remote_digest, meta) = if self.remote.capabilities().verbatim_content {
            (local_fp.digest.clone(), meta)
        } else {
            let id = meta.id.as_str();
            let fetched: RemoteContent = with_retry(policy, || self.remote.fetch(id))
                .await?
                .ok_or_else(|| RemoteError::NotFound(meta.id.clone()))?;
            (fingerprint::digest(&fetched.content), fetched.meta)
        };

        let record = SyncRecord {
            local_digest: local_fp.digest,
            local_size: local_fp.size,
            local_mtime: local_fp.modified,
            remote_id: meta.id,
            remote_digest,
            remote_version: meta.version,
            synced_at: Utc::now(),
            backup_ref: doc.record().and_then(|r| r.backup_ref),
        };
        Ok((detail, record))
    }

    /// Create `name` under `target`. A repeated attempt first looks for the
    /// page an earlier attempt may have created before its acknowledgement
    /// was lost, and overwrites that page instead of creating a second one.
    async fn create_once(
        &self,
        target: &str,
        name: &str,
        content: &[u8],
        attempted: &AtomicBool,
    ) -> Result<RemoteMeta, RemoteError> {
        if attempted.swap(true, Ordering::SeqCst) {
            let existing = self
                .remote
                .list_children(target)
                .await?
                .into_iter()
                .find(|meta| meta.name == name);
            if let Some(meta) = existing {
                tracing::info!(
                    document = %name,
                    remote_id = %meta.id,
                    "adopting page left by an unacknowledged create"
                );
                return self
                    .remote
                    .update(&meta.id, content, meta.version.as_deref())
                    .await;
            }
        }
        self.remote.create(target, name, content).await
    }

    /// Write remote content into the local tree, backing up what it replaces.
    async fn pull(&self, ctx: &MappingCtx<'_>, doc: &DocState) -> Result<(String, SyncRecord), SyncError> {
        let path = local_path(ctx.mapping, &doc.id)?;
        let policy = ctx.retry_policy();

        let (remote_fp, meta, content) = match &doc.remote {
            Some(remote) if remote.content.is_some() => (
                remote.fingerprint.clone(),
                remote.meta.clone(),
                remote.content.clone().unwrap_or_default(),
            ),
            Some(remote) => {
                let id = remote.meta.id.as_str();
                let fetched = with_retry(policy, || self.remote.fetch(id))
                    .await?
                    .ok_or_else(|| RemoteError::NotFound(remote.meta.id.clone()))?;
                (
                    fingerprint::remote(&fetched.content, &fetched.meta),
                    fetched.meta,
                    fetched.content,
                )
            }
            None => {
                return Err(RemoteError::NotFound(format!("no remote document for {}", doc.id)).into())
            }
        };

        let incoming: Fingerprint = fingerprint::local(&content, None);
        let mut backup_ref = doc.record().and_then(|r| r.backup_ref);
        let detail = match &doc.local {
            Some(local) if local.fingerprint.same_content(&incoming) => {
                "local already up to date".to_string()
            }
            Some(_) => {
                let current = read_local(ctx, doc, &path).await?;
                if let Some(id) = BackupManager::new(ctx.state, ctx.mapping.backup_retention)
                    .snapshot(&doc.id, &current)
                    .await
                    .map_err(SyncError::state)?
                {
                    backup_ref = Some(id);
                }
                write_local(policy, &path, &content).await?;
                "pulled".to_string()
            }
            None => {
                write_local(policy, &path, &content).await?;
                "created local".to_string()
            }
        };

        let (size, modified) = connector_fs::stat(&path)
            .await
            .map_err(|e| SyncError::local(&path, e))?
            .unwrap_or((content.len() as u64, None));

        let record = SyncRecord {
            local_digest: incoming.digest,
            local_size: size,
            local_mtime: modified,
            remote_id: meta.id,
            remote_digest: remote_fp.digest,
            remote_version: meta.version,
            synced_at: Utc::now(),
            backup_ref,
        };
        Ok((detail, record))
    }
}

fn advance(phase: &mut Phase, next: Phase) {
    tracing::debug!(from = ?*phase, to = ?next, "phase");
    *phase = next;
}

/// Decide what to do with one detected document.
fn plan(doc: DocState, resolver: &dyn ConflictResolver) -> Plan {
    let (action, resolution) = match &doc.change {
        Change::InSync => {
            if needs_refresh(&doc) {
                (Action::Refresh, None)
            } else {
                return Plan::Done(ReportEntry::new(&doc.id, Outcome::Skipped, UNCHANGED));
            }
        }
        Change::Skipped(reason) => {
            return Plan::Done(ReportEntry::new(&doc.id, Outcome::Skipped, reason.clone()))
        }
        Change::Failed(reason) => {
            return Plan::Done(ReportEntry::new(&doc.id, Outcome::Failed, reason.clone()))
        }
        Change::LocalChanged | Change::CreatedLocal => (Action::Push, None),
        Change::RemoteChanged | Change::CreatedRemote => (Action::Pull, None),
        Change::DeletedLocal => (Action::DeleteRemote, None),
        Change::DeletedRemote => (Action::DeleteLocal, None),
        Change::Forget => (Action::Forget, None),
        Change::Conflict => {
            let (Some(local), Some(remote)) = (&doc.local, &doc.remote) else {
                return Plan::Done(ReportEntry::new(
                    &doc.id,
                    Outcome::Failed,
                    "conflict without both sides observed",
                ));
            };
            match resolver.resolve(&local.fingerprint, &remote.fingerprint) {
                Resolution::TakeLocal => (Action::Push, Some(Resolution::TakeLocal)),
                Resolution::TakeRemote => (Action::Pull, Some(Resolution::TakeRemote)),
                Resolution::Defer => {
                    tracing::info!(document = %doc.id, "conflict deferred");
                    return Plan::Done(ReportEntry::new(
                        &doc.id,
                        Outcome::ConflictDeferred,
                        "changed on both sides",
                    ));
                }
            }
        }
    };
    Plan::Act(Planned {
        doc,
        action,
        resolution,
    })
}

/// Whether an in-sync document's record is missing or stale.
fn needs_refresh(doc: &DocState) -> bool {
    let (Some(local), Some(remote)) = (&doc.local, &doc.remote) else {
        return false;
    };
    match doc.record() {
        None => true,
        Some(rec) => {
            rec.local_digest != local.fingerprint.digest
                || rec.local_size != local.fingerprint.size
                || rec.local_mtime != local.fingerprint.modified
                || rec.remote_id != remote.meta.id
                || rec.remote_digest != remote.fingerprint.digest
                || rec.remote_version != remote.meta.version
        }
    }
}

fn entry_for(planned: &Planned, detail: String) -> ReportEntry {
    let id = &planned.doc.id;
    match (planned.action, planned.resolution) {
        (Action::Refresh, _) => ReportEntry::new(id, Outcome::Skipped, UNCHANGED),
        (_, Some(Resolution::TakeLocal)) => {
            ReportEntry::new(id, Outcome::ConflictResolved, format!("kept local: {}", detail))
        }
        (_, Some(Resolution::TakeRemote)) => {
            ReportEntry::new(id, Outcome::ConflictResolved, format!("kept remote: {}", detail))
        }
        _ => ReportEntry::new(id, Outcome::Synced, detail),
    }
}

fn dry_run_entry(planned: &Planned) -> ReportEntry {
    if planned.action == Action::Refresh {
        return ReportEntry::new(&planned.doc.id, Outcome::Skipped, UNCHANGED);
    }
    let detail = match planned.resolution {
        Some(Resolution::TakeLocal) => format!("dry-run: would {} (conflict, kept local)", planned.action.verb()),
        Some(Resolution::TakeRemote) => format!("dry-run: would {} (conflict, kept remote)", planned.action.verb()),
        _ => format!("dry-run: would {}", planned.action.verb()),
    };
    ReportEntry::new(&planned.doc.id, Outcome::Skipped, detail)
}

fn put(doc: &DocState, expected: Option<i64>, record: SyncRecord) -> Commit {
    Commit::Put {
        id: doc.id.clone(),
        expected,
        record,
    }
}

async fn apply_commit(state: &dyn StateStore, commit: Commit) -> Result<bool> {
    match commit {
        Commit::Put {
            id,
            expected,
            record,
        } => state.compare_and_put(&id, expected, &record).await,
        Commit::Delete { id, expected } => match expected {
            Some(_) => state.compare_and_delete(&id, expected).await,
            None => Ok(true),
        },
    }
}

fn local_path(mapping: &Mapping, id: &str) -> Result<std::path::PathBuf, SyncError> {
    connector_fs::resolve(&mapping.source_root, id).ok_or_else(|| SyncError::UnsafePath(id.to_string()))
}

/// Bytes of the local document, from the detection read or from disk.
async fn read_local(ctx: &MappingCtx<'_>, doc: &DocState, path: &Path) -> Result<Vec<u8>, SyncError> {
    if let Some(content) = doc.local.as_ref().and_then(|l| l.content.clone()) {
        return Ok(content);
    }
    with_retry(ctx.retry_policy(), || async move {
        connector_fs::read(path)
            .await
            .map_err(|e| SyncError::local(path, e))
    })
    .await
}

async fn write_local(policy: RetryPolicy, path: &Path, content: &[u8]) -> Result<(), SyncError> {
    with_retry(policy, || async move {
        connector_fs::write(path, content)
            .await
            .map_err(|e| SyncError::local(path, e))
    })
    .await
}
