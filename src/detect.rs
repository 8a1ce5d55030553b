//! Change detection.
//!
//! Detection runs in two stages:
//!
//! 1. **Observe.** Enumerate the filtered local tree, the remote documents
//!    under the mapping's target and the stored sync records, then
//!    fingerprint every document id found on any of the three. Fingerprints
//!    are reused from the record when metadata proves the content unchanged
//!    (size + mtime locally, version token remotely), unless a full check is
//!    requested.
//! 2. **Classify.** [`classify`] is a pure function of the two fingerprints,
//!    the record and the mapping's sync mode.
//!
//! A read failure on either side marks that document [`Change::Failed`]; it
//! is excluded from this cycle's transfers and retried next cycle.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::io;

use crate::connector_fs::{self, LocalEntry};
use crate::error::SyncError;
use crate::fingerprint;
use crate::models::{Fingerprint, LocalDoc, RecordSlot, RemoteDoc, RemoteMeta, SyncMode, SyncRecord};
use crate::registry::Mapping;
use crate::remote::RemoteAdapter;
use crate::retry::{with_retry, RetryPolicy};
use crate::state::StateStore;

/// What has to happen to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Nothing to transfer.
    InSync,
    /// Local content moved since the record; push it.
    LocalChanged,
    /// Remote content moved since the record; pull it.
    RemoteChanged,
    /// Both sides moved to different content.
    Conflict,
    /// New local document, never synced.
    CreatedLocal,
    /// New remote document, never synced.
    CreatedRemote,
    /// Removed locally, unchanged remotely; delete the remote copy.
    DeletedLocal,
    /// Removed remotely, unchanged locally; delete the local copy.
    DeletedRemote,
    /// Gone from both sides; drop the record.
    Forget,
    /// Divergence the mapping's mode does not allow acting on.
    Skipped(String),
    /// The document could not be observed this cycle.
    Failed(String),
}

impl Change {
    /// Whether acting on this change touches either side or the record.
    pub fn needs_action(&self) -> bool {
        !matches!(self, Change::InSync | Change::Skipped(_) | Change::Failed(_))
    }
}

/// One document as observed on both sides, with its stored record.
#[derive(Debug, Clone)]
pub struct DocState {
    pub id: String,
    pub local: Option<LocalDoc>,
    pub remote: Option<RemoteDoc>,
    pub slot: RecordSlot,
    pub change: Change,
}

impl DocState {
    pub fn record(&self) -> Option<&SyncRecord> {
        self.slot.record.as_ref()
    }

    /// Remote document id, from the observation or the record.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote
            .as_ref()
            .map(|r| r.meta.id.as_str())
            .or_else(|| self.record().map(|r| r.remote_id.as_str()))
    }
}

/// Classify one document from its fingerprints and stored record.
pub fn classify(
    local: Option<&Fingerprint>,
    remote: Option<&Fingerprint>,
    record: Option<&SyncRecord>,
    mode: SyncMode,
) -> Change {
    let change = match record {
        Some(rec) => {
            let local_changed = local.map(|l| l.digest != rec.local_digest);
            let remote_changed = remote.map(|r| r.digest != rec.remote_digest);
            match (local_changed, remote_changed) {
                (Some(false), Some(false)) => Change::InSync,
                (Some(true), Some(false)) => Change::LocalChanged,
                (Some(false), Some(true)) => Change::RemoteChanged,
                (Some(true), Some(true)) => {
                    if local.map(|l| &l.digest) == remote.map(|r| &r.digest) {
                        Change::InSync
                    } else {
                        Change::Conflict
                    }
                }
                // A modification beats a deletion on the other side.
                (Some(true), None) => Change::LocalChanged,
                (Some(false), None) => Change::DeletedRemote,
                (None, Some(true)) => Change::RemoteChanged,
                (None, Some(false)) => Change::DeletedLocal,
                (None, None) => Change::Forget,
            }
        }
        None => match (local, remote) {
            (Some(l), Some(r)) if l.same_content(r) => Change::InSync,
            (Some(_), Some(_)) => Change::Conflict,
            (Some(_), None) => Change::CreatedLocal,
            (None, Some(_)) => Change::CreatedRemote,
            (None, None) => Change::Forget,
        },
    };
    project(change, mode)
}

/// Restrict a bidirectional classification to what `mode` may transfer.
fn project(change: Change, mode: SyncMode) -> Change {
    match mode {
        SyncMode::Bidirectional => change,
        SyncMode::Push => match change {
            Change::Conflict => Change::LocalChanged,
            Change::RemoteChanged | Change::CreatedRemote | Change::DeletedRemote => {
                Change::Skipped("remote change ignored in push mode".to_string())
            }
            other => other,
        },
        SyncMode::Pull => match change {
            Change::Conflict => Change::RemoteChanged,
            Change::LocalChanged | Change::CreatedLocal | Change::DeletedLocal => {
                Change::Skipped("local change ignored in pull mode".to_string())
            }
            other => other,
        },
    }
}

/// Inputs shared by every observation in one mapping's detection.
pub struct Detector<'a> {
    pub mapping: &'a Mapping,
    pub remote: &'a dyn RemoteAdapter,
    pub state: &'a dyn StateStore,
    pub parallelism: usize,
    /// Rehash everything instead of trusting metadata.
    pub full: bool,
}

/// Everything listed for one mapping, before any content is read.
pub struct Enumeration {
    sides: BTreeMap<String, Sides>,
    rejected: Vec<DocState>,
}

impl Enumeration {
    /// Number of distinct document ids found.
    pub fn len(&self) -> usize {
        self.sides.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct Sides {
    local: Option<LocalEntry>,
    remote: Option<RemoteMeta>,
    slot: RecordSlot,
}

impl<'a> Detector<'a> {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.mapping.max_retries, self.mapping.retry_delay)
    }

    /// List both sides and the stored records, keyed by document id.
    ///
    /// Failing to list either side fails the whole mapping for this cycle.
    pub async fn enumerate(&self) -> Result<Enumeration> {
        let root = self.mapping.source_root.clone();
        let filters = self.mapping.filters.clone();
        let follow = self.mapping.follow_symlinks;
        let mut locals =
            tokio::task::spawn_blocking(move || connector_fs::scan(&root, &filters, follow))
                .await
                .context("local scan task failed")??;

        let target = self.mapping.target_id.as_str();
        let remotes = with_retry(self.retry_policy(), || self.remote.list_children(target))
            .await
            .with_context(|| format!("failed to list remote target {}", target))?;

        let slots = self.state.slots().await?;

        let mut sides: BTreeMap<String, Sides> = BTreeMap::new();
        let mut rejected = Vec::new();

        for entry in std::mem::take(&mut locals.entries) {
            let id = entry.id.clone();
            sides.entry(id).or_default().local = Some(entry);
        }

        for meta in remotes {
            if !self.mapping.filters.matches(&meta.name) {
                continue;
            }
            if connector_fs::resolve(&self.mapping.source_root, &meta.name).is_none() {
                rejected.push(DocState {
                    id: meta.name.clone(),
                    local: None,
                    remote: None,
                    slot: RecordSlot::default(),
                    change: Change::Failed(SyncError::UnsafePath(meta.name).to_string()),
                });
                continue;
            }
            let slot = sides.entry(meta.name.clone()).or_default();
            if let Some(existing) = &slot.remote {
                tracing::warn!(
                    mapping = %self.mapping.name,
                    document = %meta.name,
                    kept = %existing.id,
                    ignored = %meta.id,
                    "duplicate remote document name"
                );
                continue;
            }
            slot.remote = Some(meta);
        }

        for (id, slot) in slots {
            sides.entry(id).or_default().slot = slot;
        }

        // Missing locally only because the walk could not look: unknown, not deleted.
        let blocked: Vec<String> = sides
            .iter()
            .filter(|(id, s)| s.local.is_none() && locals.is_unreadable(id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in blocked {
            if let Some(side) = sides.remove(&id) {
                tracing::warn!(
                    mapping = %self.mapping.name,
                    document = %id,
                    "local path unreadable; document left alone this cycle"
                );
                rejected.push(DocState {
                    id,
                    local: None,
                    remote: None,
                    slot: side.slot,
                    change: Change::Failed("local path could not be read".to_string()),
                });
            }
        }

        Ok(Enumeration { sides, rejected })
    }

    /// Enumerate, then observe and classify every document of the mapping.
    pub async fn detect(&self) -> Result<Vec<DocState>> {
        let listed = self.enumerate().await?;
        Ok(self.observe_all(listed).await)
    }

    /// Fingerprint and classify every enumerated document, sorted by id.
    pub async fn observe_all(&self, listed: Enumeration) -> Vec<DocState> {
        let Enumeration {
            sides,
            rejected: mut docs,
        } = listed;

        let observed: Vec<DocState> = stream::iter(sides)
            .map(|(id, sides)| self.observe(id, sides))
            .buffer_unordered(self.parallelism.max(1))
            .collect()
            .await;

        docs.extend(observed);
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    async fn observe(&self, id: String, sides: Sides) -> DocState {
        let record = sides.slot.record.as_ref();

        let local = match &sides.local {
            Some(entry) => match self.observe_local(entry, record).await {
                Ok(doc) => doc,
                Err(e) => return failed(id, sides.slot, e),
            },
            None => None,
        };

        let remote = match &sides.remote {
            Some(meta) => match self.observe_remote(meta, record).await {
                Ok(doc) => doc,
                Err(e) => return failed(id, sides.slot, e),
            },
            None => None,
        };

        let change = classify(
            local.as_ref().map(|d| &d.fingerprint),
            remote.as_ref().map(|d| &d.fingerprint),
            record,
            self.mapping.mode,
        );

        DocState {
            id,
            local,
            remote,
            slot: sides.slot,
            change,
        }
    }

    async fn observe_local(
        &self,
        entry: &LocalEntry,
        record: Option<&SyncRecord>,
    ) -> Result<Option<LocalDoc>, SyncError> {
        if let Some(fp) =
            record.and_then(|r| fingerprint::reuse_local(r, entry.size, entry.modified, self.full))
        {
            return Ok(Some(LocalDoc {
                id: entry.id.clone(),
                path: entry.path.clone(),
                fingerprint: fp,
                content: None,
            }));
        }

        let path = entry.path.as_path();
        let read = with_retry(self.retry_policy(), || async move {
            connector_fs::read(path)
                .await
                .map_err(|e| SyncError::local(path, e))
        })
        .await;

        match read {
            Ok(bytes) => Ok(Some(LocalDoc {
                id: entry.id.clone(),
                path: entry.path.clone(),
                fingerprint: fingerprint::local(&bytes, entry.modified),
                content: Some(bytes),
            })),
            // Removed between the scan and the read.
            Err(SyncError::Local { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn observe_remote(
        &self,
        meta: &RemoteMeta,
        record: Option<&SyncRecord>,
    ) -> Result<Option<RemoteDoc>, SyncError> {
        if self.remote.capabilities().stable_versions {
            if let Some(fp) = record.and_then(|r| fingerprint::reuse_remote(r, meta, self.full)) {
                return Ok(Some(RemoteDoc {
                    meta: meta.clone(),
                    fingerprint: fp,
                    content: None,
                }));
            }
        }

        let fetched = with_retry(self.retry_policy(), || self.remote.fetch(&meta.id)).await?;
        Ok(fetched.map(|c| RemoteDoc {
            fingerprint: fingerprint::remote(&c.content, &c.meta),
            meta: c.meta,
            content: Some(c.content),
        }))
    }

    /// Observe one document again from scratch, bypassing every metadata
    /// shortcut. Used after the remote rejected an update as stale.
    pub async fn redetect(&self, doc: &DocState) -> DocState {
        let slot = match self.state.slot(&doc.id).await {
            Ok(slot) => slot,
            Err(e) => return failed(doc.id.clone(), doc.slot.clone(), SyncError::state(e)),
        };

        let local = match connector_fs::resolve(&self.mapping.source_root, &doc.id) {
            Some(path) => match connector_fs::stat(&path).await {
                Ok(Some((size, modified))) => Some(LocalEntry {
                    id: doc.id.clone(),
                    path,
                    size,
                    modified,
                }),
                Ok(None) => None,
                Err(e) => return failed(doc.id.clone(), slot, SyncError::local(path, e)),
            },
            None => {
                return failed(doc.id.clone(), slot, SyncError::UnsafePath(doc.id.clone()));
            }
        };

        let remote = match doc.remote_id() {
            Some(remote_id) => {
                match with_retry(self.retry_policy(), || self.remote.fetch(remote_id)).await {
                    Ok(Some(content)) => Some(content.meta),
                    Ok(None) => None,
                    Err(e) => return failed(doc.id.clone(), slot, e.into()),
                }
            }
            None => None,
        };

        let fresh = Detector {
            full: true,
            ..*self
        };
        fresh
            .observe(
                doc.id.clone(),
                Sides {
                    local,
                    remote,
                    slot,
                },
            )
            .await
    }
}

fn failed(id: String, slot: RecordSlot, err: SyncError) -> DocState {
    tracing::warn!(document = %id, error = %err, "failed to observe document");
    DocState {
        id,
        local: None,
        remote: None,
        slot,
        change: Change::Failed(err.to_string()),
    }
}
