//! Core data models used throughout docsync.
//!
//! These types describe documents as seen from each side of a mapping, the
//! fingerprints used to detect change, and the records persisted once a
//! document is known to be in sync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Direction(s) in which a mapping is allowed to transfer content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Local and remote changes are both propagated.
    #[default]
    Bidirectional,
    /// Local → remote only.
    #[serde(alias = "upload_only")]
    Push,
    /// Remote → local only.
    #[serde(alias = "download_only")]
    Pull,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncMode::Bidirectional => "bidirectional",
            SyncMode::Push => "push",
            SyncMode::Pull => "pull",
        };
        f.write_str(s)
    }
}

/// Content digest plus advisory metadata.
///
/// Two fingerprints are equal iff their digests match; `size`, `modified`
/// and `version` only serve to skip expensive reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Lowercase hex SHA-256 of the content bytes.
    pub digest: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Remote version token, when the provider exposes one.
    pub version: Option<String>,
}

impl Fingerprint {
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        self.digest == other.digest
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.same_content(other)
    }
}

impl Eq for Fingerprint {}

/// A local file under a mapping root.
#[derive(Debug, Clone)]
pub struct LocalDoc {
    /// Relative path with `/` separators; the document's logical id.
    pub id: String,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    /// Bytes read while fingerprinting, if the file was actually hashed.
    pub content: Option<Vec<u8>>,
}

/// Metadata the remote store reports for a document without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMeta {
    /// Provider-assigned identifier (page id, row id).
    pub id: String,
    /// Human name of the document; docsync stores the logical id here.
    pub name: String,
    pub version: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

/// A remote document together with its content representation.
#[derive(Debug, Clone)]
pub struct RemoteContent {
    pub meta: RemoteMeta,
    pub content: Vec<u8>,
}

/// A remote document as observed by the change detector.
#[derive(Debug, Clone)]
pub struct RemoteDoc {
    pub meta: RemoteMeta,
    pub fingerprint: Fingerprint,
    pub content: Option<Vec<u8>>,
}

/// The last fingerprint pair known to be synchronized for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRecord {
    pub local_digest: String,
    pub local_size: u64,
    pub local_mtime: Option<DateTime<Utc>>,
    pub remote_id: String,
    pub remote_digest: String,
    pub remote_version: Option<String>,
    pub synced_at: DateTime<Utc>,
    /// Most recent backup taken while applying the transfer that produced this record.
    pub backup_ref: Option<i64>,
}

/// A stored record together with its compare-and-swap revision.
///
/// `record` is `None` when the row exists but could not be decoded; the
/// revision is still reported so the slot can be overwritten safely.
#[derive(Debug, Clone, Default)]
pub struct RecordSlot {
    pub revision: Option<i64>,
    pub record: Option<SyncRecord>,
}

/// Immutable copy of a document's prior local content.
#[derive(Debug, Clone, Serialize)]
pub struct BackupSnapshot {
    pub id: i64,
    pub document_id: String,
    pub digest: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub content: Vec<u8>,
}
