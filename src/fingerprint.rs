//! Content fingerprinting.
//!
//! Pure functions over bytes: callers read files or fetch remote content
//! themselves and hand the bytes in.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::models::{Fingerprint, RemoteMeta, SyncRecord};

/// Hex-encoded SHA-256 of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Length in characters of a digest produced by [`digest`].
pub const DIGEST_LEN: usize = 64;

pub fn is_valid_digest(s: &str) -> bool {
    s.len() == DIGEST_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Fingerprint local file bytes.
pub fn local(bytes: &[u8], modified: Option<DateTime<Utc>>) -> Fingerprint {
    Fingerprint {
        digest: digest(bytes),
        size: bytes.len() as u64,
        modified,
        version: None,
    }
}

/// Fingerprint the content representation returned by a remote adapter.
pub fn remote(bytes: &[u8], meta: &RemoteMeta) -> Fingerprint {
    Fingerprint {
        digest: digest(bytes),
        size: bytes.len() as u64,
        modified: meta.modified,
        version: meta.version.clone(),
    }
}

/// Reuse the recorded local digest when size and mtime still match.
///
/// Returns `None` whenever a rehash is required: forced checks, missing
/// mtimes, or any metadata drift.
pub fn reuse_local(
    record: &SyncRecord,
    size: u64,
    modified: Option<DateTime<Utc>>,
    full: bool,
) -> Option<Fingerprint> {
    if full {
        return None;
    }
    let modified = modified?;
    if record.local_size != size || record.local_mtime != Some(modified) {
        return None;
    }
    Some(Fingerprint {
        digest: record.local_digest.clone(),
        size,
        modified: Some(modified),
        version: None,
    })
}

/// Reuse the recorded remote digest when the provider's version token is unchanged.
pub fn reuse_remote(record: &SyncRecord, meta: &RemoteMeta, full: bool) -> Option<Fingerprint> {
    if full || record.remote_id != meta.id {
        return None;
    }
    let version = meta.version.as_ref()?;
    if record.remote_version.as_ref() != Some(version) {
        return None;
    }
    Some(Fingerprint {
        digest: record.remote_digest.clone(),
        size: meta.size.unwrap_or_default(),
        modified: meta.modified,
        version: Some(version.clone()),
    })
}
