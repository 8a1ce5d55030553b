//! Mapping health, backup listing and restore.
//!
//! Backs `docsync status`, `docsync backups` and `docsync restore`. Nothing
//! here contacts the remote store: status is read from each mapping's state
//! container, and a restore is an ordinary local edit that the next cycle
//! propagates like any other.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::connector_fs;
use crate::fingerprint;
use crate::models::BackupSnapshot;
use crate::registry::{InvalidMapping, Mapping};
use crate::state::{BackupManager, StateStore};
use crate::sync::Binding;

/// State summary for one mapping.
#[derive(Debug, Clone)]
pub struct MappingStatus {
    pub name: String,
    pub source_root: PathBuf,
    pub target_id: String,
    pub mode: String,
    pub records: usize,
    /// Rows that exist but no longer decode; treated as never synced.
    pub unreadable: usize,
    pub last_synced: Option<DateTime<Utc>>,
}

pub async fn mapping_status(binding: &Binding) -> Result<MappingStatus> {
    let mapping: &Mapping = &binding.mapping;
    let slots = binding
        .state
        .slots()
        .await
        .with_context(|| format!("reading state of mapping '{}'", mapping.name))?;

    let mut records = 0;
    let mut unreadable = 0;
    let mut last_synced: Option<DateTime<Utc>> = None;
    for (_, slot) in &slots {
        match &slot.record {
            Some(record) => {
                records += 1;
                last_synced = last_synced.max(Some(record.synced_at));
            }
            None => unreadable += 1,
        }
    }

    Ok(MappingStatus {
        name: mapping.name.clone(),
        source_root: mapping.source_root.clone(),
        target_id: mapping.target_id.clone(),
        mode: mapping.mode.to_string(),
        records,
        unreadable,
        last_synced,
    })
}

pub fn render_status(statuses: &[MappingStatus], invalid: &[InvalidMapping]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "docsync status");
    let _ = writeln!(out, "==============");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  {:<20} {:<14} {:>8}   {:<12} {}",
        "MAPPING", "MODE", "RECORDS", "LAST SYNC", "SOURCE -> TARGET"
    );
    let _ = writeln!(out, "  {}", "-".repeat(76));
    for s in statuses {
        let last = match s.last_synced {
            Some(ts) => format_relative(ts),
            None => "never".to_string(),
        };
        let _ = writeln!(
            out,
            "  {:<20} {:<14} {:>8}   {:<12} {} -> {}",
            s.name,
            s.mode,
            s.records,
            last,
            s.source_root.display(),
            s.target_id
        );
        if s.unreadable > 0 {
            let _ = writeln!(
                out,
                "  {:<20} {} unreadable record(s), will resync",
                "", s.unreadable
            );
        }
    }

    if !invalid.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  Skipped (invalid):");
        for m in invalid {
            let _ = writeln!(out, "  {:<20} {}", m.name, m.reason);
        }
    }
    out
}

pub fn render_backups(document_id: &str, backups: &[BackupSnapshot]) -> String {
    let mut out = String::new();
    if backups.is_empty() {
        let _ = writeln!(out, "no backups for {}", document_id);
        return out;
    }
    let _ = writeln!(out, "  {:>6}   {:<20} {:>10}   {}", "ID", "CREATED", "SIZE", "DIGEST");
    for b in backups {
        let _ = writeln!(
            out,
            "  {:>6}   {:<20} {:>10}   {}",
            b.id,
            b.created_at.format("%Y-%m-%d %H:%M:%S"),
            format_bytes(b.size),
            &b.digest[..12.min(b.digest.len())]
        );
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restored {
    pub backup_id: i64,
    pub path: PathBuf,
    /// Backup taken of the content the restore replaced.
    pub replaced_backup: Option<i64>,
    /// The file already held the backup's content.
    pub unchanged: bool,
}

/// Write a backup of `document_id` back into the mapping's local tree.
///
/// Restores the most recent backup unless `backup_id` is given. The current
/// local content is itself backed up first. The sync record is left alone,
/// so the next cycle sees a local change and propagates it.
pub async fn restore(
    binding: &Binding,
    document_id: &str,
    backup_id: Option<i64>,
) -> Result<Restored> {
    let mapping = &binding.mapping;
    let state: &dyn StateStore = binding.state.as_ref();

    let snapshot = match backup_id {
        Some(id) => match state.backup(id).await? {
            Some(b) if b.document_id == document_id => b,
            Some(_) => bail!("backup {} does not belong to {}", id, document_id),
            None => bail!("backup {} not found", id),
        },
        None => match state.backups(document_id).await?.into_iter().next() {
            Some(b) => b,
            None => bail!("no backups for {} in mapping '{}'", document_id, mapping.name),
        },
    };

    let Some(path) = connector_fs::resolve(&mapping.source_root, document_id) else {
        bail!("refusing to restore outside the mapping root: {}", document_id);
    };

    let current = match connector_fs::read(&path).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    if let Some(current) = &current {
        if fingerprint::digest(current) == snapshot.digest {
            return Ok(Restored {
                backup_id: snapshot.id,
                path,
                replaced_backup: None,
                unchanged: true,
            });
        }
    }

    let replaced_backup = match &current {
        Some(current) => {
            BackupManager::new(state, mapping.backup_retention.max(1))
                .snapshot(document_id, current)
                .await?
        }
        None => None,
    };

    connector_fs::write(&path, &snapshot.content)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(document = %document_id, backup = snapshot.id, "restored backup");

    Ok(Restored {
        backup_id: snapshot.id,
        path,
        replaced_backup,
        unchanged: false,
    })
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering; older than a month falls back to a date.
fn format_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();
    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
