//! Local filesystem side of a mapping.
//!
//! Scans a mapping root with `walkdir`, applying the mapping's filters to
//! each file's relative path, and performs the reads and writes the
//! orchestrator needs. Writes go through a temporary sibling file that is
//! fsynced and renamed into place, so a write is durable once it returns and
//! a crash never leaves a half-written document behind.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::registry::Filters;

/// Suffix of in-flight temporary files; never treated as documents.
pub const TMP_SUFFIX: &str = ".docsync-tmp";

/// A file found under a mapping root, before its content is read.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Files found under a mapping root, plus the paths that could not be read.
#[derive(Debug, Default)]
pub struct LocalScan {
    pub entries: Vec<LocalEntry>,
    /// Relative paths (`/`-separated) the walk could not enter or stat.
    pub unreadable: Vec<String>,
}

impl LocalScan {
    /// Whether `id` is, or lies under, a path the scan could not read. The
    /// absence of such a document says nothing about whether it was deleted.
    pub fn is_unreadable(&self, id: &str) -> bool {
        self.unreadable.iter().any(|p| {
            id == p
                || id
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// List every file under `root` accepted by `filters`, sorted by id.
///
/// Unreadable entries below the root are logged and collected in
/// [`LocalScan::unreadable`]; only an unreadable root fails the scan.
pub fn scan(root: &Path, filters: &Filters, follow_symlinks: bool) -> Result<LocalScan> {
    if !root.exists() {
        bail!("mapping root does not exist: {}", root.display());
    }

    let mut scan = LocalScan::default();

    let walker = WalkDir::new(root).follow_links(follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let relative = e
                    .path()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(document_id)
                    .filter(|id| !id.is_empty());
                match relative {
                    Some(id) => {
                        tracing::warn!(path = %id, error = %e, "skipping unreadable path");
                        scan.unreadable.push(id);
                        continue;
                    }
                    None => return Err(e.into()),
                }
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let id = document_id(relative);

        if id.ends_with(TMP_SUFFIX) || !filters.matches(&id) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(path = %id, error = %e, "skipping unreadable path");
                scan.unreadable.push(id);
                continue;
            }
        };
        scan.entries.push(LocalEntry {
            id,
            path: path.to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }

    // Sort for deterministic ordering
    scan.entries.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(scan)
}

/// Relative path rendered with `/` separators on every platform.
pub fn document_id(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Map a document id back to a path under `root`, rejecting ids that would
/// escape it.
pub fn resolve(root: &Path, id: &str) -> Option<PathBuf> {
    if id.is_empty() {
        return None;
    }
    let relative = Path::new(id);
    let safe = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return None;
    }
    Some(root.join(relative))
}

pub async fn read(path: &Path) -> io::Result<Vec<u8>> {
    tokio::fs::read(path).await
}

/// Size and mtime, or `None` if the file is gone.
pub async fn stat(path: &Path) -> io::Result<Option<(u64, Option<DateTime<Utc>>)>> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(Some((m.len(), m.modified().ok().map(DateTime::<Utc>::from)))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Durably replace `path` with `content`.
pub async fn write(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_path(path);

    let result = write_tmp(&tmp, content).await;
    let result = match result {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn write_tmp(tmp: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}{}", name, TMP_SUFFIX))
}

/// Remove a file; a file that is already gone counts as removed.
pub async fn remove(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
