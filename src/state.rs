//! Persistent sync state.
//!
//! The [`StateStore`] trait holds, per document id, the [`SyncRecord`] last
//! known to be in sync plus the document's backup chain. Every mapping gets
//! its own store (one SQLite file per mapping root), opened once per process
//! run and handed to the orchestrator.
//!
//! # Atomicity
//!
//! Each record carries a revision. [`StateStore::compare_and_put`] only
//! writes when the stored revision still matches what the caller read during
//! detection, so two overlapping cycles can never commit a stale record over
//! a fresher one.
//!
//! # Corruption
//!
//! Rows that cannot be decoded are reported with `record: None` (and their
//! revision, so they can be overwritten). A row whose revision itself is
//! unreadable reports `revision: None` and is replaced by the next
//! compare-and-swap that expects no record. Callers treat both as "never
//! synced", which forces re-detection instead of suppressing a transfer.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::db;
use crate::fingerprint;
use crate::migrate;
use crate::models::{BackupSnapshot, RecordSlot, SyncRecord};

/// Storage backend for sync records and backups.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The stored record and its revision.
    async fn slot(&self, document_id: &str) -> Result<RecordSlot>;

    /// Every stored slot, keyed by document id.
    async fn slots(&self) -> Result<Vec<(String, RecordSlot)>>;

    /// Unconditionally write a record.
    async fn put(&self, document_id: &str, record: &SyncRecord) -> Result<()>;

    async fn delete(&self, document_id: &str) -> Result<()>;

    /// Write `record` only if the stored revision equals `expected`
    /// (`None` = no row may exist). Returns whether the write happened.
    async fn compare_and_put(
        &self,
        document_id: &str,
        expected: Option<i64>,
        record: &SyncRecord,
    ) -> Result<bool>;

    /// Delete the record only if the stored revision equals `expected`.
    async fn compare_and_delete(&self, document_id: &str, expected: Option<i64>) -> Result<bool>;

    /// Append a backup and return its id.
    async fn insert_backup(&self, document_id: &str, content: &[u8]) -> Result<i64>;

    /// Drop all but the `keep` most recent backups of a document.
    async fn prune_backups(&self, document_id: &str, keep: u32) -> Result<u64>;

    /// Backups of a document, most recent first.
    async fn backups(&self, document_id: &str) -> Result<Vec<BackupSnapshot>>;

    async fn backup(&self, id: i64) -> Result<Option<BackupSnapshot>>;

    /// The record, or `None` if absent or unreadable.
    async fn get(&self, document_id: &str) -> Result<Option<SyncRecord>> {
        Ok(self.slot(document_id).await?.record)
    }
}

/// Takes snapshots before destructive local writes and enforces retention.
pub struct BackupManager<'a> {
    store: &'a dyn StateStore,
    retention: u32,
}

impl<'a> BackupManager<'a> {
    pub fn new(store: &'a dyn StateStore, retention: u32) -> Self {
        Self { store, retention }
    }

    /// Store `content` as the newest backup of `document_id`, then prune.
    ///
    /// With a retention of zero no backup is kept and `None` is returned.
    pub async fn snapshot(&self, document_id: &str, content: &[u8]) -> Result<Option<i64>> {
        if self.retention == 0 {
            return Ok(None);
        }
        let id = self.store.insert_backup(document_id, content).await?;
        let pruned = self.store.prune_backups(document_id, self.retention).await?;
        if pruned > 0 {
            tracing::debug!(document = document_id, pruned, "pruned old backups");
        }
        Ok(Some(id))
    }
}

// ============ SQLite ============

/// SQLite-backed store; one database file per mapping.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) and migrate the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn record_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const RECORD_COLUMNS: &str = "document_id, local_digest, local_size, local_mtime, remote_id, \
    remote_digest, remote_version, synced_at, backup_ref, revision";

fn decode_record(row: &sqlx::sqlite::SqliteRow) -> Option<SyncRecord> {
    let local_digest: String = row.try_get("local_digest").ok()?;
    let remote_digest: String = row.try_get("remote_digest").ok()?;
    if !fingerprint::is_valid_digest(&local_digest) || !fingerprint::is_valid_digest(&remote_digest)
    {
        return None;
    }
    let local_size: i64 = row.try_get("local_size").ok()?;
    let local_mtime: Option<String> = row.try_get("local_mtime").ok()?;
    let local_mtime = match local_mtime {
        Some(s) => Some(parse_ts(&s)?),
        None => None,
    };
    let synced_at: String = row.try_get("synced_at").ok()?;

    Some(SyncRecord {
        local_digest,
        local_size: u64::try_from(local_size).ok()?,
        local_mtime,
        remote_id: row.try_get("remote_id").ok()?,
        remote_digest,
        remote_version: row.try_get("remote_version").ok()?,
        synced_at: parse_ts(&synced_at)?,
        backup_ref: row.try_get("backup_ref").ok()?,
    })
}

fn decode_slot(row: &sqlx::sqlite::SqliteRow) -> Option<(String, RecordSlot)> {
    let document_id: String = match row.try_get("document_id") {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "skipping sync record with unreadable document id");
            return None;
        }
    };
    // An unreadable revision leaves the row matching only `expected = None`.
    let revision: Option<i64> = row.try_get("revision").ok();
    let record = revision.and_then(|_| decode_record(row));
    if record.is_none() {
        tracing::warn!(
            document = %document_id,
            "sync record is unreadable; treating document as never synced"
        );
    }
    Some((document_id, RecordSlot { revision, record }))
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

fn decode_backup(row: &sqlx::sqlite::SqliteRow) -> Result<BackupSnapshot> {
    let created_at: String = row.try_get("created_at")?;
    let size: i64 = row.try_get("size")?;
    Ok(BackupSnapshot {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        digest: row.try_get("digest")?,
        size: size.max(0) as u64,
        created_at: parse_ts(&created_at).unwrap_or_default(),
        content: row.try_get("content")?,
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn slot(&self, document_id: &str) -> Result<RecordSlot> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sync_records WHERE document_id = ?",
            RECORD_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .and_then(|r| decode_slot(&r))
            .map(|(_, slot)| slot)
            .unwrap_or_default())
    }

    async fn slots(&self) -> Result<Vec<(String, RecordSlot)>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sync_records ORDER BY document_id",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().filter_map(decode_slot).collect())
    }

    async fn put(&self, document_id: &str, record: &SyncRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (document_id, local_digest, local_size, local_mtime, remote_id,
                remote_digest, remote_version, synced_at, backup_ref, revision)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(document_id) DO UPDATE SET
                local_digest = excluded.local_digest,
                local_size = excluded.local_size,
                local_mtime = excluded.local_mtime,
                remote_id = excluded.remote_id,
                remote_digest = excluded.remote_digest,
                remote_version = excluded.remote_version,
                synced_at = excluded.synced_at,
                backup_ref = excluded.backup_ref,
                revision = sync_records.revision + 1
            "#,
        )
        .bind(document_id)
        .bind(&record.local_digest)
        .bind(record.local_size as i64)
        .bind(record.local_mtime.as_ref().map(format_ts))
        .bind(&record.remote_id)
        .bind(&record.remote_digest)
        .bind(&record.remote_version)
        .bind(format_ts(&record.synced_at))
        .bind(record.backup_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_records WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn compare_and_put(
        &self,
        document_id: &str,
        expected: Option<i64>,
        record: &SyncRecord,
    ) -> Result<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO sync_records (document_id, local_digest, local_size, local_mtime,
                        remote_id, remote_digest, remote_version, synced_at, backup_ref, revision)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                    ON CONFLICT(document_id) DO UPDATE SET
                        local_digest = excluded.local_digest,
                        local_size = excluded.local_size,
                        local_mtime = excluded.local_mtime,
                        remote_id = excluded.remote_id,
                        remote_digest = excluded.remote_digest,
                        remote_version = excluded.remote_version,
                        synced_at = excluded.synced_at,
                        backup_ref = excluded.backup_ref,
                        revision = 1
                    WHERE typeof(sync_records.revision) != 'integer'
                    "#,
                )
                .bind(document_id)
                .bind(&record.local_digest)
                .bind(record.local_size as i64)
                .bind(record.local_mtime.as_ref().map(format_ts))
                .bind(&record.remote_id)
                .bind(&record.remote_digest)
                .bind(&record.remote_version)
                .bind(format_ts(&record.synced_at))
                .bind(record.backup_ref)
                .execute(&self.pool)
                .await?
            }
            Some(revision) => {
                sqlx::query(
                    r#"
                    UPDATE sync_records SET
                        local_digest = ?, local_size = ?, local_mtime = ?, remote_id = ?,
                        remote_digest = ?, remote_version = ?, synced_at = ?, backup_ref = ?,
                        revision = revision + 1
                    WHERE document_id = ? AND revision = ?
                    "#,
                )
                .bind(&record.local_digest)
                .bind(record.local_size as i64)
                .bind(record.local_mtime.as_ref().map(format_ts))
                .bind(&record.remote_id)
                .bind(&record.remote_digest)
                .bind(&record.remote_version)
                .bind(format_ts(&record.synced_at))
                .bind(record.backup_ref)
                .bind(document_id)
                .bind(revision)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_delete(&self, document_id: &str, expected: Option<i64>) -> Result<bool> {
        match expected {
            None => {
                sqlx::query(
                    "DELETE FROM sync_records WHERE document_id = ? AND typeof(revision) != 'integer'",
                )
                .bind(document_id)
                .execute(&self.pool)
                .await?;
                let exists: bool = sqlx::query_scalar(
                    "SELECT COUNT(*) > 0 FROM sync_records WHERE document_id = ?",
                )
                .bind(document_id)
                .fetch_one(&self.pool)
                .await?;
                Ok(!exists)
            }
            Some(revision) => {
                let result =
                    sqlx::query("DELETE FROM sync_records WHERE document_id = ? AND revision = ?")
                        .bind(document_id)
                        .bind(revision)
                        .execute(&self.pool)
                        .await?;
                Ok(result.rows_affected() == 1)
            }
        }
    }

    async fn insert_backup(&self, document_id: &str, content: &[u8]) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO backups (document_id, digest, size, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(fingerprint::digest(content))
        .bind(content.len() as i64)
        .bind(content)
        .bind(format_ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn prune_backups(&self, document_id: &str, keep: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM backups
            WHERE document_id = ?
              AND id NOT IN (
                SELECT id FROM backups WHERE document_id = ? ORDER BY id DESC LIMIT ?
              )
            "#,
        )
        .bind(document_id)
        .bind(document_id)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn backups(&self, document_id: &str) -> Result<Vec<BackupSnapshot>> {
        let rows = sqlx::query(
            "SELECT id, document_id, digest, size, content, created_at FROM backups \
             WHERE document_id = ? ORDER BY id DESC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_backup).collect()
    }

    async fn backup(&self, id: i64) -> Result<Option<BackupSnapshot>> {
        let row = sqlx::query(
            "SELECT id, document_id, digest, size, content, created_at FROM backups WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_backup).transpose()
    }
}

// ============ In-memory ============

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, (i64, Option<SyncRecord>)>,
    backups: Vec<BackupSnapshot>,
    next_backup_id: i64,
}

/// In-memory store for tests and embedding. Not persisted.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: RwLock<MemoryInner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a stored record unreadable, keeping its revision.
    pub fn corrupt(&self, document_id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.records.get_mut(document_id) {
            entry.1 = None;
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn slot(&self, document_id: &str) -> Result<RecordSlot> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .records
            .get(document_id)
            .map(|(rev, rec)| RecordSlot {
                revision: Some(*rev),
                record: rec.clone(),
            })
            .unwrap_or_default())
    }

    async fn slots(&self) -> Result<Vec<(String, RecordSlot)>> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<(String, RecordSlot)> = inner
            .records
            .iter()
            .map(|(id, (rev, rec))| {
                (
                    id.clone(),
                    RecordSlot {
                        revision: Some(*rev),
                        record: rec.clone(),
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn put(&self, document_id: &str, record: &SyncRecord) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let rev = inner.records.get(document_id).map(|e| e.0).unwrap_or(0) + 1;
        inner
            .records
            .insert(document_id.to_string(), (rev, Some(record.clone())));
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<()> {
        self.inner.write().unwrap().records.remove(document_id);
        Ok(())
    }

    async fn compare_and_put(
        &self,
        document_id: &str,
        expected: Option<i64>,
        record: &SyncRecord,
    ) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let current = inner.records.get(document_id).map(|e| e.0);
        if current != expected {
            return Ok(false);
        }
        inner.records.insert(
            document_id.to_string(),
            (current.unwrap_or(0) + 1, Some(record.clone())),
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, document_id: &str, expected: Option<i64>) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let current = inner.records.get(document_id).map(|e| e.0);
        if current != expected {
            return Ok(false);
        }
        inner.records.remove(document_id);
        Ok(true)
    }

    async fn insert_backup(&self, document_id: &str, content: &[u8]) -> Result<i64> {
        let mut inner = self.inner.write().unwrap();
        inner.next_backup_id += 1;
        let id = inner.next_backup_id;
        inner.backups.push(BackupSnapshot {
            id,
            document_id: document_id.to_string(),
            digest: fingerprint::digest(content),
            size: content.len() as u64,
            created_at: Utc::now(),
            content: content.to_vec(),
        });
        Ok(id)
    }

    async fn prune_backups(&self, document_id: &str, keep: u32) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let mut ids: Vec<i64> = inner
            .backups
            .iter()
            .filter(|b| b.document_id == document_id)
            .map(|b| b.id)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let doomed: Vec<i64> = ids.into_iter().skip(keep as usize).collect();
        inner.backups.retain(|b| !doomed.contains(&b.id));
        Ok(doomed.len() as u64)
    }

    async fn backups(&self, document_id: &str) -> Result<Vec<BackupSnapshot>> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<BackupSnapshot> = inner
            .backups
            .iter()
            .filter(|b| b.document_id == document_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(out)
    }

    async fn backup(&self, id: i64) -> Result<Option<BackupSnapshot>> {
        let inner = self.inner.read().unwrap();
        Ok(inner.backups.iter().find(|b| b.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(tag: &[u8]) -> SyncRecord {
        SyncRecord {
            local_digest: fingerprint::digest(tag),
            local_size: tag.len() as u64,
            local_mtime: Some(Utc::now()),
            remote_id: "page-1".to_string(),
            remote_digest: fingerprint::digest(tag),
            remote_version: Some("v1".to_string()),
            synced_at: Utc::now(),
            backup_ref: None,
        }
    }

    async fn sqlite() -> (TempDir, SqliteStateStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStateStore::open(&tmp.path().join("state.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn sqlite_put_get_delete() {
        let (_tmp, store) = sqlite().await;
        assert!(store.get("a.md").await.unwrap().is_none());

        let rec = record(b"one");
        store.put("a.md", &rec).await.unwrap();
        assert_eq!(store.get("a.md").await.unwrap(), Some(rec));
        assert_eq!(store.record_count().await.unwrap(), 1);

        store.delete("a.md").await.unwrap();
        assert!(store.get("a.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_compare_and_put_rejects_stale_revision() {
        let (_tmp, store) = sqlite().await;

        assert!(store.compare_and_put("a.md", None, &record(b"1")).await.unwrap());
        // A second writer that also saw "no record" loses.
        assert!(!store.compare_and_put("a.md", None, &record(b"2")).await.unwrap());

        let rev = store.slot("a.md").await.unwrap().revision;
        assert!(store.compare_and_put("a.md", rev, &record(b"3")).await.unwrap());
        assert!(!store.compare_and_put("a.md", rev, &record(b"4")).await.unwrap());
        assert_eq!(
            store.get("a.md").await.unwrap().unwrap().local_digest,
            fingerprint::digest(b"3")
        );
    }

    #[tokio::test]
    async fn sqlite_corrupt_row_reads_as_absent_but_keeps_revision() {
        let (_tmp, store) = sqlite().await;
        store.put("a.md", &record(b"x")).await.unwrap();
        sqlx::query("UPDATE sync_records SET synced_at = 'not a timestamp'")
            .execute(store.pool())
            .await
            .unwrap();

        let slot = store.slot("a.md").await.unwrap();
        assert!(slot.record.is_none());
        assert!(slot.revision.is_some());
        assert!(store
            .compare_and_put("a.md", slot.revision, &record(b"y"))
            .await
            .unwrap());
        assert!(store.get("a.md").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sqlite_unreadable_revision_reads_as_absent() {
        let (_tmp, store) = sqlite().await;
        store.put("a.md", &record(b"x")).await.unwrap();
        store.put("b.md", &record(b"y")).await.unwrap();
        sqlx::query("UPDATE sync_records SET revision = 'garbage' WHERE document_id = 'a.md'")
            .execute(store.pool())
            .await
            .unwrap();

        let slots = store.slots().await.unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].0, "a.md");
        assert!(slots[0].1.revision.is_none());
        assert!(slots[0].1.record.is_none());
        assert!(slots[1].1.record.is_some());

        // The next commit that expected "never synced" repairs the row.
        assert!(store
            .compare_and_put("a.md", None, &record(b"z"))
            .await
            .unwrap());
        let slot = store.slot("a.md").await.unwrap();
        assert_eq!(slot.revision, Some(1));
        assert_eq!(
            slot.record.unwrap().local_digest,
            fingerprint::digest(b"z")
        );
    }

    #[tokio::test]
    async fn sqlite_unreadable_revision_can_be_forgotten() {
        let (_tmp, store) = sqlite().await;
        store.put("a.md", &record(b"x")).await.unwrap();
        sqlx::query("UPDATE sync_records SET revision = 'garbage'")
            .execute(store.pool())
            .await
            .unwrap();

        assert!(store.compare_and_delete("a.md", None).await.unwrap());
        assert!(store.slots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backup_retention_keeps_newest() {
        let (_tmp, store) = sqlite().await;
        let manager = BackupManager::new(&store, 2);
        for i in 0..5u8 {
            manager.snapshot("a.md", &[i]).await.unwrap();
        }
        let backups = store.backups("a.md").await.unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].content, vec![4]);
        assert_eq!(backups[1].content, vec![3]);
    }

    #[tokio::test]
    async fn zero_retention_takes_no_backup() {
        let store = InMemoryStateStore::new();
        let manager = BackupManager::new(&store, 0);
        assert_eq!(manager.snapshot("a.md", b"x").await.unwrap(), None);
        assert!(store.backups("a.md").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_matches_cas_semantics() {
        let store = InMemoryStateStore::new();
        assert!(store.compare_and_put("a", None, &record(b"1")).await.unwrap());
        let rev = store.slot("a").await.unwrap().revision;
        store.corrupt("a");
        assert!(store.get("a").await.unwrap().is_none());
        assert!(!store.compare_and_delete("a", None).await.unwrap());
        assert!(store.compare_and_delete("a", rev).await.unwrap());
        assert!(store.slots().await.unwrap().is_empty());
    }
}
