use anyhow::Result;
use sqlx::SqlitePool;

/// Create the state schema for one mapping. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_records (
            document_id TEXT PRIMARY KEY,
            local_digest TEXT NOT NULL,
            local_size INTEGER NOT NULL,
            local_mtime TEXT,
            remote_id TEXT NOT NULL,
            remote_digest TEXT NOT NULL,
            remote_version TEXT,
            synced_at TEXT NOT NULL,
            backup_ref INTEGER,
            revision INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            digest TEXT NOT NULL,
            size INTEGER NOT NULL,
            content BLOB NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_backups_document_id ON backups(document_id, id DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
