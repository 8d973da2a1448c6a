use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Create chunks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            tenant_id INTEGER NOT NULL,
            channel_id TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'No Category',
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            started_at INTEGER NOT NULL,
            message_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_tenant ON chunks(tenant_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_tenant_started_at ON chunks(tenant_id, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
