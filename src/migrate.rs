use anyhow::Result;
use sqlx::SqlitePool;

/// Create the vector table and its indexes. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per page record, partitioned by tenant namespace.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            title TEXT NOT NULL,
            source TEXT NOT NULL,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_namespace_title ON vectors(namespace, title)")
        .execute(pool)
        .await?;

    Ok(())
}
