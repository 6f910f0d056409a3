//! SQLite-backed [`VectorIndex`].
//!
//! Each page record is one row of the `vectors` table keyed by
//! `(namespace, id)`. Scoped queries select the namespace's rows whose
//! title is in the scope, then rank them by cosine similarity in process.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, vec_to_blob, Embedder};
use crate::migrate;
use crate::models::{ContextChunk, IndexDocument};
use crate::scope::RetrievalScope;

use super::{embed_documents, rank, VectorIndex};

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
}

impl SqliteVectorIndex {
    /// Connect to (or create) the database at `path` and run migrations.
    pub async fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool, embedder })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, namespace: &str, documents: &[IndexDocument]) -> Result<()> {
        let vectors = embed_documents(self.embedder.as_ref(), documents).await?;
        let model = self.embedder.model_name().to_string();

        let mut tx = self.pool.begin().await?;
        for (doc, vector) in documents.iter().zip(vectors.iter()) {
            sqlx::query(
                r#"
                INSERT INTO vectors (namespace, id, document_id, title, source, text,
                                     metadata_json, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, id) DO UPDATE SET
                    document_id = excluded.document_id,
                    title = excluded.title,
                    source = excluded.source,
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(namespace)
            .bind(&doc.id)
            .bind(&doc.document_id)
            .bind(doc.title())
            .bind(&doc.source)
            .bind(&doc.text)
            .bind(doc.metadata.to_string())
            .bind(&model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(namespace, rows = documents.len(), "vectors upserted");
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        scope: &RetrievalScope,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<ContextChunk>> {
        let query_vec = embed_query(self.embedder.as_ref(), text).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, document_id, title, source, text, embedding FROM vectors WHERE namespace = ",
        );
        qb.push_bind(namespace.to_string());
        qb.push(" AND title IN (");
        let mut titles = qb.separated(", ");
        for title in scope.titles() {
            titles.push_bind(title.to_string());
        }
        titles.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;

        let candidates: Vec<ContextChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                ContextChunk {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    title: row.get("title"),
                    source: row.get("source"),
                    text: row.get("text"),
                    score: cosine_similarity(&query_vec, &vector) as f64,
                }
            })
            .collect();

        Ok(rank(candidates, top_k))
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
