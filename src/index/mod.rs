//! Shared vector index, partitioned by tenant namespace.
//!
//! One logical index serves every user; each user's vectors live in their
//! own namespace so retrieval never crosses tenants. Queries are further
//! narrowed by a [`RetrievalScope`] to the titles the user selected.
//!
//! Backends embed on write and on query through an [`Embedder`], so
//! callers only ever deal in text.
//!
//! | Backend | Persistence |
//! |---------|-------------|
//! | [`InMemoryVectorIndex`] | none (tests, one-shot CLI runs) |
//! | [`SqliteVectorIndex`] | SQLite file, brute-force cosine ranking |

pub mod memory;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::embedding::Embedder;
use crate::models::{ContextChunk, IndexDocument};
use crate::scope::RetrievalScope;

pub use memory::InMemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

/// Embedding + vector index service.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or update `documents` by id within `namespace`.
    async fn upsert(&self, namespace: &str, documents: &[IndexDocument]) -> Result<()>;

    /// Rank the namespace's chunks inside `scope` against `text`.
    async fn query(
        &self,
        namespace: &str,
        scope: &RetrievalScope,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<ContextChunk>>;

    /// Number of vectors stored in `namespace`.
    async fn count(&self, namespace: &str) -> Result<usize>;

    /// Whether stored vectors outlive this process.
    ///
    /// Registry `indexed` marks are only trusted across restarts for
    /// durable backends.
    fn is_durable(&self) -> bool {
        true
    }
}

/// Build the configured index backend.
pub async fn create_index(
    config: &IndexConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<Arc<dyn VectorIndex>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryVectorIndex::new(embedder))),
        "sqlite" => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("index.path required for sqlite backend"))?;
            Ok(Arc::new(SqliteVectorIndex::open(path, embedder).await?))
        }
        other => bail!("Unknown index backend: {}", other),
    }
}

/// Embed document texts, checking the provider returned one vector each.
pub(crate) async fn embed_documents(
    embedder: &dyn Embedder,
    documents: &[IndexDocument],
) -> Result<Vec<Vec<f32>>> {
    let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != documents.len() {
        bail!(
            "embedding provider returned {} vectors for {} documents",
            vectors.len(),
            documents.len()
        );
    }
    Ok(vectors)
}

/// Sort by descending score (ties by id) and keep the best `top_k`.
pub(crate) fn rank(mut chunks: Vec<ContextChunk>, top_k: usize) -> Vec<ContextChunk> {
    chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    chunks.truncate(top_k);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, score: f64) -> ContextChunk {
        ContextChunk {
            id: id.to_string(),
            document_id: "d".to_string(),
            title: "t".to_string(),
            source: "t: page 1".to_string(),
            text: String::new(),
            score,
        }
    }

    #[test]
    fn rank_orders_and_truncates() {
        let ranked = rank(
            vec![chunk("b", 0.5), chunk("a", 0.9), chunk("c", 0.5), chunk("d", 0.1)],
            3,
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
