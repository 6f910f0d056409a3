//! In-memory [`VectorIndex`] for tests and one-shot runs.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`; vector search is
//! brute-force cosine similarity over the namespace.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::models::{ContextChunk, IndexDocument};
use crate::scope::RetrievalScope;

use super::{embed_documents, rank, VectorIndex};

struct StoredVector {
    doc: IndexDocument,
    vector: Vec<f32>,
}

type Namespace = HashMap<String, StoredVector>;

pub struct InMemoryVectorIndex {
    embedder: Arc<dyn Embedder>,
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            namespaces: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn is_durable(&self) -> bool {
        false
    }

    async fn upsert(&self, namespace: &str, documents: &[IndexDocument]) -> Result<()> {
        let vectors = embed_documents(self.embedder.as_ref(), documents).await?;
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let ns = namespaces.entry(namespace.to_string()).or_default();
        for (doc, vector) in documents.iter().zip(vectors) {
            ns.insert(
                doc.id.clone(),
                StoredVector {
                    doc: doc.clone(),
                    vector,
                },
            );
        }
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
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let candidates: Vec<ContextChunk> = namespaces
            .get(namespace)
            .into_iter()
            .flat_map(|ns| ns.values())
            .filter(|sv| scope.matches(sv.doc.title()))
            .map(|sv| ContextChunk {
                id: sv.doc.id.clone(),
                document_id: sv.doc.document_id.clone(),
                title: sv.doc.title().to_string(),
                source: sv.doc.source.clone(),
                text: sv.doc.text.clone(),
                score: cosine_similarity(&query_vec, &sv.vector) as f64,
            })
            .collect();
        Ok(rank(candidates, top_k))
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let namespaces = self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces.get(namespace).map_or(0, |ns| ns.len()))
    }
}
