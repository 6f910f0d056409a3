//! Bring a tenant's `indexed` set into line with its `documents`.
//!
//! For every pending document the coordinator fetches its page records,
//! upserts them into the tenant's namespace, and only then marks the
//! document indexed. A failed or timed-out upsert is logged, reported as
//! an [`UpsertFailure`], and leaves the document pending for the next
//! run; the remaining documents are still processed.
//!
//! Registry write errors and missing documents abort the run.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::document_store::DocumentStore;
use crate::error::{Result, UpsertFailure};
use crate::index::VectorIndex;
use crate::models::{DocumentId, IndexDocument};
use crate::registry::{TenantRecord, TenantRegistry};

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Documents upserted and marked indexed by this pass.
    pub indexed: Vec<DocumentId>,
    /// Non-fatal per-document failures; these stay pending.
    #[serde(serialize_with = "serialize_failures")]
    pub failures: Vec<UpsertFailure>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

fn serialize_failures<S>(failures: &[UpsertFailure], s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeSeq;
    let mut seq = s.serialize_seq(Some(failures.len()))?;
    for f in failures {
        seq.serialize_element(&serde_json::json!({
            "document_id": f.document_id,
            "reason": f.reason,
        }))?;
    }
    seq.end()
}

pub struct IndexingCoordinator<'a> {
    store: &'a DocumentStore,
    registry: &'a TenantRegistry,
    index: &'a dyn VectorIndex,
    upsert_timeout: Duration,
}

impl<'a> IndexingCoordinator<'a> {
    pub fn new(
        store: &'a DocumentStore,
        registry: &'a TenantRegistry,
        index: &'a dyn VectorIndex,
        upsert_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            index,
            upsert_timeout,
        }
    }

    /// Upsert every document in `tenant.documents` not yet in `tenant.indexed`.
    ///
    /// The tenant's namespace is `user`.
    pub async fn reconcile(&self, user: &str, tenant: &TenantRecord) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for id in tenant.pending() {
            let records = self.store.get(id)?;
            let documents: Vec<IndexDocument> = records
                .iter()
                .map(|r| IndexDocument::from_record(id, r))
                .collect();

            match self.upsert(user, &documents).await {
                Ok(()) => {
                    let (owner, document_id) = (user.to_string(), id.clone());
                    self.registry
                        .run_blocking(move |r| r.mark_indexed(&owner, &document_id))
                        .await?;
                    info!(user, document_id = %id, pages = documents.len(), "document indexed");
                    report.indexed.push(id.clone());
                }
                Err(reason) => {
                    warn!(user, document_id = %id, %reason, "upsert failed; document stays pending");
                    report.failures.push(UpsertFailure {
                        document_id: id.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn upsert(&self, namespace: &str, documents: &[IndexDocument]) -> std::result::Result<(), String> {
        match tokio::time::timeout(self.upsert_timeout, self.index.upsert(namespace, documents)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!(
                "timed out after {}s",
                self.upsert_timeout.as_secs_f64()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocumentsConfig;
    use crate::embedding::HashEmbedder;
    use crate::error::Error;
    use crate::index::InMemoryVectorIndex;
    use crate::models::ContextChunk;
    use crate::scope::RetrievalScope;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: DocumentStore,
        registry: TenantRegistry,
    }

    fn fixture(docs: &[(&str, usize)]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store =
            DocumentStore::open(tmp.path().join("cache"), DocumentsConfig::default()).unwrap();
        let registry = TenantRegistry::new(
            tmp.path().join("registry.json"),
            "docchat",
            Duration::from_secs(1),
        );
        let mut ids = Vec::new();
        for (name, pages) in docs {
            let texts: Vec<String> = (0..*pages).map(|p| format!("{} page {}", name, p)).collect();
            ids.push(store.ingest(name, &texts).unwrap());
        }
        registry.add_documents("alice", ids).unwrap();
        Fixture {
            _tmp: tmp,
            store,
            registry,
        }
    }

    /// Rejects upserts for selected document ids, records the rest.
    struct FlakyIndex {
        reject: HashSet<String>,
        hang: HashSet<String>,
        calls: Mutex<Vec<(String, usize)>>,
    }

    impl FlakyIndex {
        fn rejecting(ids: &[&str]) -> Self {
            Self {
                reject: ids.iter().map(|s| s.to_string()).collect(),
                hang: HashSet::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VectorIndex for FlakyIndex {
        async fn upsert(&self, namespace: &str, documents: &[IndexDocument]) -> anyhow::Result<()> {
            let doc_id = documents.first().map(|d| d.document_id.clone()).unwrap_or_default();
            if self.hang.contains(&doc_id) {
                std::future::pending::<()>().await;
            }
            if self.reject.contains(&doc_id) {
                anyhow::bail!("vector store rejected {}", doc_id);
            }
            self.calls
                .lock()
                .unwrap()
                .push((namespace.to_string(), documents.len()));
            Ok(())
        }

        async fn query(
            &self,
            _namespace: &str,
            _scope: &RetrievalScope,
            _text: &str,
            _top_k: usize,
        ) -> anyhow::Result<Vec<ContextChunk>> {
            Ok(Vec::new())
        }

        async fn count(&self, _namespace: &str) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn reconcile_indexes_everything_pending() {
        let fx = fixture(&[("Annual Report.pdf", 3), ("Budget.pdf", 2)]);
        let index = InMemoryVectorIndex::new(Arc::new(HashEmbedder::new(64)));
        let coord = IndexingCoordinator::new(&fx.store, &fx.registry, &index, Duration::from_secs(5));

        let tenant = fx.registry.ensure_user("alice").unwrap();
        let report = coord.reconcile("alice", &tenant).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.indexed, vec!["annual-report", "budget"]);
        assert_eq!(index.count("alice").await.unwrap(), 5);
        assert!(fx.registry.get("alice").unwrap().unwrap().is_reconciled());
    }

    #[tokio::test]
    async fn already_indexed_documents_are_skipped() {
        let fx = fixture(&[("A.pdf", 1), ("B.pdf", 1)]);
        fx.registry.mark_indexed("alice", "a").unwrap();
        let index = FlakyIndex::rejecting(&[]);
        let coord = IndexingCoordinator::new(&fx.store, &fx.registry, &index, Duration::from_secs(5));

        let tenant = fx.registry.get("alice").unwrap().unwrap();
        let report = coord.reconcile("alice", &tenant).await.unwrap();
        assert_eq!(report.indexed, vec!["b"]);
        assert_eq!(index.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let fx = fixture(&[("A.pdf", 1), ("B.pdf", 2), ("C.pdf", 1)]);
        let index = FlakyIndex::rejecting(&["b"]);
        let coord = IndexingCoordinator::new(&fx.store, &fx.registry, &index, Duration::from_secs(5));

        let tenant = fx.registry.get("alice").unwrap().unwrap();
        let report = coord.reconcile("alice", &tenant).await.unwrap();

        assert_eq!(report.indexed, vec!["a", "c"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].document_id, "b");
        assert!(report.failures[0].reason.contains("rejected"));

        let after = fx.registry.get("alice").unwrap().unwrap();
        let missing: Vec<&DocumentId> = after.pending().collect();
        assert_eq!(missing, vec!["b"]);
        assert!(after.indexed.is_subset(&after.documents));

        // The failed id is retried on the next pass.
        let index = FlakyIndex::rejecting(&[]);
        let coord = IndexingCoordinator::new(&fx.store, &fx.registry, &index, Duration::from_secs(5));
        let report = coord.reconcile("alice", &after).await.unwrap();
        assert_eq!(report.indexed, vec!["b"]);
        assert!(fx.registry.get("alice").unwrap().unwrap().is_reconciled());
    }

    #[tokio::test]
    async fn slow_upsert_times_out_as_failure() {
        let fx = fixture(&[("Slow.pdf", 1), ("Fast.pdf", 1)]);
        let mut index = FlakyIndex::rejecting(&[]);
        index.hang.insert("slow".to_string());
        let coord =
            IndexingCoordinator::new(&fx.store, &fx.registry, &index, Duration::from_millis(50));

        let tenant = fx.registry.get("alice").unwrap().unwrap();
        let report = coord.reconcile("alice", &tenant).await.unwrap();
        assert_eq!(report.indexed, vec!["fast"]);
        assert_eq!(report.failures[0].document_id, "slow");
        assert!(report.failures[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn missing_document_records_propagate() {
        let fx = fixture(&[("A.pdf", 1)]);
        fx.registry.add_documents("alice", ["ghost"]).unwrap();
        let index = FlakyIndex::rejecting(&[]);
        let coord = IndexingCoordinator::new(&fx.store, &fx.registry, &index, Duration::from_secs(5));

        let tenant = fx.registry.get("alice").unwrap().unwrap();
        let err = coord.reconcile("alice", &tenant).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "ghost"));
    }

    #[test]
    fn report_serializes_failures() {
        let report = ReconcileReport {
            indexed: vec!["a".to_string()],
            failures: vec![UpsertFailure {
                document_id: "b".to_string(),
                reason: "boom".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "indexed": ["a"],
                "failures": [{"document_id": "b", "reason": "boom"}]
            })
        );
    }
}
