//! The lifetime-scoped application context.
//!
//! [`App`] owns one [`DocumentStore`], one [`TenantRegistry`], the shared
//! vector index and the chat service. The CLI and the HTTP server build a
//! single `App` and pass it around explicitly, so independent instances
//! (one per test, say) never share state.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::chat::{create_completion_model, ChatService, ModelParams, RagChat};
use crate::config::Config;
use crate::document_store::DocumentStore;
use crate::embedding::create_embedder;
use crate::error::{Error, Result};
use crate::index::{create_index, VectorIndex};
use crate::indexer::{IndexingCoordinator, ReconcileReport};
use crate::models::DocumentId;
use crate::registry::{TenantRecord, TenantRegistry};
use crate::scope::{build_scope, RetrievalScope};
use crate::session::Session;

/// A user's document with its indexing status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStatus {
    pub id: DocumentId,
    pub title: String,
    pub indexed: bool,
}

pub struct App {
    config: Config,
    store: DocumentStore,
    registry: TenantRegistry,
    index: Arc<dyn VectorIndex>,
    chat: Arc<dyn ChatService>,
}

impl App {
    /// Build every collaborator from configuration.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let index = create_index(&config.index, embedder).await?;
        let model = create_completion_model(&config.chat)?;
        let chat = Arc::new(RagChat::new(index.clone(), model, config.index.top_k));
        Ok(Self::new(config, index, chat)?)
    }

    /// Open the store and registry named in `config` around the given
    /// index and chat service. Cached documents are loaded immediately.
    ///
    /// Over a non-durable index every `indexed` mark in the registry scope
    /// is dropped, since no vectors from an earlier process survive.
    pub fn new(
        config: Config,
        index: Arc<dyn VectorIndex>,
        chat: Arc<dyn ChatService>,
    ) -> Result<Self> {
        let store = DocumentStore::open(&config.storage.cache_dir, config.documents.clone())?;
        store.load_cached()?;
        let registry = TenantRegistry::new(
            &config.storage.registry_path,
            &config.index.name,
            Duration::from_millis(config.storage.lock_timeout_ms),
        );
        if !index.is_durable() {
            let dropped = registry.reset_indexed()?;
            if dropped > 0 {
                warn!(dropped, "vector index is not durable; documents must be re-indexed");
            }
        }
        Ok(Self {
            config,
            store,
            registry,
            index,
            chat,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn registry(&self) -> &TenantRegistry {
        &self.registry
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Extract and store a PDF, then register it for `user`.
    pub fn upload_pdf(&self, user: &str, raw_name: &str, bytes: &[u8]) -> Result<DocumentId> {
        let id = self.store.ingest_pdf(raw_name, bytes)?;
        self.registry.add_documents(user, [id.clone()])?;
        Ok(id)
    }

    /// Store already-extracted page texts, then register them for `user`.
    pub fn upload_pages(&self, user: &str, raw_name: &str, pages: &[String]) -> Result<DocumentId> {
        let id = self.store.ingest(raw_name, pages)?;
        self.registry.add_documents(user, [id.clone()])?;
        Ok(id)
    }

    /// Index everything `user` has registered but not yet indexed.
    pub async fn reconcile(&self, user: &str) -> Result<ReconcileReport> {
        let owner = user.to_string();
        let tenant = self
            .registry
            .run_blocking(move |r| r.ensure_user(&owner))
            .await?;
        let coordinator = IndexingCoordinator::new(
            &self.store,
            &self.registry,
            self.index.as_ref(),
            Duration::from_secs(self.config.index.upsert_timeout_secs),
        );
        coordinator.reconcile(user, &tenant).await
    }

    /// The user's documents in id order, each marked indexed or pending.
    pub async fn documents(&self, user: &str) -> Result<Vec<DocumentStatus>> {
        let tenant = self.tenant(user).await?;
        Ok(tenant
            .documents
            .iter()
            .map(|id| DocumentStatus {
                id: id.clone(),
                title: self.store.title(id).unwrap_or_else(|_| {
                    debug!(user, document_id = %id, "registered document missing from store");
                    id.clone()
                }),
                indexed: tenant.is_indexed(id),
            })
            .collect())
    }

    /// Build a retrieval scope from the user's selection.
    ///
    /// Every selected id must belong to `user` and already be indexed.
    pub async fn scope(&self, user: &str, selected: &[DocumentId]) -> Result<RetrievalScope> {
        if selected.is_empty() {
            return Err(Error::EmptySelection);
        }
        let tenant = self.tenant(user).await?;
        for id in selected {
            if !tenant.documents.contains(id) {
                return Err(Error::NotFound(id.clone()));
            }
            if !tenant.is_indexed(id) {
                return Err(Error::NotIndexed {
                    document_id: id.clone(),
                });
            }
        }
        build_scope(&self.store, selected)
    }

    /// A fresh conversation retrieving from `user`'s namespace.
    pub fn session(&self, user: &str) -> Session {
        Session::new(
            user,
            self.chat.clone(),
            ModelParams::from(&self.config.chat),
            Duration::from_secs(self.config.chat.timeout_secs),
        )
    }

    async fn tenant(&self, user: &str) -> Result<TenantRecord> {
        let owner = user.to_string();
        let record = self.registry.run_blocking(move |r| r.get(&owner)).await?;
        Ok(record.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::index::InMemoryVectorIndex;
    use crate::models::ConversationTurn;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Echo;

    #[async_trait]
    impl ChatService for Echo {
        async fn chat(
            &self,
            namespace: &str,
            turns: &[ConversationTurn],
            scope: &RetrievalScope,
            _params: &ModelParams,
        ) -> anyhow::Result<String> {
            let titles: Vec<&str> = scope.titles().collect();
            Ok(format!(
                "{} asked {:?} over {:?}",
                namespace,
                turns.last().map(|t| t.content.as_str()).unwrap_or_default(),
                titles
            ))
        }
    }

    fn app(tmp: &TempDir) -> App {
        let config = Config::local(tmp.path());
        let index = Arc::new(InMemoryVectorIndex::new(Arc::new(HashEmbedder::new(64))));
        App::new(config, index, Arc::new(Echo)).unwrap()
    }

    fn pages(n: usize) -> Vec<String> {
        (1..=n).map(|p| format!("page {} text", p)).collect()
    }

    #[tokio::test]
    async fn upload_lists_pending_then_indexed() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);
        let id = app.upload_pages("alice", "Annual Report.pdf", &pages(3)).unwrap();
        assert_eq!(id, "annual-report");

        let docs = app.documents("alice").await.unwrap();
        assert_eq!(
            docs,
            vec![DocumentStatus {
                id: "annual-report".into(),
                title: "Annual Report.pdf".into(),
                indexed: false,
            }]
        );

        let report = app.reconcile("alice").await.unwrap();
        assert_eq!(report.indexed, vec!["annual-report"]);
        assert!(app.documents("alice").await.unwrap()[0].indexed);
        assert_eq!(app.index().count("alice").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn scope_rejects_pending_and_foreign_documents() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);
        app.upload_pages("alice", "Mine.pdf", &pages(1)).unwrap();
        app.upload_pages("bob", "Theirs.pdf", &pages(1)).unwrap();

        assert!(matches!(
            app.scope("alice", &["mine".into()]).await,
            Err(Error::NotIndexed { .. })
        ));
        assert!(matches!(
            app.scope("alice", &["theirs".into()]).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(app.scope("alice", &[]).await, Err(Error::EmptySelection)));

        app.reconcile("alice").await.unwrap();
        let scope = app.scope("alice", &["mine".into()]).await.unwrap();
        assert!(scope.matches("Mine.pdf"));
    }

    #[tokio::test]
    async fn session_uses_user_namespace() {
        let tmp = TempDir::new().unwrap();
        let app = app(&tmp);
        app.upload_pages("alice", "Mine.pdf", &pages(1)).unwrap();
        app.reconcile("alice").await.unwrap();

        let scope = app.scope("alice", &["mine".into()]).await.unwrap();
        let session = app.session("alice");
        let reply = session.submit("hi", &scope).await.unwrap();
        assert_eq!(reply.content, r#"alice asked "hi" over ["Mine.pdf"]"#);
    }

    #[tokio::test]
    async fn reopened_app_sees_earlier_uploads() {
        let tmp = TempDir::new().unwrap();
        {
            let app = app(&tmp);
            app.upload_pages("alice", "Annual Report.pdf", &pages(2)).unwrap();
        }
        let app = app(&tmp);
        assert!(app.store().contains("annual-report"));
        assert_eq!(app.documents("alice").await.unwrap()[0].title, "Annual Report.pdf");
    }

    #[tokio::test]
    async fn restart_over_memory_index_requeues_documents() {
        let tmp = TempDir::new().unwrap();
        {
            let app = app(&tmp);
            app.upload_pages("alice", "Annual Report.pdf", &pages(3)).unwrap();
            app.reconcile("alice").await.unwrap();
            assert!(app.documents("alice").await.unwrap()[0].indexed);
        }

        let app = app(&tmp);
        assert!(!app.documents("alice").await.unwrap()[0].indexed);
        assert!(matches!(
            app.scope("alice", &["annual-report".into()]).await,
            Err(Error::NotIndexed { .. })
        ));

        let report = app.reconcile("alice").await.unwrap();
        assert_eq!(report.indexed, vec!["annual-report"]);
        assert_eq!(app.index().count("alice").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn restart_over_default_index_keeps_vectors() {
        let tmp = TempDir::new().unwrap();
        {
            let app = App::from_config(Config::local(tmp.path())).await.unwrap();
            assert_eq!(app.config().index.backend, "sqlite");
            app.upload_pages("alice", "Annual Report.pdf", &pages(3)).unwrap();
            app.reconcile("alice").await.unwrap();
        }

        let app = App::from_config(Config::local(tmp.path())).await.unwrap();
        assert!(app.documents("alice").await.unwrap()[0].indexed);
        assert!(app.reconcile("alice").await.unwrap().indexed.is_empty());
        assert_eq!(app.index().count("alice").await.unwrap(), 3);

        let scope = app.scope("alice", &["annual-report".into()]).await.unwrap();
        let hits = app
            .index()
            .query("alice", &scope, "page 2 text", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
    }
}
