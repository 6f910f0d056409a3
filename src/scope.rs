//! Retrieval scope: which documents a query may draw context from.
//!
//! A scope is a metadata filter meaning "title is one of these", built
//! fresh per query from the user's current selection. An empty selection
//! is rejected rather than turned into an unfiltered query.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::document_store::DocumentStore;
use crate::error::{Error, Result};
use crate::models::DocumentId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalScope {
    titles: BTreeSet<String>,
}

impl RetrievalScope {
    /// Scope over explicit titles. Fails with [`Error::EmptySelection`] when empty.
    pub fn from_titles<I, S>(titles: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let titles: BTreeSet<String> = titles.into_iter().map(Into::into).collect();
        if titles.is_empty() {
            return Err(Error::EmptySelection);
        }
        Ok(Self { titles })
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.titles.iter().map(String::as_str)
    }

    pub fn matches(&self, title: &str) -> bool {
        self.titles.contains(title)
    }

    /// Filter in the vector-store metadata syntax: `{"title": {"$in": [...]}}`.
    pub fn to_filter(&self) -> Value {
        serde_json::json!({ "title": { "$in": self.titles } })
    }
}

/// Map selected canonical ids back to their titles and build the scope.
pub fn build_scope(store: &DocumentStore, selected_ids: &[DocumentId]) -> Result<RetrievalScope> {
    if selected_ids.is_empty() {
        return Err(Error::EmptySelection);
    }
    let titles = selected_ids
        .iter()
        .map(|id| store.title(id))
        .collect::<Result<Vec<String>>>()?;
    RetrievalScope::from_titles(titles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocumentsConfig;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> DocumentStore {
        let store =
            DocumentStore::open(tmp.path().join("cache"), DocumentsConfig::default()).unwrap();
        for name in ["Annual Report.pdf", "Budget 2025.pdf", "Minutes.pdf"] {
            store.ingest(name, &["page".to_string()]).unwrap();
        }
        store
    }

    #[test]
    fn empty_selection_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(matches!(build_scope(&store, &[]), Err(Error::EmptySelection)));
        assert!(matches!(
            RetrievalScope::from_titles(Vec::<String>::new()),
            Err(Error::EmptySelection)
        ));
    }

    #[test]
    fn ids_map_back_to_titles() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let scope = build_scope(
            &store,
            &["annual-report".to_string(), "budget-2025".to_string()],
        )
        .unwrap();
        assert!(scope.matches("Annual Report.pdf"));
        assert!(scope.matches("Budget 2025.pdf"));
        assert!(!scope.matches("Minutes.pdf"));
        assert_eq!(
            scope.to_filter(),
            serde_json::json!({"title": {"$in": ["Annual Report.pdf", "Budget 2025.pdf"]}})
        );
    }

    #[test]
    fn unknown_id_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let err = build_scope(&store, &["annual-report".to_string(), "ghost".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(id) if id == "ghost"));
    }
}
