//! Error taxonomy for the reconciliation and retrieval core.
//!
//! Collaborators (embedding, vector index, completion model) report
//! `anyhow` errors; the coordinator and session translate those into the
//! typed variants below at their boundary.

use std::path::PathBuf;

use crate::extract::ExtractError;
use crate::models::DocumentId;

pub type Result<T> = std::result::Result<T, Error>;

/// A vector-store rejection for one document.
///
/// Never returned as an [`Error`]: reconciliation collects these in its
/// report next to the documents that did index, and the document stays
/// pending for the next run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upsert of document '{document_id}' failed: {reason}")]
pub struct UpsertFailure {
    pub document_id: DocumentId,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("document not found: {0}")]
    NotFound(DocumentId),

    #[error("no documents selected; select at least one document")]
    EmptySelection,

    #[error("a reply is already in flight for this session")]
    SessionBusy,

    #[error("registry {} is locked by another writer", path.display())]
    RegistryWriteConflict { path: PathBuf },

    #[error("document '{document_id}' is not registered for user '{user}'")]
    UnknownDocument { user: String, document_id: DocumentId },

    #[error("document '{document_id}' is still pending indexing")]
    NotIndexed { document_id: DocumentId },

    #[error("completion failed: {reason}")]
    Completion { prompt: String, reason: String },

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
