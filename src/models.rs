//! Core data models shared by the store, registry, index, and session.
//!
//! Page records are the unit of storage and retrieval: one
//! [`DocumentRecord`] per extracted PDF page.

use serde::{Deserialize, Serialize};

/// Canonical, lower-case, alphanumeric-and-hyphen document key.
///
/// Produced by [`normalize`](crate::normalize::normalize).
pub type DocumentId = String;

/// One page of extracted text. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// 0-based page index as a string, unique within its document.
    pub id: String,
    pub text: String,
    /// `"<title>: page <n>"` with 1-based `n`.
    pub source: String,
    pub metadata: RecordMetadata,
}

/// Metadata stamped on every page record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// The raw filename the document was uploaded under.
    pub title: String,
    pub primary_category: String,
    pub published: i32,
}

/// A page record in the vector store's representation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    /// `"<canonical-id>#<page-id>"`, unique within a namespace.
    pub id: String,
    pub document_id: DocumentId,
    pub text: String,
    pub source: String,
    pub metadata: serde_json::Value,
}

impl IndexDocument {
    pub fn from_record(document_id: &str, record: &DocumentRecord) -> Self {
        Self {
            id: format!("{}#{}", document_id, record.id),
            document_id: document_id.to_string(),
            text: record.text.clone(),
            source: record.source.clone(),
            metadata: serde_json::json!({
                "title": record.metadata.title,
                "primary_category": record.metadata.primary_category,
                "published": record.metadata.published,
                "document_id": document_id,
            }),
        }
    }

    /// The title this record is filtered on during scoped retrieval.
    pub fn title(&self) -> &str {
        self.metadata
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
    }
}

/// A ranked context chunk returned by a vector query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextChunk {
    pub id: String,
    pub document_id: DocumentId,
    pub title: String,
    pub source: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}
