//! # docchat
//!
//! Multi-tenant chat over uploaded PDFs.
//!
//! Users upload PDFs; each document is split into per-page records, cached
//! on disk, and registered against the user. Reconciliation upserts every
//! pending document into the user's namespace of one shared vector index.
//! Conversations retrieve context only from that namespace and only from
//! the documents the user selected.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────────────┐
//! │  Upload  │──▶│ DocumentStore │──▶│ TenantRegistry   │
//! │  (PDF)   │   │ page cache    │   │ documents/indexed│
//! └──────────┘   └───────┬───────┘   └────────┬─────────┘
//!                        │   reconcile        │
//!                        ▼                    ▼
//!                 ┌─────────────────────────────────┐
//!                 │ VectorIndex (namespace = user)  │
//!                 └───────────────┬─────────────────┘
//!                                 │ scoped query
//!                                 ▼
//!                 ┌─────────────────────────────────┐
//!                 │ Session ─▶ RagChat ─▶ model     │
//!                 └─────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docchat upload --user alice "Annual Report.pdf"
//! docchat index --user alice
//! docchat ask --user alice --doc annual-report "What was revenue?"
//! docchat serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`normalize`] | Filename → canonical document id |
//! | [`extract`] | PDF bytes → page texts |
//! | [`document_store`] | Per-page records and their JSON cache |
//! | [`registry`] | Per-user documents and indexed sets |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Namespace-partitioned vector index |
//! | [`indexer`] | Reconciliation of pending documents |
//! | [`scope`] | Title filter for retrieval |
//! | [`chat`] | Completion model and retrieval-augmented chat |
//! | [`session`] | Conversation state and citation highlighting |
//! | [`app`] | Application context tying the above together |
//! | [`server`] | HTTP JSON API |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod chat;
pub mod config;
pub mod db;
pub mod document_store;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod http;
pub mod index;
pub mod indexer;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod persist;
pub mod registry;
pub mod scope;
pub mod server;
pub mod session;

pub use error::{Error, Result};
