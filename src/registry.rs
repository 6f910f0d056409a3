//! Per-user document membership and indexing state.
//!
//! The registry is a single JSON file shared by every process serving the
//! same data directory:
//!
//! ```text
//! {
//!   "<scope>": {
//!     "<user>": { "documents": [...], "indexed": [...] }
//!   }
//! }
//! ```
//!
//! `<scope>` is the logical index name, so several indexes can share one
//! registry file. Every mutation is a locked read-modify-write-replace:
//!
//! 1. take the in-process mutex, then an exclusive advisory lock on
//!    `<registry>.lock`,
//! 2. re-read the file from disk,
//! 3. apply the change,
//! 4. atomically replace the file.
//!
//! Interleaved `add_documents`/`mark_indexed` calls from different tabs or
//! processes therefore never lose updates. A lock that cannot be taken
//! within the configured timeout surfaces as
//! [`Error::RegistryWriteConflict`].
//!
//! All calls block on file I/O and, under contention, on the lock. Async
//! code goes through [`TenantRegistry::run_blocking`].

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::DocumentId;
use crate::persist;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Documents known to one user and the subset already upserted.
///
/// Invariant: `indexed ⊆ documents`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    #[serde(default)]
    pub documents: BTreeSet<DocumentId>,
    #[serde(default)]
    pub indexed: BTreeSet<DocumentId>,
}

impl TenantRecord {
    pub fn is_indexed(&self, id: &str) -> bool {
        self.indexed.contains(id)
    }

    /// Known documents not yet upserted, in id order.
    pub fn pending(&self) -> impl Iterator<Item = &DocumentId> {
        self.documents.difference(&self.indexed)
    }

    pub fn is_reconciled(&self) -> bool {
        self.indexed == self.documents
    }
}

type ScopeMap = BTreeMap<String, TenantRecord>;
type RegistryFile = BTreeMap<String, ScopeMap>;

/// Handle to the registry file. Clones share the in-process mutex.
#[derive(Clone)]
pub struct TenantRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    scope: String,
    lock_timeout: Duration,
    local: Arc<Mutex<()>>,
}

impl TenantRegistry {
    pub fn new(path: impl Into<PathBuf>, scope: impl Into<String>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_name = OsString::from(path.as_os_str());
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            scope: scope.into(),
            lock_timeout,
            local: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Return the user's record, creating an empty one if absent.
    pub fn ensure_user(&self, user: &str) -> Result<TenantRecord> {
        if let Some(record) = self.get(user)? {
            return Ok(record);
        }
        self.mutate(|scope| Ok(scope.entry(user.to_string()).or_default().clone()))
    }

    /// Current record for `user`, if any. Reads the file fresh.
    pub fn get(&self, user: &str) -> Result<Option<TenantRecord>> {
        let mut file = self.read_file()?;
        Ok(file
            .remove(&self.scope)
            .and_then(|mut scope| scope.remove(user)))
    }

    /// All users in this registry's scope.
    pub fn users(&self) -> Result<Vec<String>> {
        let file = self.read_file()?;
        Ok(file
            .get(&self.scope)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Union `ids` into the user's known documents.
    pub fn add_documents<I, S>(&self, user: &str, ids: I) -> Result<TenantRecord>
    where
        I: IntoIterator<Item = S>,
        S: Into<DocumentId>,
    {
        let ids: Vec<DocumentId> = ids.into_iter().map(Into::into).collect();
        self.mutate(|scope| {
            let record = scope.entry(user.to_string()).or_default();
            record.documents.extend(ids);
            debug!(user, documents = record.documents.len(), "documents registered");
            Ok(record.clone())
        })
    }

    /// Record that `id` has been upserted for `user`.
    ///
    /// Fails with [`Error::UnknownDocument`] when `id` is not among the
    /// user's documents, keeping `indexed ⊆ documents`.
    pub fn mark_indexed(&self, user: &str, id: &str) -> Result<TenantRecord> {
        self.mutate(|scope| {
            let record = scope
                .get_mut(user)
                .filter(|r| r.documents.contains(id))
                .ok_or_else(|| Error::UnknownDocument {
                    user: user.to_string(),
                    document_id: id.to_string(),
                })?;
            record.indexed.insert(id.to_string());
            debug!(user, document_id = id, "document marked indexed");
            Ok(record.clone())
        })
    }

    pub fn is_indexed(&self, user: &str, id: &str) -> Result<bool> {
        Ok(self.get(user)?.is_some_and(|r| r.is_indexed(id)))
    }

    /// Forget every `indexed` mark in this scope; documents stay registered.
    ///
    /// Used when the vector index does not survive restarts, so nothing a
    /// previous process upserted can still be found. Returns the number of
    /// marks dropped.
    pub fn reset_indexed(&self) -> Result<usize> {
        let marked = self
            .read_file()?
            .get(&self.scope)
            .is_some_and(|users| users.values().any(|r| !r.indexed.is_empty()));
        if !marked {
            return Ok(0);
        }
        self.mutate(|scope| {
            let mut dropped = 0;
            for record in scope.values_mut() {
                dropped += record.indexed.len();
                record.indexed.clear();
            }
            debug!(scope = %self.scope, dropped, "indexed marks reset");
            Ok(dropped)
        })
    }

    /// Run `op` against this registry on tokio's blocking pool.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&TenantRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || op(&registry))
            .await
            .map_err(|e| Error::io(&self.path, std::io::Error::other(e)))?
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut ScopeMap) -> Result<T>) -> Result<T> {
        let _local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = self.acquire_lock()?;

        let mut file = self.read_file()?;
        let out = f(file.entry(self.scope.clone()).or_default())?;
        persist::write_json_atomic(&self.path, &file)?;
        Ok(out)
    }

    fn read_file(&self) -> Result<RegistryFile> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RegistryFile::new()),
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(RegistryFile::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn acquire_lock(&self) -> Result<LockGuard> {
        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| Error::io(&self.lock_path, e))?;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(LockGuard(file)),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= self.lock_timeout {
                        return Err(Error::RegistryWriteConflict {
                            path: self.path.clone(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(Error::io(&self.lock_path, e)),
            }
        }
    }
}

struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}
