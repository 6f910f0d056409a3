//! Per-page text records for uploaded documents, keyed by canonical id.
//!
//! Every ingest is backed by a JSON cache file named after the raw
//! filename (`Annual Report.pdf` → `Annual Report.json`). When the cache
//! exists the records are loaded from it and extraction is skipped, so a
//! re-run produces byte-identical records.
//!
//! Two raw names that normalize to the same id are the same logical
//! document: the second ingest returns the existing id without touching
//! stored content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DocumentsConfig;
use crate::error::{Error, Result};
use crate::extract;
use crate::models::{DocumentId, DocumentRecord, RecordMetadata};
use crate::normalize::{normalize, strip_pdf_suffix};
use crate::persist;

struct StoredDocument {
    title: String,
    records: Vec<DocumentRecord>,
    fingerprint: String,
}

/// Summary of one stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub title: String,
    pub pages: usize,
}

pub struct DocumentStore {
    cache_dir: PathBuf,
    defaults: DocumentsConfig,
    docs: RwLock<HashMap<DocumentId, StoredDocument>>,
}

impl DocumentStore {
    /// Open a store over `cache_dir`, creating the directory if needed.
    ///
    /// Existing cache files are not loaded; call [`load_cached`](Self::load_cached).
    pub fn open(cache_dir: impl Into<PathBuf>, defaults: DocumentsConfig) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir).map_err(|e| Error::io(&cache_dir, e))?;
        Ok(Self {
            cache_dir,
            defaults,
            docs: RwLock::new(HashMap::new()),
        })
    }

    /// Load every `*.json` cache file under the cache directory.
    ///
    /// Returns the number of documents added. Unreadable files are skipped
    /// with a warning.
    pub fn load_cached(&self) -> Result<usize> {
        let mut loaded = 0;
        let mut paths: Vec<PathBuf> = WalkDir::new(&self.cache_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let records = match read_cache(&path) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable cache file");
                    continue;
                }
            };
            let title = records
                .first()
                .map(|r| r.metadata.title.clone())
                .or_else(|| {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(|s| format!("{}.pdf", s))
                })
                .unwrap_or_default();
            let id = normalize(&title);
            if self.insert(id, title, records) {
                loaded += 1;
            }
        }

        info!(documents = loaded, dir = %self.cache_dir.display(), "loaded cached documents");
        Ok(loaded)
    }

    /// Store page texts for `raw_name`, one record per page.
    pub fn ingest(&self, raw_name: &str, page_texts: &[String]) -> Result<DocumentId> {
        self.ingest_with(
            raw_name,
            || Some(fingerprint_pages(page_texts.iter().map(String::as_str))),
            || Ok(page_texts.to_vec()),
        )
    }

    /// Extract a PDF and store its pages. Extraction is skipped on a cache hit.
    ///
    /// When the id is already stored the upload is still extracted, only to
    /// compare fingerprints; a PDF that cannot be read is then not compared.
    pub fn ingest_pdf(&self, raw_name: &str, bytes: &[u8]) -> Result<DocumentId> {
        self.ingest_with(
            raw_name,
            || match extract::extract_pages(bytes, extract::MIME_PDF) {
                Ok(pages) => Some(fingerprint_pages(pages.iter().map(String::as_str))),
                Err(e) => {
                    debug!(raw_name, error = %e, "upload not fingerprinted");
                    None
                }
            },
            || Ok(extract::extract_pages(bytes, extract::MIME_PDF)?),
        )
    }

    fn ingest_with<G, F>(&self, raw_name: &str, fingerprint_fn: G, pages_fn: F) -> Result<DocumentId>
    where
        G: FnOnce() -> Option<String>,
        F: FnOnce() -> Result<Vec<String>>,
    {
        let id = normalize(raw_name);

        let existing = self
            .read()
            .get(&id)
            .map(|d| (d.title.clone(), d.fingerprint.clone()));
        if let Some((existing_title, existing_fingerprint)) = existing {
            if existing_title != raw_name {
                debug!(document_id = %id, existing = %existing_title, raw_name, "re-ingest under variant name");
            }
            if fingerprint_fn().is_some_and(|fp| fp != existing_fingerprint) {
                warn!(
                    document_id = %id,
                    existing = %existing_title,
                    raw_name,
                    "different content under a colliding document id; keeping existing"
                );
            }
            return Ok(id);
        }

        let cache_path = self.cache_path(raw_name);
        let (title, records) = if cache_path.exists() {
            debug!(path = %cache_path.display(), "cache hit");
            let records = read_cache(&cache_path)?;
            // Cached records keep the name they were first extracted under;
            // the vector index filters on that title.
            let title = records
                .first()
                .map(|r| r.metadata.title.clone())
                .unwrap_or_else(|| raw_name.to_string());
            (title, records)
        } else {
            let pages = pages_fn()?;
            let records = self.build_records(raw_name, &pages);
            persist::write_json_atomic(&cache_path, &records)?;
            debug!(path = %cache_path.display(), pages = records.len(), "cache written");
            (raw_name.to_string(), records)
        };

        info!(document_id = %id, raw_name, %title, pages = records.len(), "document ingested");
        self.insert(id.clone(), title, records);
        Ok(id)
    }

    /// Records for a document, in page order.
    pub fn get(&self, doc_id: &str) -> Result<Vec<DocumentRecord>> {
        self.read()
            .get(doc_id)
            .map(|d| d.records.clone())
            .ok_or_else(|| Error::NotFound(doc_id.to_string()))
    }

    /// The raw filename a canonical id was first ingested under.
    pub fn title(&self, doc_id: &str) -> Result<String> {
        self.read()
            .get(doc_id)
            .map(|d| d.title.clone())
            .ok_or_else(|| Error::NotFound(doc_id.to_string()))
    }

    /// SHA-256 over the document's page texts.
    pub fn fingerprint(&self, doc_id: &str) -> Result<String> {
        self.read()
            .get(doc_id)
            .map(|d| d.fingerprint.clone())
            .ok_or_else(|| Error::NotFound(doc_id.to_string()))
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.read().contains_key(doc_id)
    }

    /// All stored documents, sorted by id.
    pub fn list(&self) -> Vec<DocumentSummary> {
        let mut out: Vec<DocumentSummary> = self
            .read()
            .iter()
            .map(|(id, d)| DocumentSummary {
                id: id.clone(),
                title: d.title.clone(),
                pages: d.records.len(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Cache file for a raw filename: `.pdf` suffix replaced by `.json`.
    pub fn cache_path(&self, raw_name: &str) -> PathBuf {
        let stem: String = strip_pdf_suffix(raw_name)
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.cache_dir.join(format!("{}.json", stem))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn build_records(&self, raw_name: &str, pages: &[String]) -> Vec<DocumentRecord> {
        pages
            .iter()
            .enumerate()
            .map(|(i, text)| DocumentRecord {
                id: i.to_string(),
                text: text.clone(),
                source: format!("{}: page {}", raw_name, i + 1),
                metadata: RecordMetadata {
                    title: raw_name.to_string(),
                    primary_category: self.defaults.primary_category.clone(),
                    published: self.defaults.published,
                },
            })
            .collect()
    }

    /// Insert unless the id is already present. Returns whether it was added.
    fn insert(&self, id: DocumentId, title: String, records: Vec<DocumentRecord>) -> bool {
        let mut docs = self.write();
        if docs.contains_key(&id) {
            return false;
        }
        let fingerprint = fingerprint_pages(records.iter().map(|r| r.text.as_str()));
        docs.insert(
            id,
            StoredDocument {
                title,
                records,
                fingerprint,
            },
        );
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<DocumentId, StoredDocument>> {
        self.docs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<DocumentId, StoredDocument>> {
        self.docs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_cache(path: &Path) -> Result<Vec<DocumentRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
}

fn fingerprint_pages<'a>(pages: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for page in pages {
        hasher.update((page.len() as u64).to_le_bytes());
        hasher.update(page.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pages(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|s| s.to_string()).collect()
    }

    fn open(tmp: &TempDir) -> DocumentStore {
        DocumentStore::open(tmp.path().join("cache"), DocumentsConfig::default()).unwrap()
    }

    #[test]
    fn ingest_builds_sequential_page_records() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);

        let id = store
            .ingest("Annual Report.pdf", &pages(&["one", "two", "three"]))
            .unwrap();
        assert_eq!(id, "annual-report");

        let records = store.get(&id).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "0");
        assert_eq!(records[2].id, "2");
        assert_eq!(records[1].text, "two");
        assert_eq!(records[1].source, "Annual Report.pdf: page 2");
        assert_eq!(records[0].metadata.title, "Annual Report.pdf");
        assert_eq!(records[0].metadata.primary_category, "Finance");
        assert_eq!(records[0].metadata.published, 2024);
        assert_eq!(store.title(&id).unwrap(), "Annual Report.pdf");
    }

    #[test]
    fn get_unknown_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert!(matches!(store.get("nope"), Err(Error::NotFound(id)) if id == "nope"));
        assert!(matches!(store.title("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn cache_file_named_after_raw_name() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.ingest("Annual Report.pdf", &pages(&["a"])).unwrap();
        assert!(tmp.path().join("cache").join("Annual Report.json").exists());
        assert_eq!(
            store.cache_path("dir/x.PDF"),
            tmp.path().join("cache").join("dir_x.json")
        );
    }

    #[test]
    fn cache_hit_yields_identical_records_without_extraction() {
        let tmp = TempDir::new().unwrap();
        let first = open(&tmp);
        first
            .ingest("Annual Report.pdf", &pages(&["p1", "p2", "p3"]))
            .unwrap();
        let original = first.get("annual-report").unwrap();
        let cache = std::fs::read(first.cache_path("Annual Report.pdf")).unwrap();

        // Fresh store, same cache dir: the cached records win.
        let second = open(&tmp);
        second
            .ingest_pdf("Annual Report.pdf", b"not a pdf at all")
            .unwrap();
        assert_eq!(second.get("annual-report").unwrap(), original);
        assert_eq!(
            std::fs::read(second.cache_path("Annual Report.pdf")).unwrap(),
            cache
        );
    }

    #[test]
    fn cache_hit_under_variant_case_keeps_cached_title() {
        let tmp = TempDir::new().unwrap();
        open(&tmp)
            .ingest("Report.pdf", &pages(&["revenue", "costs"]))
            .unwrap();

        let store = open(&tmp);
        let id = store.ingest_pdf("Report.PDF", b"").unwrap();
        assert_eq!(id, "report");
        assert_eq!(store.title(&id).unwrap(), "Report.pdf");

        let scope = crate::scope::build_scope(&store, &[id.clone()]).unwrap();
        let records = store.get(&id).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| scope.matches(&r.metadata.title)));
    }

    #[test]
    fn variant_names_are_reingestion_of_one_document() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let a = store
            .ingest("Annual Report.pdf", &pages(&["first"]))
            .unwrap();
        let b = store
            .ingest("annual_report.PDF", &pages(&["different"]))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get(&a).unwrap()[0].text, "first");
        assert_eq!(store.title(&a).unwrap(), "Annual Report.pdf");
        assert!(!store.cache_path("annual_report.PDF").exists());
    }

    #[test]
    fn repeated_ingest_does_not_rewrite_cache() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.ingest("doc.pdf", &pages(&["x"])).unwrap();
        let path = store.cache_path("doc.pdf");
        std::fs::remove_file(&path).unwrap();
        store.ingest("doc.pdf", &pages(&["x"])).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn invalid_pdf_is_an_extract_error() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let err = store.ingest_pdf("broken.pdf", b"garbage").unwrap_err();
        assert!(matches!(err, Error::Extract(_)));
        assert!(!store.contains("broken"));
        assert!(!store.cache_path("broken.pdf").exists());
    }

    #[test]
    fn load_cached_restores_documents() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open(&tmp);
            store.ingest("Alpha.pdf", &pages(&["a1", "a2"])).unwrap();
            store.ingest("Beta Notes.pdf", &pages(&["b1"])).unwrap();
            store.ingest("Empty.pdf", &[]).unwrap();
        }
        std::fs::write(tmp.path().join("cache").join("junk.json"), "{not json").unwrap();

        let store = open(&tmp);
        assert_eq!(store.load_cached().unwrap(), 3);
        let ids: Vec<String> = store.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["alpha", "beta-notes", "empty"]);
        assert_eq!(store.title("beta-notes").unwrap(), "Beta Notes.pdf");
        assert_eq!(store.title("empty").unwrap(), "Empty.pdf");
        assert_eq!(store.get("alpha").unwrap().len(), 2);
    }

    #[test]
    fn fingerprint_depends_on_page_boundaries() {
        let a = fingerprint_pages(["ab", "c"].into_iter());
        let b = fingerprint_pages(["a", "bc"].into_iter());
        assert_ne!(a, b);
    }
}
