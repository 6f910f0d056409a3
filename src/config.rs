use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub cache_dir: PathBuf,
    pub registry_path: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Logical shared index name; also the registry scope key.
    #[serde(default = "default_index_name")]
    pub name: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite file; defaults to `index.sqlite` beside the registry.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_upsert_timeout_secs")]
    pub upsert_timeout_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: default_index_name(),
            backend: default_backend(),
            path: None,
            top_k: default_top_k(),
            upsert_timeout_secs: default_upsert_timeout_secs(),
        }
    }
}

fn default_index_name() -> String {
    "docchat".to_string()
}
fn default_backend() -> String {
    "sqlite".to_string()
}

const DEFAULT_INDEX_FILE: &str = "index.sqlite";
fn default_top_k() -> usize {
    5
}
fn default_upsert_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DocumentsConfig {
    #[serde(default = "default_primary_category")]
    pub primary_category: String,
    #[serde(default = "default_published")]
    pub published: i32,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            primary_category: default_primary_category(),
            published: default_published(),
        }
    }
}

fn default_primary_category() -> String {
    "Finance".to_string()
}
fn default_published() -> i32 {
    2024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_seed")]
    pub seed: Option<i64>,
    #[serde(default = "default_chat_retries")]
    pub max_retries: u32,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_chat_provider(),
            model: default_chat_model(),
            temperature: 0.0,
            seed: default_seed(),
            max_retries: default_chat_retries(),
            timeout_secs: default_chat_timeout_secs(),
            base_url: default_base_url(),
        }
    }
}

fn default_chat_provider() -> String {
    "disabled".to_string()
}
fn default_chat_model() -> String {
    "gpt-4-0125-preview".to_string()
}
fn default_seed() -> Option<i64> {
    Some(42)
}
fn default_chat_retries() -> u32 {
    3
}
fn default_chat_timeout_secs() -> u64 {
    120
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

impl Config {
    /// Config rooted at `data_dir` with a SQLite index and offline embeddings.
    pub fn local(data_dir: &Path) -> Self {
        Self {
            storage: StorageConfig {
                cache_dir: data_dir.join("cache"),
                registry_path: data_dir.join("registry.json"),
                lock_timeout_ms: default_lock_timeout_ms(),
            },
            index: IndexConfig {
                path: Some(data_dir.join(DEFAULT_INDEX_FILE)),
                ..IndexConfig::default()
            },
            documents: DocumentsConfig::default(),
            embedding: EmbeddingConfig {
                provider: "hash".to_string(),
                dims: Some(256),
                ..EmbeddingConfig::default()
            },
            chat: ChatConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    if config.index.path.is_none() {
        config.index.path = Some(
            config
                .storage
                .registry_path
                .with_file_name(DEFAULT_INDEX_FILE),
        );
    }
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.index.top_k < 1 {
        anyhow::bail!("index.top_k must be >= 1");
    }

    match config.index.backend.as_str() {
        "memory" => {}
        "sqlite" => {
            if config.index.path.is_none() {
                anyhow::bail!("index.path must be set when backend is 'sqlite'");
            }
        }
        other => anyhow::bail!(
            "Unknown index backend: '{}'. Must be memory or sqlite.",
            other
        ),
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "hash" {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
            other
        ),
    }

    match config.chat.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown chat provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if !(0.0..=2.0).contains(&config.chat.temperature) {
        anyhow::bail!("chat.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(tmp: &TempDir, body: &str) -> PathBuf {
        let path = tmp.path().join("docchat.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    const MINIMAL: &str = r#"
[storage]
cache_dir = "./data/cache"
registry_path = "./data/registry.json"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config(&write(&tmp, MINIMAL)).unwrap();
        assert_eq!(cfg.index.name, "docchat");
        assert_eq!(cfg.index.backend, "sqlite");
        assert_eq!(
            cfg.index.path.as_deref(),
            Some(Path::new("./data/index.sqlite"))
        );
        assert_eq!(cfg.index.top_k, 5);
        assert_eq!(cfg.documents.primary_category, "Finance");
        assert_eq!(cfg.documents.published, 2024);
        assert_eq!(cfg.chat.model, "gpt-4-0125-preview");
        assert_eq!(cfg.chat.seed, Some(42));
        assert_eq!(cfg.chat.temperature, 0.0);
        assert_eq!(cfg.storage.lock_timeout_ms, 5000);
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn sqlite_backend_requires_path() {
        let mut cfg = Config::local(Path::new("/tmp/docchat"));
        validate(&cfg).unwrap();
        cfg.index.path = None;
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("index.path"));
    }

    #[test]
    fn explicit_index_path_is_kept() {
        let tmp = TempDir::new().unwrap();
        let body = format!("{}\n[index]\npath = \"/srv/vectors.db\"\n", MINIMAL);
        let cfg = load_config(&write(&tmp, &body)).unwrap();
        assert_eq!(cfg.index.path.as_deref(), Some(Path::new("/srv/vectors.db")));
    }

    #[test]
    fn hash_embedder_needs_only_dims() {
        let tmp = TempDir::new().unwrap();
        let body = format!("{}\n[embedding]\nprovider = \"hash\"\ndims = 64\n", MINIMAL);
        let cfg = load_config(&write(&tmp, &body)).unwrap();
        assert_eq!(cfg.embedding.dims, Some(64));

        let body = format!("{}\n[embedding]\nprovider = \"openai\"\ndims = 64\n", MINIMAL);
        let err = load_config(&write(&tmp, &body)).unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn unknown_providers_rejected() {
        let tmp = TempDir::new().unwrap();
        let body = format!("{}\n[chat]\nprovider = \"parrot\"\n", MINIMAL);
        assert!(load_config(&write(&tmp, &body)).is_err());

        let body = format!("{}\n[index]\nbackend = \"pinecone\"\n", MINIMAL);
        assert!(load_config(&write(&tmp, &body)).is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/docchat.example.toml");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.index.backend, "sqlite");
        assert_eq!(cfg.embedding.dims, Some(1536));
        assert_eq!(cfg.server.bind, "127.0.0.1:8501");
    }

    #[test]
    fn temperature_range_checked() {
        let tmp = TempDir::new().unwrap();
        let body = format!("{}\n[chat]\ntemperature = 3.5\n", MINIMAL);
        let err = load_config(&write(&tmp, &body)).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }
}
