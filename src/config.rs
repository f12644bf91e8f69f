//! TOML configuration.
//!
//! Every section except `[remote]` has defaults that reproduce the standard
//! on-disk layout, so an almost empty file is a valid configuration:
//!
//! ```toml
//! [paths]
//! downloads = "./downloads"
//! extracted = "./extracted"
//! processed = "./processed_data"
//! log_file = "./processing_log.txt"
//!
//! [remote]
//! kind = "s3"
//! bucket = "wearables-data-insights"
//! region = "auto"
//! endpoint_url = "https://storage.googleapis.com"
//!
//! [processing]
//! batch_size = 100
//! workers = 8
//! max_file_bytes = 52428800
//!
//! [corpus]
//! path = "./chroma_db"
//! collection = "medical_articles"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_downloads")]
    pub downloads: PathBuf,
    #[serde(default = "default_extracted")]
    pub extracted: PathBuf,
    #[serde(default = "default_processed")]
    pub processed: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads: default_downloads(),
            extracted: default_extracted(),
            processed: default_processed(),
            log_file: default_log_file(),
        }
    }
}

fn default_downloads() -> PathBuf {
    PathBuf::from("./downloads")
}
fn default_extracted() -> PathBuf {
    PathBuf::from("./extracted")
}
fn default_processed() -> PathBuf {
    PathBuf::from("./processed_data")
}
fn default_log_file() -> PathBuf {
    PathBuf::from("./processing_log.txt")
}

/// Where archives are listed and downloaded from.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    S3(S3RemoteConfig),
    Local(LocalRemoteConfig),
}

/// An S3-compatible bucket (AWS S3, MinIO, GCS interoperability endpoint).
#[derive(Debug, Deserialize, Clone)]
pub struct S3RemoteConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint, addressed path-style (`<endpoint>/<bucket>/<key>`).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// A local directory laid out like a bucket.
#[derive(Debug, Deserialize, Clone)]
pub struct LocalRemoteConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub prefix: String,
}

impl RemoteConfig {
    pub fn prefix(&self) -> &str {
        match self {
            RemoteConfig::S3(c) => &c.prefix,
            RemoteConfig::Local(c) => &c.prefix,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_archive_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            include_globs: default_archive_globs(),
            limit: None,
        }
    }
}

fn default_archive_globs() -> Vec<String> {
    vec!["**/*.tar.gz".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Documents larger than this are skipped rather than parsed.
    #[serde(default)]
    pub max_file_bytes: Option<u64>,
    #[serde(default = "default_document_globs")]
    pub include_globs: Vec<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            max_file_bytes: None,
            include_globs: default_document_globs(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_document_globs() -> Vec<String> {
    vec!["**/*.xml".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// Directory holding the persistent vector store.
    #[serde(default = "default_corpus_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: default_corpus_path(),
            collection: default_collection(),
        }
    }
}

fn default_corpus_path() -> PathBuf {
    PathBuf::from("./chroma_db")
}
fn default_collection() -> String {
    "medical_articles".to_string()
}

impl CorpusConfig {
    /// The SQLite file inside the store directory.
    pub fn db_path(&self) -> PathBuf {
        self.path.join("corpus.sqlite")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_batch_size() -> usize {
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

impl Config {
    /// The `[remote]` section, or a fatal error when it is missing.
    pub fn remote(&self) -> Result<&RemoteConfig> {
        self.remote
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("[remote] is not configured; nothing to fetch from"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    validate(&config)?;
    Ok(config)
}

fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.processing.batch_size == 0 {
        bail!("processing.batch_size must be > 0");
    }
    if config.processing.workers == 0 {
        bail!("processing.workers must be > 0");
    }
    if config.corpus.collection.trim().is_empty() {
        bail!("corpus.collection must not be empty");
    }
    if let Some(RemoteConfig::S3(s3)) = &config.remote {
        if s3.bucket.is_empty() {
            bail!("remote.bucket must not be empty");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_default_layout() {
        let config = parse_config("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.paths.downloads, PathBuf::from("./downloads"));
        assert_eq!(config.paths.processed, PathBuf::from("./processed_data"));
        assert_eq!(config.paths.log_file, PathBuf::from("./processing_log.txt"));
        assert_eq!(config.corpus.collection, "medical_articles");
        assert_eq!(config.fetch.include_globs, vec!["**/*.tar.gz"]);
        assert_eq!(config.processing.include_globs, vec!["**/*.xml"]);
        assert!(config.remote.is_none());
        assert!(config.remote().is_err());
    }

    #[test]
    fn remote_kind_selects_variant() {
        let config = parse_config(
            r#"
            [remote]
            kind = "s3"
            bucket = "articles"
            endpoint_url = "https://storage.googleapis.com"
            "#,
        )
        .unwrap();
        match config.remote().unwrap() {
            RemoteConfig::S3(s3) => {
                assert_eq!(s3.bucket, "articles");
                assert_eq!(s3.region, "us-east-1");
                assert_eq!(s3.prefix, "");
            }
            other => panic!("unexpected remote: {:?}", other),
        }

        let config = parse_config(
            r#"
            [remote]
            kind = "local"
            root = "/srv/mirror"
            prefix = "oa_bulk/"
            "#,
        )
        .unwrap();
        assert_eq!(config.remote().unwrap().prefix(), "oa_bulk/");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = parse_config("[processing]\nbatch_size = 0\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn enabled_provider_needs_model_and_dims() {
        let config = parse_config("[embedding]\nprovider = \"openai\"\n").unwrap();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("embedding.dims"), "{}", err);

        let config = parse_config("[embedding]\nprovider = \"chroma\"\n").unwrap();
        assert!(validate(&config).is_err());
    }
}
