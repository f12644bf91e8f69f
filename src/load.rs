//! Corpus loading: processed records → corpus store.
//!
//! Every `*.json` record in the processed directory is registered in the
//! configured collection under its corpus id. A record that cannot be read
//! or parsed is reported and skipped. Once all records are stored, entries
//! without an up-to-date vector are embedded in batches; if the provider is
//! disabled or a batch fails, those entries stay pending for a later run.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{Config, EmbeddingConfig};
use crate::embedding::{create_provider, embed_texts};
use crate::models::{CorpusEntry, TransformedRecord};
use crate::store::{CorpusStore, UpsertOutcome};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub invalid: usize,
    pub embedded: usize,
    pub pending: usize,
}

impl LoadReport {
    pub fn loaded(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Record files directly under `dir`, sorted by name.
pub fn record_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read records directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn read_record(path: &Path) -> Result<TransformedRecord> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let record: TransformedRecord = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid record {}", path.display()))?;
    Ok(record)
}

/// Register every record in `records_dir`, then embed what is pending.
pub async fn load_records(
    store: &CorpusStore,
    records_dir: &Path,
    embedding: &EmbeddingConfig,
) -> Result<LoadReport> {
    let mut report = LoadReport::default();

    for path in record_files(records_dir)? {
        report.records += 1;
        let entry = match read_record(&path) {
            Ok(record) => CorpusEntry::from(record),
            Err(e) => {
                warn!("skipping record: {:#}", e);
                report.invalid += 1;
                continue;
            }
        };
        match store.upsert(&entry).await {
            Ok(UpsertOutcome::Inserted) => report.inserted += 1,
            Ok(UpsertOutcome::Updated) => report.updated += 1,
            Ok(UpsertOutcome::Unchanged) => report.unchanged += 1,
            Err(e) => {
                warn!(id = %entry.id, "failed to store {}: {:#}", path.display(), e);
                report.invalid += 1;
            }
        }
    }

    let (embedded, pending) = embed_pending(store, embedding).await?;
    report.embedded = embedded;
    report.pending = pending;
    Ok(report)
}

/// Returns `(embedded, still pending)`.
async fn embed_pending(store: &CorpusStore, config: &EmbeddingConfig) -> Result<(usize, usize)> {
    if !config.is_enabled() {
        let pending = store.count().await? - store.count_embedded().await?;
        return Ok((0, pending.max(0) as usize));
    }

    let provider = match create_provider(config) {
        Ok(p) => p,
        Err(e) => {
            warn!("could not create embedding provider: {:#}", e);
            let pending = store.count().await? - store.count_embedded().await?;
            return Ok((0, pending.max(0) as usize));
        }
    };
    let model = provider.model_name().to_string();

    let pending = store.pending_embeddings(&model).await?;
    if pending.is_empty() {
        return Ok((0, 0));
    }
    info!(count = pending.len(), model = %model, "embedding corpus entries");

    let mut embedded = 0;
    let mut failed = 0;
    for batch in pending.chunks(config.batch_size) {
        let texts: Vec<String> = batch.iter().map(|p| p.document.clone()).collect();
        match embed_texts(provider.as_ref(), config, &texts).await {
            Ok(vectors) => {
                for (entry, vector) in batch.iter().zip(&vectors) {
                    match store.set_embedding(&entry.id, &model, vector).await {
                        Ok(()) => embedded += 1,
                        Err(e) => {
                            warn!(id = %entry.id, "failed to store embedding: {:#}", e);
                            failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("embedding batch failed: {:#}", e);
                failed += batch.len();
            }
        }
    }
    Ok((embedded, failed))
}

/// `medcorpus load`
pub async fn run_load(config: &Config) -> Result<LoadReport> {
    let store = CorpusStore::open(&config.corpus).await?;
    let report = load_records(&store, &config.paths.processed, &config.embedding).await?;
    let total = store.count().await?;

    println!("load {}", config.paths.processed.display());
    println!("  records scanned: {}", report.records);
    println!("  loaded: {}", report.loaded());
    println!(
        "    inserted: {}, updated: {}, unchanged: {}",
        report.inserted, report.updated, report.unchanged
    );
    println!("  invalid: {}", report.invalid);
    println!("  embedded: {}", report.embedded);
    println!("  pending embeddings: {}", report.pending);
    println!(
        "  collection: {} ({} entries) at {}",
        store.collection(),
        total,
        config.corpus.db_path().display()
    );

    store.close().await;
    Ok(report)
}
