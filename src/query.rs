//! Similarity search over the loaded collection.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::embedding::{create_provider, embed_query};
use crate::store::{CorpusStore, ScoredEntry};

const EXCERPT_CHARS: usize = 240;

/// Embed `text` and return the `limit` nearest entries.
pub async fn search(
    config: &Config,
    store: &CorpusStore,
    text: &str,
    limit: usize,
) -> Result<Vec<ScoredEntry>> {
    if !config.embedding.is_enabled() {
        bail!("Similarity search requires an embedding provider (set [embedding] provider)");
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let provider = create_provider(&config.embedding)?;
    let vector = embed_query(provider.as_ref(), &config.embedding, text).await?;
    store.similar(provider.model_name(), &vector, limit).await
}

/// `medcorpus query`
pub async fn run_query(config: &Config, text: &str, limit: usize) -> Result<()> {
    let store = CorpusStore::open(&config.corpus).await?;
    let results = search(config, &store, text, limit).await;
    store.close().await;
    let results = results?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in results.iter().enumerate() {
        println!("{}. [{:.2}] {}", i + 1, hit.score, hit.entry.metadata.title);
        println!("    file: {}", hit.entry.metadata.filename);
        println!("    excerpt: \"{}\"", excerpt(&hit.entry.document));
        println!("    id: {}", hit.entry.id);
        println!();
    }
    Ok(())
}

fn excerpt(document: &str) -> String {
    let flat = document.replace('\n', " ");
    let trimmed = flat.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_flattens_and_truncates() {
        assert_eq!(excerpt("a\nb \n"), "a b");
        let long = "é".repeat(300);
        let cut = excerpt(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 3);
    }

    #[tokio::test]
    async fn disabled_provider_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.corpus.path = tmp.path().join("chroma_db");
        let store = CorpusStore::open(&config.corpus).await.unwrap();
        let err = search(&config, &store, "sleep", 5).await.unwrap_err();
        assert!(err.to_string().contains("embedding provider"));
    }
}
