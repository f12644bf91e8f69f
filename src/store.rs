//! SQLite-backed corpus store.
//!
//! One database file (`<corpus.path>/corpus.sqlite`) may hold several named
//! collections. Each entry is keyed by `(collection, id)` and carries the
//! document text, its metadata as JSON, a SHA-256 of the document text, and
//! optionally an embedding vector.
//!
//! Re-upserting an entry with unchanged text keeps its embedding. A changed
//! text clears the vector so the loader embeds it again.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::config::CorpusConfig;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{CorpusEntry, EntryMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// An entry waiting for a vector.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub document: String,
}

#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: CorpusEntry,
    pub score: f32,
}

pub struct CorpusStore {
    pool: SqlitePool,
    collection: String,
}

impl CorpusStore {
    /// Open (creating if needed) the store described by `config`.
    pub async fn open(config: &CorpusConfig) -> Result<Self> {
        let pool = connect(&config.db_path()).await?;
        migrate(&pool).await?;
        Ok(Self {
            pool,
            collection: config.collection.clone(),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Insert or replace an entry by id.
    pub async fn upsert(&self, entry: &CorpusEntry) -> Result<UpsertOutcome> {
        let hash = hash_text(&entry.document);
        let metadata_json = serde_json::to_string(&entry.metadata)?;

        let existing: Option<(String, String)> = sqlx::query_as(
            "SELECT hash, metadata_json FROM corpus_entries WHERE collection = ? AND id = ?",
        )
        .bind(&self.collection)
        .bind(&entry.id)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = match &existing {
            None => UpsertOutcome::Inserted,
            Some((old_hash, old_meta)) if *old_hash == hash && *old_meta == metadata_json => {
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) => UpsertOutcome::Updated,
        };

        sqlx::query(
            r#"
            INSERT INTO corpus_entries (collection, id, document, metadata_json, hash, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                document = excluded.document,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at,
                embedding = CASE WHEN corpus_entries.hash = excluded.hash
                                 THEN corpus_entries.embedding ELSE NULL END,
                model = CASE WHEN corpus_entries.hash = excluded.hash
                             THEN corpus_entries.model ELSE NULL END,
                dims = CASE WHEN corpus_entries.hash = excluded.hash
                            THEN corpus_entries.dims ELSE NULL END,
                hash = excluded.hash
            "#,
        )
        .bind(&self.collection)
        .bind(&entry.id)
        .bind(&entry.document)
        .bind(&metadata_json)
        .bind(&hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(outcome)
    }

    /// Entries with no vector, or a vector from another model.
    pub async fn pending_embeddings(&self, model: &str) -> Result<Vec<PendingEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document FROM corpus_entries
            WHERE collection = ? AND (embedding IS NULL OR model IS NULL OR model != ?)
            ORDER BY id
            "#,
        )
        .bind(&self.collection)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PendingEntry {
                id: row.get("id"),
                document: row.get("document"),
            })
            .collect())
    }

    pub async fn set_embedding(&self, id: &str, model: &str, vector: &[f32]) -> Result<()> {
        sqlx::query(
            "UPDATE corpus_entries SET embedding = ?, model = ?, dims = ? WHERE collection = ? AND id = ?",
        )
        .bind(vec_to_blob(vector))
        .bind(model)
        .bind(vector.len() as i64)
        .bind(&self.collection)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<CorpusEntry>> {
        let row = sqlx::query(
            "SELECT id, document, metadata_json FROM corpus_entries WHERE collection = ? AND id = ?",
        )
        .bind(&self.collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_entry(&row)).transpose()
    }

    pub async fn count(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM corpus_entries WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_embedded(&self) -> Result<i64> {
        let n = sqlx::query_scalar(
            "SELECT COUNT(*) FROM corpus_entries WHERE collection = ? AND embedding IS NOT NULL",
        )
        .bind(&self.collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Top `limit` entries by cosine similarity to `query`, best first.
    /// Only vectors produced by `model` are compared.
    pub async fn similar(
        &self,
        model: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document, metadata_json, embedding FROM corpus_entries
            WHERE collection = ? AND embedding IS NOT NULL AND model = ?
            "#,
        )
        .bind(&self.collection)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(query, &blob_to_vec(&blob));
            scored.push(ScoredEntry {
                entry: row_to_entry(row)?,
                score,
            });
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create corpus directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open corpus store {}", db_path.display()))?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpus_entries (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            document TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            model TEXT,
            dims INTEGER,
            embedding BLOB,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_corpus_entries_model ON corpus_entries(collection, model)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<CorpusEntry> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: EntryMetadata = serde_json::from_str(&metadata_json)
        .with_context(|| "Corrupt metadata in corpus store".to_string())?;
    Ok(CorpusEntry {
        id: row.get("id"),
        document: row.get("document"),
        metadata,
    })
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
