//! Core data models used throughout the pipeline.
//!
//! These types describe what flows between the stages: remote archives,
//! local archive files, transformed records on disk, and entries in the
//! corpus store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Compression format of an archive, derived from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
}

impl ArchiveFormat {
    /// Detect the format from a key or file name, or `None` if it is not an
    /// archive this pipeline can unpack.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }

    /// Strip the archive suffix from a file name (`a.tar.gz` → `a`).
    pub fn stem(name: &str) -> &str {
        let lower = name.to_ascii_lowercase();
        for suffix in [".tar.gz", ".tgz", ".tar"] {
            if lower.ends_with(suffix) {
                return &name[..name.len() - suffix.len()];
            }
        }
        name
    }
}

/// An archive object listed from the remote store.
#[derive(Debug, Clone)]
pub struct RemoteArchive {
    /// Full object key.
    pub key: String,
    /// Size in bytes as reported by the store.
    pub size: u64,
    pub format: Option<ArchiveFormat>,
}

impl RemoteArchive {
    pub fn new(key: String, size: u64) -> Self {
        let format = ArchiveFormat::from_name(&key);
        Self { key, size, format }
    }

    /// The last path segment of the key, used as the local file name.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// An archive present on local disk, ready for extraction.
#[derive(Debug, Clone)]
pub struct LocalArchive {
    pub path: PathBuf,
    /// Remote key it was downloaded from, if known.
    pub key: Option<String>,
}

/// The per-document JSON record written by the transformer and read by the
/// corpus loader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformedRecord {
    /// Explicit corpus id. Never written by the transformer; honoured by the
    /// loader when records are produced elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub text: String,
}

impl TransformedRecord {
    /// The corpus id: the explicit `id` when present and non-empty,
    /// otherwise the source `filename`.
    pub fn corpus_id(&self) -> &str {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => &self.filename,
        }
    }
}

/// Metadata stored alongside each corpus entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryMetadata {
    pub title: String,
    pub filename: String,
}

/// A document registered in the vector-indexed corpus store.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusEntry {
    pub id: String,
    pub document: String,
    pub metadata: EntryMetadata,
}

pub const UNTITLED: &str = "Untitled Article";

impl From<TransformedRecord> for CorpusEntry {
    fn from(record: TransformedRecord) -> Self {
        let id = record.corpus_id().to_string();
        let title = record
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| UNTITLED.to_string());
        CorpusEntry {
            id,
            document: record.text,
            metadata: EntryMetadata {
                title,
                filename: record.filename,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_format_from_suffix() {
        assert_eq!(
            ArchiveFormat::from_name("oa_comm_xml.PMC001.tar.gz"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(ArchiveFormat::from_name("x.TGZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_name("x.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_name("x.zip"), None);
        assert_eq!(ArchiveFormat::stem("batch.2024.tar.gz"), "batch.2024");
        assert_eq!(ArchiveFormat::stem("inner.tgz"), "inner");
    }

    #[test]
    fn remote_file_name_is_last_segment() {
        let a = RemoteArchive::new("oa_bulk/comm/part1.tar.gz".into(), 10);
        assert_eq!(a.file_name(), "part1.tar.gz");
        assert_eq!(a.format, Some(ArchiveFormat::TarGz));
    }

    #[test]
    fn corpus_id_prefers_explicit_id() {
        let mut record = TransformedRecord {
            id: Some("PMC42".into()),
            filename: "PMC42.xml".into(),
            title: None,
            text: String::new(),
        };
        assert_eq!(record.corpus_id(), "PMC42");
        record.id = Some("  ".into());
        assert_eq!(record.corpus_id(), "PMC42.xml");
        record.id = None;
        assert_eq!(record.corpus_id(), "PMC42.xml");
    }

    #[test]
    fn entry_defaults_title() {
        let record: TransformedRecord =
            serde_json::from_str(r#"{"filename": "a.xml", "text": "body"}"#).unwrap();
        let entry = CorpusEntry::from(record);
        assert_eq!(entry.id, "a.xml");
        assert_eq!(entry.metadata.title, UNTITLED);
        assert_eq!(entry.metadata.filename, "a.xml");
    }

    #[test]
    fn missing_text_deserializes_empty() {
        let record: TransformedRecord = serde_json::from_str(r#"{"filename": "a.xml"}"#).unwrap();
        assert_eq!(record.text, "");
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"filename":"a.xml","text":""}"#);
    }
}
