//! Per-document transformation: XML file → `<filename>.json` record.
//!
//! [`transform_document`] never returns an error and never panics on bad
//! input; every problem is folded into a [`TransformOutcome`] so that the
//! batch coordinator can log it and move on.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::TransformedRecord;
use crate::partition::{elements_to_text, find_title, partition_xml};

/// Settings shared by every transform in a run.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub output_dir: PathBuf,
    /// Skip documents larger than this many bytes.
    pub max_file_bytes: Option<u64>,
    /// Skip documents whose output file already exists.
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge { size: u64, limit: u64 },
    AlreadyProcessed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TooLarge { size, limit } => {
                write!(f, "{} bytes exceeds limit of {} bytes", size, limit)
            }
            SkipReason::AlreadyProcessed => write!(f, "output already exists"),
        }
    }
}

/// Result of transforming one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Transformed { source: PathBuf, output: PathBuf },
    Skipped { source: PathBuf, reason: SkipReason },
    Failed { source: PathBuf, cause: String },
}

impl TransformOutcome {
    pub fn source(&self) -> &Path {
        match self {
            TransformOutcome::Transformed { source, .. }
            | TransformOutcome::Skipped { source, .. }
            | TransformOutcome::Failed { source, .. } => source,
        }
    }

    /// The processing-log line for this outcome.
    pub fn log_line(&self) -> String {
        match self {
            TransformOutcome::Transformed { source, .. } => {
                format!("Processed: {}", source.display())
            }
            TransformOutcome::Skipped { source, reason } => {
                format!("Skipped: {} ({})", source.display(), reason)
            }
            TransformOutcome::Failed { source, cause } => {
                format!("Error processing {}: {}", source.display(), cause)
            }
        }
    }
}

/// Output path for a source document: `<output_dir>/<file name>.json`.
pub fn output_path(output_dir: &Path, source: &Path) -> Option<PathBuf> {
    let name = source.file_name()?;
    let mut json_name = name.to_os_string();
    json_name.push(".json");
    Some(output_dir.join(json_name))
}

/// Transform one document.
pub fn transform_document(source: &Path, options: &TransformOptions) -> TransformOutcome {
    let source_buf = source.to_path_buf();

    let Some(output) = output_path(&options.output_dir, source) else {
        return TransformOutcome::Failed {
            source: source_buf,
            cause: "path has no file name".to_string(),
        };
    };

    if options.resume && output.exists() {
        return TransformOutcome::Skipped {
            source: source_buf,
            reason: SkipReason::AlreadyProcessed,
        };
    }

    if let Some(limit) = options.max_file_bytes {
        match std::fs::metadata(source) {
            Ok(meta) if meta.len() > limit => {
                return TransformOutcome::Skipped {
                    source: source_buf,
                    reason: SkipReason::TooLarge {
                        size: meta.len(),
                        limit,
                    },
                };
            }
            Ok(_) => {}
            Err(e) => {
                return TransformOutcome::Failed {
                    source: source_buf,
                    cause: format!("cannot stat file: {}", e),
                };
            }
        }
    }

    match build_record(source).and_then(|record| write_record(&output, &record)) {
        Ok(()) => TransformOutcome::Transformed {
            source: source_buf,
            output,
        },
        Err(e) => TransformOutcome::Failed {
            source: source_buf,
            cause: format!("{:#}", e),
        },
    }
}

/// Read and partition a document into its record.
pub fn build_record(source: &Path) -> Result<TransformedRecord> {
    let xml = std::fs::read_to_string(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    let elements = partition_xml(&xml)?;

    let filename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(TransformedRecord {
        id: None,
        filename,
        title: find_title(&elements),
        text: elements_to_text(&elements),
    })
}

/// Write through a temporary sibling and rename, so a failed write never
/// leaves a partial record behind.
fn write_record(output: &Path, record: &TransformedRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    let mut tmp_name = output.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = output.with_file_name(tmp_name);

    let write = || -> Result<()> {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&json)?;
        file.sync_all()?;
        std::fs::rename(&tmp, output)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        Ok(())
    };

    write().inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}
