//! Batch coordination of document transforms.
//!
//! Documents are split into consecutive batches of at most `batch_size`.
//! Each batch is fanned out over a pool of at most `workers` concurrent
//! transforms (blocking threads gated by a semaphore). Only after every
//! transform in the batch has finished does the coordinator append the
//! batch's log lines, so the log file has a single writer and a completed
//! batch is always fully logged before the next one starts.

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::locate::DocumentLocator;
use crate::progress::{BatchProgressEvent, BatchProgressReporter, NoProgress, ProgressMode};
use crate::transform::{transform_document, TransformOptions, TransformOutcome};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub discovered: usize,
    pub attempted: usize,
    pub transformed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batches_completed: usize,
    pub batches_total: usize,
}

pub struct BatchCoordinator {
    options: Arc<TransformOptions>,
    batch_size: usize,
    workers: usize,
    log_path: PathBuf,
    max_batches: Option<usize>,
    progress: Box<dyn BatchProgressReporter>,
}

impl BatchCoordinator {
    pub fn new(
        options: TransformOptions,
        batch_size: usize,
        workers: usize,
        log_path: &Path,
    ) -> Self {
        Self {
            options: Arc::new(options),
            batch_size: batch_size.max(1),
            workers: workers.max(1),
            log_path: log_path.to_path_buf(),
            max_batches: None,
            progress: Box::new(NoProgress),
        }
    }

    /// Stop after this many batches.
    pub fn with_max_batches(mut self, max_batches: Option<usize>) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn BatchProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Transform every document, batch by batch, logging each outcome.
    ///
    /// Per-document failures are logged and counted. A failure to write the
    /// log aborts the run, since the log is the record of completed batches.
    pub async fn run(&self, documents: &[PathBuf]) -> Result<BatchReport> {
        std::fs::create_dir_all(&self.options.output_dir).with_context(|| {
            format!(
                "Failed to create output directory {}",
                self.options.output_dir.display()
            )
        })?;

        let batches_total = documents.len().div_ceil(self.batch_size);
        let mut report = BatchReport {
            discovered: documents.len(),
            batches_total,
            ..Default::default()
        };
        self.progress.report(BatchProgressEvent::Discovered {
            total: documents.len() as u64,
            batches: batches_total as u64,
        });

        let semaphore = Arc::new(Semaphore::new(self.workers));

        for (index, batch) in documents.chunks(self.batch_size).enumerate() {
            if self.max_batches.is_some_and(|max| index >= max) {
                debug!(completed = index, "batch limit reached, stopping");
                break;
            }

            let outcomes = self.run_batch(batch, &semaphore).await;
            append_log(&self.log_path, &outcomes)?;

            for outcome in &outcomes {
                match outcome {
                    TransformOutcome::Transformed { .. } => report.transformed += 1,
                    TransformOutcome::Skipped { .. } => report.skipped += 1,
                    TransformOutcome::Failed { source, cause } => {
                        warn!(path = %source.display(), "transform failed: {}", cause);
                        report.failed += 1;
                    }
                }
            }
            report.attempted += outcomes.len();
            report.batches_completed += 1;

            self.progress.report(BatchProgressEvent::BatchDone {
                batch: (index + 1) as u64,
                batches: batches_total as u64,
                done: report.attempted as u64,
                total: documents.len() as u64,
                failed: report.failed as u64,
            });
        }

        Ok(report)
    }

    /// Run one batch to completion. Outcomes are returned in input order.
    async fn run_batch(
        &self,
        batch: &[PathBuf],
        semaphore: &Arc<Semaphore>,
    ) -> Vec<TransformOutcome> {
        let tasks = batch.iter().cloned().map(|path| {
            let semaphore = semaphore.clone();
            let options = self.options.clone();
            async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return TransformOutcome::Failed {
                        source: path,
                        cause: "worker pool closed".to_string(),
                    };
                };
                let source = path.clone();
                match tokio::task::spawn_blocking(move || transform_document(&path, &options)).await
                {
                    Ok(outcome) => outcome,
                    Err(e) => TransformOutcome::Failed {
                        source,
                        cause: format!("worker panicked: {}", e),
                    },
                }
            }
        });
        join_all(tasks).await
    }
}

/// Append one line per outcome and sync the file.
fn append_log(path: &Path, outcomes: &[TransformOutcome]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open processing log {}", path.display()))?;

    let mut lines = String::new();
    for outcome in outcomes {
        lines.push_str(&outcome.log_line());
        lines.push('\n');
    }
    file.write_all(lines.as_bytes())
        .and_then(|_| file.sync_data())
        .with_context(|| format!("Failed to append to processing log {}", path.display()))?;
    Ok(())
}

/// Overrides for a `medcorpus process` run.
#[derive(Debug, Default, Clone)]
pub struct ProcessArgs {
    pub batch_size: Option<usize>,
    pub workers: Option<usize>,
    pub max_batches: Option<usize>,
    pub resume: bool,
    pub progress: Option<ProgressMode>,
}

/// `medcorpus process`
pub async fn run_process(config: &Config, args: &ProcessArgs) -> Result<BatchReport> {
    let batch_size = args.batch_size.unwrap_or(config.processing.batch_size);
    let workers = args.workers.unwrap_or(config.processing.workers);
    if batch_size == 0 {
        bail!("batch size must be > 0");
    }
    if workers == 0 {
        bail!("workers must be > 0");
    }

    let locator = DocumentLocator::new(&config.paths.extracted, &config.processing.include_globs)?;

    let mut documents = Vec::new();
    for entry in locator.iter() {
        match entry {
            Ok(path) => documents.push(path),
            Err(e) => warn!(
                "skipping unreadable entry under {}: {:#}",
                locator.root().display(),
                e
            ),
        }
    }

    let options = TransformOptions {
        output_dir: config.paths.processed.clone(),
        max_file_bytes: config.processing.max_file_bytes,
        resume: args.resume,
    };
    let progress = args.progress.unwrap_or_else(ProgressMode::default_for_tty);

    let coordinator = BatchCoordinator::new(options, batch_size, workers, &config.paths.log_file)
        .with_max_batches(args.max_batches)
        .with_progress(progress.reporter());
    let report = coordinator.run(&documents).await?;

    println!("process {}", config.paths.extracted.display());
    println!("  documents discovered: {}", report.discovered);
    println!(
        "  batches: {} / {} (size {}, workers {})",
        report.batches_completed, report.batches_total, batch_size, workers
    );
    println!("  transformed: {}", report.transformed);
    println!("  skipped: {}", report.skipped);
    println!("  failed: {}", report.failed);
    println!("  log: {}", config.paths.log_file.display());

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        docs: Vec<PathBuf>,
        output_dir: PathBuf,
        log: PathBuf,
    }

    /// `good` well-formed documents followed by `bad` malformed ones.
    fn fixture(good: usize, bad: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("extracted");
        fs::create_dir_all(&src).unwrap();
        let mut docs = Vec::new();
        for i in 0..good {
            let path = src.join(format!("doc{:03}.xml", i));
            fs::write(&path, format!("<article><p>document {}</p></article>", i)).unwrap();
            docs.push(path);
        }
        for i in 0..bad {
            let path = src.join(format!("bad{:03}.xml", i));
            fs::write(&path, "<article><p>unterminated").unwrap();
            docs.push(path);
        }
        let output_dir = tmp.path().join("processed_data");
        let log = tmp.path().join("processing_log.txt");
        Fixture {
            _tmp: tmp,
            docs,
            output_dir,
            log,
        }
    }

    fn coordinator(f: &Fixture, batch_size: usize, workers: usize) -> BatchCoordinator {
        let options = TransformOptions {
            output_dir: f.output_dir.clone(),
            max_file_bytes: None,
            resume: false,
        };
        BatchCoordinator::new(options, batch_size, workers, &f.log)
    }

    fn log_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn one_log_line_per_document() {
        let f = fixture(7, 3);
        let report = coordinator(&f, 4, 3).run(&f.docs).await.unwrap();

        assert_eq!(report.discovered, 10);
        assert_eq!(report.attempted, 10);
        assert_eq!(report.transformed, 7);
        assert_eq!(report.failed, 3);
        assert_eq!(report.batches_total, 3);
        assert_eq!(report.batches_completed, 3);

        let lines = log_lines(&f.log);
        assert_eq!(lines.len(), 10);
        for doc in &f.docs {
            let name = doc.display().to_string();
            assert_eq!(
                lines.iter().filter(|l| l.contains(&name)).count(),
                1,
                "{} should be logged exactly once",
                name
            );
        }
    }

    #[tokio::test]
    async fn failures_logged_without_output() {
        let f = fixture(2, 2);
        coordinator(&f, 10, 2).run(&f.docs).await.unwrap();

        for doc in &f.docs {
            let name = doc.file_name().unwrap().to_string_lossy().to_string();
            let output = f.output_dir.join(format!("{}.json", name));
            if name.starts_with("bad") {
                assert!(!output.exists());
                assert!(log_lines(&f.log)
                    .iter()
                    .any(|l| l.starts_with("Error processing ") && l.contains(&name)));
            } else {
                let record: serde_json::Value =
                    serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
                assert_eq!(record["filename"], name.as_str());
            }
        }
    }

    #[tokio::test]
    async fn stopping_after_first_batch_leaves_second_untouched() {
        let batch_size = 5;
        let f = fixture(2 * batch_size + 1, 0);
        let report = coordinator(&f, batch_size, 2)
            .with_max_batches(Some(1))
            .run(&f.docs)
            .await
            .unwrap();

        assert_eq!(report.batches_total, 3);
        assert_eq!(report.batches_completed, 1);
        assert_eq!(report.attempted, batch_size);
        assert_eq!(log_lines(&f.log).len(), batch_size);

        for (i, doc) in f.docs.iter().enumerate() {
            let name = doc.file_name().unwrap().to_string_lossy().to_string();
            let output = f.output_dir.join(format!("{}.json", name));
            assert_eq!(output.exists(), i < batch_size, "{}", name);
        }
    }

    #[tokio::test]
    async fn log_is_appended_across_runs() {
        let f = fixture(3, 0);
        coordinator(&f, 2, 1).run(&f.docs).await.unwrap();
        coordinator(&f, 2, 1).run(&f.docs).await.unwrap();
        assert_eq!(log_lines(&f.log).len(), 6);
    }

    #[tokio::test]
    async fn zero_overrides_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.paths.extracted = tmp.path().join("extracted");
        config.paths.processed = tmp.path().join("processed_data");
        config.paths.log_file = tmp.path().join("processing_log.txt");
        fs::create_dir_all(&config.paths.extracted).unwrap();

        let args = ProcessArgs {
            batch_size: Some(0),
            ..Default::default()
        };
        let err = run_process(&config, &args).await.unwrap_err();
        assert!(err.to_string().contains("batch size"), "{}", err);

        let args = ProcessArgs {
            workers: Some(0),
            ..Default::default()
        };
        let err = run_process(&config, &args).await.unwrap_err();
        assert!(err.to_string().contains("workers"), "{}", err);
        assert!(!config.paths.log_file.exists());
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let f = fixture(0, 0);
        let report = coordinator(&f, 10, 4).run(&f.docs).await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert!(!f.log.exists());
    }
}
