//! Batch progress reporting.
//!
//! The coordinator emits one event when discovery finishes and one per
//! completed batch. Progress goes to **stderr** so the stdout summary stays
//! parseable for scripts.

use std::io::Write;

/// A single progress event for `medcorpus process`.
#[derive(Clone, Debug)]
pub enum BatchProgressEvent {
    /// Discovery finished; `total` documents will be attempted.
    Discovered { total: u64, batches: u64 },
    /// Batch `batch` (1-based) drained and was written to the log.
    BatchDone {
        batch: u64,
        batches: u64,
        done: u64,
        total: u64,
        failed: u64,
    },
}

/// Reports batch progress. Implementations write to stderr (human or JSON).
pub trait BatchProgressReporter: Send + Sync {
    fn report(&self, event: BatchProgressEvent);
}

/// Human-friendly progress: "process  batch 3 / 12  300 / 1,150 documents  (2 failed)".
pub struct StderrProgress;

impl BatchProgressReporter for StderrProgress {
    fn report(&self, event: BatchProgressEvent) {
        let line = match &event {
            BatchProgressEvent::Discovered { total, batches } => format!(
                "process  discovered {} documents in {} batches\n",
                format_number(*total),
                format_number(*batches)
            ),
            BatchProgressEvent::BatchDone {
                batch,
                batches,
                done,
                total,
                failed,
            } => format!(
                "process  batch {} / {}  {} / {} documents  ({} failed)\n",
                format_number(*batch),
                format_number(*batches),
                format_number(*done),
                format_number(*total),
                format_number(*failed)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BatchProgressReporter for JsonProgress {
    fn report(&self, event: BatchProgressEvent) {
        let obj = match &event {
            BatchProgressEvent::Discovered { total, batches } => serde_json::json!({
                "event": "progress",
                "phase": "discovered",
                "total": total,
                "batches": batches
            }),
            BatchProgressEvent::BatchDone {
                batch,
                batches,
                done,
                total,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "phase": "batch",
                "batch": batch,
                "batches": batches,
                "n": done,
                "total": total,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl BatchProgressReporter for NoProgress {
    fn report(&self, _event: BatchProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BatchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
