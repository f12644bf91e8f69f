//! Pipeline status overview.
//!
//! Counts what each stage has produced so far: downloaded archives,
//! extracted documents, transformed records, processing-log outcomes and
//! corpus entries. Used by `medcorpus stats`.

use anyhow::Result;

use crate::archive::downloaded_archives;
use crate::config::Config;
use crate::load::record_files;
use crate::locate::DocumentLocator;
use crate::store::CorpusStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogCounts {
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl LogCounts {
    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.errors
    }
}

/// Tally the outcome lines of a processing log.
pub fn count_log_lines(log: &str) -> LogCounts {
    let mut counts = LogCounts::default();
    for line in log.lines() {
        if line.starts_with("Processed: ") {
            counts.processed += 1;
        } else if line.starts_with("Skipped: ") {
            counts.skipped += 1;
        } else if line.starts_with("Error processing ") {
            counts.errors += 1;
        }
    }
    counts
}

/// `medcorpus stats`
pub async fn run_stats(config: &Config) -> Result<()> {
    let archives = downloaded_archives(&config.paths.downloads)?;
    let archive_bytes: u64 = archives
        .iter()
        .filter_map(|a| std::fs::metadata(&a.path).ok())
        .map(|m| m.len())
        .sum();

    let locator = DocumentLocator::new(&config.paths.extracted, &config.processing.include_globs);
    let documents = match locator {
        Ok(locator) => locator.iter().filter(|entry| entry.is_ok()).count(),
        Err(_) => 0,
    };

    let records = if config.paths.processed.exists() {
        record_files(&config.paths.processed)?.len()
    } else {
        0
    };

    let log = std::fs::read_to_string(&config.paths.log_file)
        .map(|raw| count_log_lines(&raw))
        .unwrap_or_default();

    let store = CorpusStore::open(&config.corpus).await?;
    let entries = store.count().await?;
    let embedded = store.count_embedded().await?;
    let collection = store.collection().to_string();
    store.close().await;

    let db_size = std::fs::metadata(config.corpus.db_path())
        .map(|m| m.len())
        .unwrap_or(0);

    println!("medcorpus status");
    println!("================");
    println!();
    println!(
        "  Archives:    {} ({})  {}",
        archives.len(),
        format_bytes(archive_bytes),
        config.paths.downloads.display()
    );
    println!("  Documents:   {}  {}", documents, config.paths.extracted.display());
    println!("  Records:     {}  {}", records, config.paths.processed.display());
    println!(
        "  Log:         {} lines ({} processed, {} skipped, {} errors)",
        log.total(),
        log.processed,
        log.skipped,
        log.errors
    );
    println!();
    println!(
        "  Collection:  {} ({})",
        collection,
        config.corpus.db_path().display()
    );
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Entries:     {}", entries);
    println!(
        "  Embedded:    {} / {} ({}%)",
        embedded,
        entries,
        if entries > 0 { (embedded * 100) / entries } else { 0 }
    );
    println!();

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_are_tallied_by_outcome() {
        let log = "Processed: /x/a.xml\n\
                   Skipped: /x/b.xml (output already exists)\n\
                   Error processing /x/c.xml: malformed XML at byte 3: boom\n\
                   Processed: /x/d.xml\n\
                   \n";
        let counts = count_log_lines(log);
        assert_eq!(
            counts,
            LogCounts {
                processed: 2,
                skipped: 1,
                errors: 1
            }
        );
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
