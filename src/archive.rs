//! Archive extraction.
//!
//! Unpacks `.tar.gz` / `.tgz` / `.tar` archives into a per-archive
//! directory. Archives that themselves arrive as top-level entries of the
//! outer archive are unpacked once more into the same directory and then
//! deleted; nesting deeper than that is left alone.
//!
//! A target only counts as extracted once it holds a completion marker
//! naming the archive it came from. A target without one is left over from
//! an interrupted run and is wiped and unpacked again.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{ArchiveFormat, LocalArchive};

/// Written into a target after a complete extraction; holds the archive name.
pub const COMPLETION_MARKER: &str = ".medcorpus-extracted";

/// What [`extract_archive`] did for one archive.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Nested archives that were unpacked and removed.
    pub nested: Vec<PathBuf>,
}

/// Fully unpack `archive` into `target`, then unwrap one level of nested
/// archives found at the top of `target`.
pub fn extract_archive(archive: &Path, target: &Path) -> Result<Extraction> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let format = ArchiveFormat::from_name(&name)
        .ok_or_else(|| anyhow::anyhow!("Not a supported archive: {}", archive.display()))?;

    std::fs::create_dir_all(target)
        .with_context(|| format!("Failed to create {}", target.display()))?;
    unpack(archive, format, target)?;

    let mut extraction = Extraction::default();
    for nested in top_level_archives(target)? {
        let nested_name = nested
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(nested_format) = ArchiveFormat::from_name(&nested_name) else {
            continue;
        };
        debug!(nested = %nested.display(), "unpacking nested archive");
        unpack(&nested, nested_format, target)
            .with_context(|| format!("Failed to unpack nested archive {}", nested_name))?;
        std::fs::remove_file(&nested)
            .with_context(|| format!("Failed to remove nested archive {}", nested.display()))?;
        extraction.nested.push(nested);
    }

    Ok(extraction)
}

fn unpack(archive: &Path, format: ArchiveFormat, target: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let reader: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(BufReader::new(file))),
        ArchiveFormat::Tar => Box::new(BufReader::new(file)),
    };
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(false);
    tar.unpack(target)
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    Ok(())
}

/// Regular files directly inside `dir` whose names mark them as archives.
fn top_level_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if ArchiveFormat::from_name(&entry.file_name().to_string_lossy()).is_some() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Per-archive target directory: `<extracted>/<archive stem>`.
pub fn target_dir(extracted_root: &Path, archive: &Path) -> Result<PathBuf> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow::anyhow!("Archive path has no file name: {}", archive.display()))?;
    let stem = ArchiveFormat::stem(&name);
    if stem.is_empty() {
        bail!("Archive name has an empty stem: {}", name);
    }
    Ok(extracted_root.join(stem))
}

#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: Vec<PathBuf>,
    /// Targets already completed by an earlier run.
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub nested: usize,
}

/// Extract each archive into its own directory under `extracted_root`.
///
/// A corrupt archive is reported and its partial target removed; the
/// remaining archives still run. Two archives with the same stem
/// (`a.tar.gz`, `a.tgz`) collide, and only the first is extracted.
pub fn extract_all(archives: &[LocalArchive], extracted_root: &Path) -> Result<ExtractReport> {
    std::fs::create_dir_all(extracted_root)
        .with_context(|| format!("Failed to create {}", extracted_root.display()))?;

    let mut report = ExtractReport::default();
    let mut claimed: HashMap<PathBuf, String> = HashMap::new();
    for archive in archives {
        let target = match target_dir(extracted_root, &archive.path) {
            Ok(t) => t,
            Err(e) => {
                report.failed.push((archive.path.clone(), format!("{:#}", e)));
                continue;
            }
        };
        let name = archive_name(&archive.path);

        if let Some(owner) = claimed.get(&target) {
            let cause = format!("target {} is already used by {}", target.display(), owner);
            warn!(archive = %archive.path.display(), "{}", cause);
            report.failed.push((archive.path.clone(), cause));
            continue;
        }
        claimed.insert(target.clone(), name.clone());

        match completed_by(&target) {
            Some(owner) if owner == name => {
                debug!(target = %target.display(), "already extracted, skipping");
                report.skipped.push(target);
                continue;
            }
            Some(owner) => {
                let cause = format!("target {} was extracted from {}", target.display(), owner);
                warn!(archive = %archive.path.display(), "{}", cause);
                report.failed.push((archive.path.clone(), cause));
                continue;
            }
            None if target.exists() => {
                warn!(target = %target.display(), "incomplete extraction found, starting over");
                if let Err(e) = std::fs::remove_dir_all(&target) {
                    let cause = format!("Failed to clear {}: {}", target.display(), e);
                    report.failed.push((archive.path.clone(), cause));
                    continue;
                }
            }
            None => {}
        }

        info!(archive = %archive.path.display(), target = %target.display(), "extracting");
        let result = extract_archive(&archive.path, &target).and_then(|extraction| {
            std::fs::write(target.join(COMPLETION_MARKER), &name)
                .with_context(|| format!("Failed to mark {} complete", target.display()))?;
            Ok(extraction)
        });
        match result {
            Ok(extraction) => {
                report.nested += extraction.nested.len();
                report.extracted.push(target);
            }
            Err(e) => {
                warn!(archive = %archive.path.display(), "extraction failed: {:#}", e);
                let _ = std::fs::remove_dir_all(&target);
                report.failed.push((archive.path.clone(), format!("{:#}", e)));
            }
        }
    }
    Ok(report)
}

fn archive_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Name of the archive that completed `target`, if any did.
fn completed_by(target: &Path) -> Option<String> {
    std::fs::read_to_string(target.join(COMPLETION_MARKER))
        .ok()
        .map(|raw| raw.trim().to_string())
}

/// Archives sitting in the download directory, sorted by name.
pub fn downloaded_archives(download_dir: &Path) -> Result<Vec<LocalArchive>> {
    if !download_dir.exists() {
        return Ok(Vec::new());
    }
    let mut archives: Vec<LocalArchive> = top_level_archives(download_dir)?
        .into_iter()
        .map(|path| LocalArchive { path, key: None })
        .collect();
    archives.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(archives)
}

/// `medcorpus extract`
pub fn run_extract(config: &Config) -> Result<ExtractReport> {
    let archives = downloaded_archives(&config.paths.downloads)?;
    let report = extract_all(&archives, &config.paths.extracted)?;

    println!("extract {}", config.paths.downloads.display());
    println!("  archives: {}", archives.len());
    println!("  extracted: {}", report.extracted.len());
    println!("  nested archives unpacked: {}", report.nested);
    println!("  already extracted: {}", report.skipped.len());
    println!("  failed: {}", report.failed.len());
    for (path, cause) in &report.failed {
        println!("    {}: {}", path.display(), cause);
    }

    Ok(report)
}
