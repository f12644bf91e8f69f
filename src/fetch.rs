//! Archive fetcher.
//!
//! Lists the configured remote store and downloads every archive whose key
//! matches `[fetch].include_globs` into the download directory. An archive
//! whose local file already exists is never downloaded again, and a failed
//! download is reported without stopping the others.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{LocalArchive, RemoteArchive};
use crate::remote::{self, ObjectStore};

/// Outcome of one fetch run.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Objects matching the archive patterns.
    pub matched: usize,
    pub downloaded: Vec<LocalArchive>,
    /// Archives already present locally.
    pub skipped: Vec<LocalArchive>,
    /// `(key, cause)` for each failed download.
    pub failed: Vec<(String, String)>,
    pub bytes: u64,
}

impl FetchReport {
    /// Every archive now available locally, downloaded or pre-existing.
    pub fn local_archives(&self) -> impl Iterator<Item = &LocalArchive> {
        self.skipped.iter().chain(self.downloaded.iter())
    }
}

/// Downloads archives from an [`ObjectStore`] into a local directory.
pub struct ArchiveFetcher<'a> {
    store: &'a dyn ObjectStore,
    prefix: String,
    download_dir: PathBuf,
    include: GlobSet,
    limit: Option<usize>,
}

impl<'a> ArchiveFetcher<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        prefix: &str,
        download_dir: &Path,
        include_globs: &[String],
        limit: Option<usize>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            prefix: prefix.to_string(),
            download_dir: download_dir.to_path_buf(),
            include: build_globset(include_globs)?,
            limit,
        })
    }

    /// Archives in the listing that match the include patterns.
    pub fn select<'b>(&self, listing: &'b [RemoteArchive]) -> Vec<&'b RemoteArchive> {
        listing
            .iter()
            .filter(|obj| self.include.is_match(relative_key(&obj.key, &self.prefix)))
            .collect()
    }

    /// Downloads this run, not pre-existing archives, count toward the limit.
    fn limit_reached(&self, report: &FetchReport) -> bool {
        self.limit.is_some_and(|limit| report.downloaded.len() >= limit)
    }

    pub async fn run(&self) -> Result<FetchReport> {
        std::fs::create_dir_all(&self.download_dir).with_context(|| {
            format!(
                "Failed to create download directory {}",
                self.download_dir.display()
            )
        })?;

        // A failed listing means nothing can be fetched at all.
        let listing = self
            .store
            .list(&self.prefix)
            .await
            .with_context(|| format!("Failed to list {}", self.store.location()))?;
        let selected = self.select(&listing);

        let mut report = FetchReport {
            matched: selected.len(),
            ..Default::default()
        };

        for obj in selected {
            if self.limit_reached(&report) {
                info!(limit = ?self.limit, "download limit reached, stopping");
                break;
            }

            let local_path = self.download_dir.join(obj.file_name());
            let local = LocalArchive {
                path: local_path.clone(),
                key: Some(obj.key.clone()),
            };

            if local_path.exists() {
                info!(key = %obj.key, path = %local_path.display(), "already downloaded, skipping");
                report.skipped.push(local);
                continue;
            }

            match self.download_one(obj, &local_path).await {
                Ok(bytes) => {
                    info!(key = %obj.key, bytes, "downloaded");
                    report.bytes += bytes;
                    report.downloaded.push(local);
                }
                Err(e) => {
                    warn!(key = %obj.key, "download failed: {:#}", e);
                    report.failed.push((obj.key.clone(), format!("{:#}", e)));
                }
            }
        }

        Ok(report)
    }

    /// Download into `<name>.part` and rename on success, so a partial file
    /// never satisfies the "already exists" check.
    async fn download_one(&self, obj: &RemoteArchive, local_path: &Path) -> Result<u64> {
        let part_path = part_path(local_path);
        let result = self.store.download(&obj.key, &part_path).await;
        match result {
            Ok(bytes) => {
                tokio::fs::rename(&part_path, local_path)
                    .await
                    .with_context(|| format!("Failed to move {} into place", part_path.display()))?;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                Err(e)
            }
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Key relative to the listing prefix, for glob matching.
fn relative_key<'k>(key: &'k str, prefix: &str) -> &'k str {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return key;
    }
    key.strip_prefix(prefix)
        .map(|s| s.trim_start_matches('/'))
        .unwrap_or(key)
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// `medcorpus fetch`
pub async fn run_fetch(config: &Config, limit: Option<usize>) -> Result<FetchReport> {
    let store = remote::open_store(config)?;
    let remote = config.remote()?;
    let fetcher = ArchiveFetcher::new(
        store.as_ref(),
        remote.prefix(),
        &config.paths.downloads,
        &config.fetch.include_globs,
        limit.or(config.fetch.limit),
    )?;

    let report = fetcher.run().await?;

    println!("fetch {}", store.location());
    println!("  archives matched: {}", report.matched);
    println!("  downloaded: {}", report.downloaded.len());
    println!("  already present: {}", report.skipped.len());
    println!("  failed: {}", report.failed.len());
    for (key, cause) in &report.failed {
        println!("    {}: {}", key, cause);
    }
    println!("  bytes: {}", report.bytes);

    Ok(report)
}
