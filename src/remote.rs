//! Remote object stores that archives are fetched from.
//!
//! The [`ObjectStore`] trait is the seam between the fetcher and wherever
//! the archives live. Two implementations ship with the crate:
//!
//! - [`S3Store`](crate::remote_s3::S3Store) for S3-compatible buckets.
//! - [`LocalDirStore`] for a directory laid out like a bucket (mirrors,
//!   network mounts, tests).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{Config, RemoteConfig};
use crate::models::RemoteArchive;
use crate::remote_s3::S3Store;

/// A read-only store of archive objects keyed by name.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location (e.g. `s3://bucket/prefix`).
    fn location(&self) -> String;

    /// List every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteArchive>>;

    /// Download `key` into `dest`, returning the number of bytes written.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64>;
}

/// Build the store described by `[remote]`.
///
/// Fails when the section is missing or the store cannot be initialised
/// (for S3, missing credentials); both abort the run.
pub fn open_store(config: &Config) -> Result<Box<dyn ObjectStore>> {
    match config.remote()? {
        RemoteConfig::S3(s3) => Ok(Box::new(S3Store::from_env(s3.clone())?)),
        RemoteConfig::Local(local) => Ok(Box::new(LocalDirStore::new(local.root.clone())?)),
    }
}

/// Object store backed by a local directory; keys are `/`-separated paths
/// relative to the root.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            bail!("Local store root does not exist: {}", root.display());
        }
        Ok(Self { root })
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    fn location(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteArchive>> {
        let mut objects = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            let size = entry.metadata()?.len();
            objects.push(RemoteArchive::new(key, size));
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let source = key
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment));
        tokio::fs::copy(&source, dest)
            .await
            .with_context(|| format!("Failed to copy {} to {}", source.display(), dest.display()))
    }
}
