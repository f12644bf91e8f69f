//! Document discovery.
//!
//! [`DocumentLocator`] walks an extraction tree and yields the paths of
//! source documents whose relative path matches the configured globs. The
//! walk is lazy and every call to [`DocumentLocator::iter`] starts over.
//! Ordering follows the filesystem and is not stable across machines.

use anyhow::{bail, Result};
use globset::GlobSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::fetch::build_globset;

pub struct DocumentLocator {
    root: PathBuf,
    include: GlobSet,
}

impl DocumentLocator {
    pub fn new(root: &Path, include_globs: &[String]) -> Result<Self> {
        if !root.exists() {
            bail!("Extraction directory does not exist: {}", root.display());
        }
        Ok(Self {
            root: root.to_path_buf(),
            include: build_globset(include_globs)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily walk the tree. Unreadable directory entries surface as `Err`
    /// items so the caller decides whether to continue.
    pub fn iter(&self) -> impl Iterator<Item = Result<PathBuf>> + '_ {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        return None;
                    }
                    let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
                    if self.include.is_match(relative) {
                        Some(Ok(entry.into_path()))
                    } else {
                        None
                    }
                }
                Err(e) => Some(Err(e.into())),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn xml_globs() -> Vec<String> {
        vec!["**/*.xml".to_string()]
    }

    #[test]
    fn finds_xml_recursively() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("top.xml"), "<x/>").unwrap();
        fs::write(root.join("a/b/deep.xml"), "<x/>").unwrap();
        fs::write(root.join("a/figure.jpg"), "jpg").unwrap();
        fs::write(root.join("a/notes.xml.bak"), "bak").unwrap();

        let locator = DocumentLocator::new(root, &xml_globs()).unwrap();
        let mut found: Vec<PathBuf> = locator.iter().map(Result::unwrap).collect();
        found.sort();
        assert_eq!(found, vec![root.join("a/b/deep.xml"), root.join("top.xml")]);
    }

    #[test]
    fn iteration_restarts() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("one.xml"), "<x/>").unwrap();
        fs::write(tmp.path().join("two.xml"), "<x/>").unwrap();

        let locator = DocumentLocator::new(tmp.path(), &xml_globs()).unwrap();
        assert_eq!(locator.iter().count(), 2);
        fs::write(tmp.path().join("three.xml"), "<x/>").unwrap();
        assert_eq!(locator.iter().count(), 3);
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(DocumentLocator::new(&tmp.path().join("missing"), &xml_globs()).is_err());
    }
}
