//! Filesystem access behind a trait
//!
//! Backends stage ruleset fragments on disk before running any privileged
//! command. [`StagedFs`] keeps those writes mockable in tests that also mock
//! the command runner; production uses [`DirectFs`] over `std::fs`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Filesystem operations used by the firewall backends.
pub trait StagedFs: Send + Sync {
    fn write(&self, path: &Path, contents: &str) -> Result<()>;
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    /// Lists regular files directly under `path`, sorted by file name.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
}

/// [`StagedFs`] over the real filesystem.
#[derive(Debug, Default)]
pub struct DirectFs;

impl DirectFs {
    pub fn new() -> Self {
        Self
    }
}

impl StagedFs for DirectFs {
    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        fs::write(path, contents)?;
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        Ok(fs::read_to_string(path)?)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                entries.push(entry.path());
            }
        }
        entries.sort();
        Ok(entries)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let fs = DirectFs::new();
        let path = dir.path().join("rules.nft");

        fs.write(&path, "table inet t {}\n").unwrap();
        assert!(fs.exists(&path));
        assert_eq!(fs.read_to_string(&path).unwrap(), "table inet t {}\n");

        fs.remove_file(&path).unwrap();
        assert!(!fs.exists(&path));
    }

    #[test]
    fn test_read_dir_sorted_files_only() {
        let dir = TempDir::new().unwrap();
        let fs = DirectFs::new();

        fs.create_dir_all(&dir.path().join("sub")).unwrap();
        fs.write(&dir.path().join("b.nft"), "").unwrap();
        fs.write(&dir.path().join("a.nft"), "").unwrap();

        let names: Vec<String> = fs
            .read_dir(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.nft", "b.nft"]);
    }

    #[test]
    fn test_remove_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let fs = DirectFs::new();
        assert!(fs.remove_file(&dir.path().join("gone")).is_err());
    }
}
