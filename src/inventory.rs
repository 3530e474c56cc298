//! A snapshot of the files already present in the download directory.
//!
//! Files are matched by bare file name: `sub/dir/a.jpg` on disk counts as `a.jpg`.
//! The API names a post after the final segment of its url, so that is the only
//! thing we can compare against.

use std::collections::HashSet;
use std::path::Path;

use walkdir::WalkDir;

use crate::download::PART_EXTENSION;

/// The set of file names found under a directory at one point in time.
///
/// It is not re-scanned while downloading; [`Self::insert`] records the files we write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalInventory {
    names: HashSet<String>,
}

impl LocalInventory {
    /// Recursively walk `root` and collect the name of every regular file.
    ///
    /// Unfinished downloads (`*.part`) are ignored. Entries that cannot be read
    /// are logged and skipped. A missing `root` yields an empty inventory.
    ///
    /// This is blocking, call it from [`tokio::task::spawn_blocking`] in async code.
    ///
    /// # Errors
    ///
    /// If `root` exists but cannot be read.
    pub fn scan(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            return Ok(Self::default());
        }
        // surface an unreadable root instead of silently returning nothing
        std::fs::read_dir(root)?;

        let mut names = HashSet::new();
        for entry in WalkDir::new(root).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("skipping unreadable entry while scanning: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == PART_EXTENSION) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                names.insert(name.to_owned());
            }
        }

        tracing::debug!(root = %root.display(), files = names.len(), "scanned local inventory");
        Ok(Self { names })
    }

    /// Whether a file named `file_name` was present.
    pub fn contains(&self, file_name: &str) -> bool {
        self.names.contains(file_name)
    }

    /// Record a file written after the scan.
    pub fn insert(&mut self, file_name: impl Into<String>) -> bool {
        self.names.insert(file_name.into())
    }

    /// The number of known files.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether no file is known.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for LocalInventory {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_scan_flattens_nested_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("nested/deeper")).unwrap();
        std::fs::write(root.join("a.jpg"), b"a").unwrap();
        std::fs::write(root.join("nested/b.png"), b"b").unwrap();
        std::fs::write(root.join("nested/deeper/c.gif"), b"c").unwrap();
        std::fs::write(root.join("d.jpg.part"), b"partial").unwrap();

        let inventory = LocalInventory::scan(root).unwrap();
        assert_eq!(inventory.len(), 3);
        assert!(inventory.contains("a.jpg"));
        assert!(inventory.contains("b.png"));
        assert!(inventory.contains("c.gif"));
        assert!(!inventory.contains("nested"));
        assert!(!inventory.contains("d.jpg"));
        assert!(!inventory.contains("d.jpg.part"));
    }

    #[test]
    fn test_scan_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let inventory = LocalInventory::scan(temp_dir.path().join("not_here")).unwrap();
        assert!(inventory.is_empty());
    }

    #[test]
    fn test_insert() {
        let mut inventory: LocalInventory = ["a.jpg"].into_iter().collect();
        assert!(!inventory.contains("b.jpg"));
        assert!(inventory.insert("b.jpg"));
        assert!(!inventory.insert("a.jpg"));
        assert!(inventory.contains("b.jpg"));
    }
}
