//! Shared map of open archives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::archive::{Archive, ArchiveOptions};
use crate::Result;

/// Open archives keyed by index path.
///
/// Owned by the application and handed to whoever needs "the archive for
/// this path"; safe to share across threads.
#[derive(Debug, Default)]
pub struct ArchiveRegistry {
    archives: RwLock<HashMap<PathBuf, Arc<Archive>>>,
}

impl ArchiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached archive for `path`, opening it on first use.
    pub fn open<P: AsRef<Path>>(&self, path: P, options: ArchiveOptions) -> Result<Arc<Archive>> {
        let path = path.as_ref();
        if let Some(archive) = self.get(path) {
            return Ok(archive);
        }

        // parse outside the lock; a racing open of the same path keeps the first
        let archive = Arc::new(Archive::open_with(path, options)?);
        let mut archives = self.archives.write();
        let archive = archives
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                debug!(archive = %path.display(), "registered archive");
                archive
            })
            .clone();
        Ok(archive)
    }

    /// Register an already opened archive under its own path.
    pub fn insert(&self, archive: Arc<Archive>) -> Option<Arc<Archive>> {
        self.archives
            .write()
            .insert(archive.path().to_path_buf(), archive)
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Archive>> {
        self.archives.read().get(path).cloned()
    }

    pub fn remove(&self, path: &Path) -> Option<Arc<Archive>> {
        self.archives.write().remove(path)
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.archives.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.archives.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{EntrySpec, IndexBuilder};

    #[test]
    fn test_open_caches() {
        let built = IndexBuilder::new("other.mnf")
            .entry(EntrySpec::stored(1, b"abc"))
            .write();
        let registry = ArchiveRegistry::new();

        let first = registry.open(&built.index, ArchiveOptions::default()).unwrap();
        let second = registry.open(&built.index, ArchiveOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.paths(), vec![built.index.clone()]);

        assert!(registry.remove(&built.index).is_some());
        assert!(registry.is_empty());
        assert!(registry.get(&built.index).is_none());
    }

    #[test]
    fn test_insert_and_failed_open() {
        let built = IndexBuilder::new("other.mnf")
            .entry(EntrySpec::stored(1, b"abc"))
            .write();
        let registry = ArchiveRegistry::new();

        let archive = Arc::new(Archive::open(&built.index).unwrap());
        assert!(registry.insert(archive).is_none());
        assert!(registry.get(&built.index).is_some());

        let missing = built.dir.path().join("missing.mnf");
        assert!(registry.open(&missing, ArchiveOptions::default()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shared_across_threads() {
        let built = IndexBuilder::new("other.mnf")
            .entry(EntrySpec::stored(1, b"abc"))
            .write();
        let registry = Arc::new(ArchiveRegistry::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let path = built.index.clone();
                std::thread::spawn(move || registry.open(&path, ArchiveOptions::default()).unwrap())
            })
            .collect();
        let archives: Vec<Arc<Archive>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        let cached = registry.get(&built.index).unwrap();
        assert!(archives.iter().all(|a| Arc::ptr_eq(a, &cached)));
    }
}
