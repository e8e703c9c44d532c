//! Numbered data files that hold entry payloads.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Extension of data files.
pub const DATA_FILE_EXTENSION: &str = "dat";

/// One physical payload file of an archive.
///
/// The file is stat'ed when first referenced during parsing and memory
/// mapped on the first read.
pub struct DataFile {
    number: u8,
    path: PathBuf,
    prefix: String,
    size: u64,
    exists: bool,
    mmap: OnceLock<Mmap>,
}

impl DataFile {
    /// Locate data file `number` next to `index_path`.
    pub fn locate(index_path: &Path, number: u8) -> Self {
        let path = data_file_path(index_path, number);
        let prefix = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        let (exists, size) = match std::fs::metadata(&path) {
            Ok(meta) => (true, meta.len()),
            Err(e) => {
                warn!(path = %path.display(), "data file unavailable: {}", e);
                (false, 0)
            }
        };

        Self {
            number,
            path,
            prefix,
            size,
            exists,
            mmap: OnceLock::new(),
        }
    }

    #[inline]
    pub fn number(&self) -> u8 {
        self.number
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem, used in placeholder names.
    #[inline]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Whether the file has been memory mapped yet.
    pub fn is_mapped(&self) -> bool {
        self.mmap.get().is_some()
    }

    /// Borrow `len` bytes at `offset`.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        if !self.exists {
            return Err(Error::DataFileMissing(self.number));
        }
        if len == 0 {
            return Ok(&[]);
        }

        let data = self.map()?;
        let start = offset as usize;
        let end = start.saturating_add(len as usize);
        data.get(start..end).ok_or_else(|| {
            Error::Format(format!(
                "range {:#x}..{:#x} outside {} ({} bytes)",
                start,
                end,
                self.path.display(),
                data.len()
            ))
        })
    }

    fn map(&self) -> Result<&Mmap> {
        if let Some(mmap) = self.mmap.get() {
            return Ok(mmap);
        }

        let file = File::open(&self.path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        debug!(path = %self.path.display(), len = mmap.len(), "mapped data file");
        // A concurrent reader may have won the race; either map is fine.
        let _ = self.mmap.set(mmap);
        self.mmap
            .get()
            .ok_or_else(|| Error::Format(format!("failed to map {}", self.path.display())))
    }
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile")
            .field("number", &self.number)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// `<dir>/<index stem><NNNN>.dat` for the given index file.
pub fn data_file_path(index_path: &Path, number: u8) -> PathBuf {
    let stem = index_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let name = format!("{}{:04}.{}", stem, number, DATA_FILE_EXTENSION);
    match index_path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}
