//! MNF archive entry.

use crate::scan::{TAG_NORMAL, TAG_REMOVED};

/// Ordinal position of an entry in the index.
pub type EntryId = u32;

/// Directory that holds placeholder names of entries without a table name.
pub const UNMAPPED_DIR: &str = "/unmapped/";

/// Name of an entry, before or after file table resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", rename_all = "snake_case"))]
pub enum EntryName {
    /// Synthetic name derived from the content id or offset.
    Unresolved { placeholder: String },
    /// Name taken from a file table row.
    Resolved { path: String, table_row: usize },
}

impl EntryName {
    #[inline]
    pub fn path(&self) -> &str {
        match self {
            EntryName::Unresolved { placeholder } => placeholder,
            EntryName::Resolved { path, .. } => path,
        }
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        matches!(self, EntryName::Resolved { .. })
    }

    #[inline]
    pub fn table_row(&self) -> Option<usize> {
        match self {
            EntryName::Resolved { table_row, .. } => Some(*table_row),
            EntryName::Unresolved { .. } => None,
        }
    }
}

/// An entry (packed file) within an MNF archive.
///
/// This contains metadata about the file, not the file data itself.
/// Use [`Archive::content`](crate::Archive::content) to get the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Entry {
    /// Ordinal position in the index.
    pub id: EntryId,
    /// File id from the flags block; the file table joins on this.
    pub file_id: u32,
    /// Row tag from the id table, `None` when the table ran out.
    pub tag: Option<u8>,
    /// Content id from the id table.
    pub content_id: Option<u32>,
    pub flags: u32,
    pub offset: u32,
    pub compressed_size: u32,
    pub decompressed_size: u32,
    /// Compression code; 0 means stored.
    pub compression: u16,
    /// Number of the owning data file.
    pub data_file: u8,
    pub invalid_offset: bool,
    pub invalid_size: bool,
    name: EntryName,
}

impl Entry {
    /// Create an entry carrying its placeholder name.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: EntryId,
        file_id: u32,
        tag: Option<u8>,
        content_id: Option<u32>,
        flags: u32,
        offset: u32,
        compressed_size: u32,
        decompressed_size: u32,
        compression: u16,
        data_file: u8,
        data_file_prefix: &str,
        data_file_size: u64,
    ) -> Self {
        let end = offset as u64 + compressed_size as u64;
        Self {
            id,
            file_id,
            tag,
            content_id,
            flags,
            offset,
            compressed_size,
            decompressed_size,
            compression,
            data_file,
            invalid_offset: offset as u64 > data_file_size,
            invalid_size: end > data_file_size,
            name: EntryName::Unresolved {
                placeholder: placeholder_name(data_file_prefix, tag, content_id, offset),
            },
        }
    }

    /// Promote this entry to a resolved name.
    pub fn resolve(self, path: impl Into<String>, table_row: usize) -> Self {
        Self {
            name: EntryName::Resolved {
                path: path.into(),
                table_row,
            },
            ..self
        }
    }

    /// Keep the current resolution state but replace the name text.
    pub(crate) fn renamed(self, path: impl Into<String>) -> Self {
        let name = match self.name {
            EntryName::Unresolved { .. } => EntryName::Unresolved {
                placeholder: path.into(),
            },
            EntryName::Resolved { table_row, .. } => EntryName::Resolved {
                path: path.into(),
                table_row,
            },
        };
        Self { name, ..self }
    }

    #[inline]
    pub fn name(&self) -> &EntryName {
        &self.name
    }

    /// Full path within the archive.
    #[inline]
    pub fn path(&self) -> &str {
        self.name.path()
    }

    /// Final path component.
    pub fn basename(&self) -> &str {
        let path = self.path();
        path.rsplit_once('/').map_or(path, |(_, name)| name)
    }

    /// Get the file extension, if any.
    pub fn extension(&self) -> Option<&str> {
        self.basename().rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
    }

    /// Offset and size lie within the data file.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.invalid_offset && !self.invalid_size
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.tag == Some(TAG_REMOVED)
    }

    /// Valid and not removed; only live entries are extractable.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.is_valid() && !self.is_removed()
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compression != 0
    }

    /// Size of the content as returned by a read with the given mode.
    #[inline]
    pub fn content_size(&self, decompress: bool) -> u64 {
        if decompress && self.is_compressed() {
            self.decompressed_size as u64
        } else {
            self.compressed_size as u64
        }
    }

    /// Path relative to `root`, without a leading separator.
    ///
    /// Returns `None` when the entry is not below `root`.
    pub fn relative_path(&self, root: &str) -> Option<&str> {
        let rest = self.path().strip_prefix(root)?;
        if !root.ends_with('/') && !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        Some(rest.trim_start_matches('/'))
    }
}

/// Synthetic name for an entry that has no file table name.
///
/// Entries with a normal tag are named after their content id, all others
/// after their byte offset.
pub fn placeholder_name(prefix: &str, tag: Option<u8>, content_id: Option<u32>, offset: u32) -> String {
    match (tag, content_id) {
        (Some(TAG_NORMAL), Some(id)) => format!("{}{}/file{}.dat", UNMAPPED_DIR, prefix, id),
        _ => format!("{}{}/file@0x{:X}.dat", UNMAPPED_DIR, prefix, offset),
    }
}
