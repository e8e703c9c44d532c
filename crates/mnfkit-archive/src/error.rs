//! Error types for the archive crate.

use std::path::PathBuf;

use thiserror::Error;

use crate::EntryId;

/// Error type returned by pluggable content codecs.
pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when working with MNF archives.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary decoding error (bad magic, truncated field).
    #[error("{0}")]
    Common(#[from] mnfkit_common::Error),

    /// Container version other than 3.
    #[error("unsupported MNF version: {0}")]
    UnsupportedVersion(u16),

    /// A structurally required value is nonsense.
    #[error("malformed archive: {0}")]
    Format(String),

    /// A metadata block failed to inflate.
    #[error("inflate error: {0}")]
    Inflate(#[source] std::io::Error),

    /// The content codec failed; the codec's error is kept as the source.
    #[error("decompression error: {0}")]
    Decompression(#[source] CodecError),

    /// The entry's offset or size lies outside its data file.
    #[error("entry {id} ({path}) lies outside its data file")]
    EntryOutOfBounds { id: EntryId, path: String },

    /// Entry not found.
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// The data file an entry points at does not exist.
    #[error("data file {0:04} is missing")]
    DataFileMissing(u8),

    /// Another extraction job is still running on the archive.
    #[error("an extraction is already running for {}", .0.display())]
    ExtractionInProgress(PathBuf),

    /// Not enough free space on the target disk.
    #[error("insufficient disk space: {required} bytes required, {available} bytes available")]
    InsufficientDiskSpace { required: u64, available: u64 },

    /// The entry path is not below the extraction root.
    #[error("{path} is not below extraction root {root}")]
    RootMismatch { path: String, root: String },

    /// Invalid search pattern.
    #[error("invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Result type for archive operations.
pub type Result<T> = std::result::Result<T, Error>;
