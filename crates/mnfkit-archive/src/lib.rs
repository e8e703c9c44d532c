//! MNF archive reader for Elder Scrolls Online game files.
//!
//! An MNF archive is an index file (`game.mnf`, `eso.mnf`, ...) that
//! describes entries stored in numbered data files next to it
//! (`game0000.dat`, `game0001.dat`, ...). This crate provides:
//!
//! - Index parsing with per-entry bounds validation
//! - Path resolution through the embedded `ZOSFT` file table
//! - Zero-copy content access over memory-mapped data files
//! - Pluggable content decompression (Zstandard by default)
//! - Directory browsing and substring/regex search
//! - Background extraction with progress events and cancellation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mnfkit_archive::{Archive, ExtractionRequest};
//!
//! let archive = Arc::new(Archive::open("game.mnf")?);
//!
//! for entry in archive.live_entries() {
//!     println!("{}: {} bytes", entry.path(), entry.decompressed_size);
//! }
//!
//! if let Some(entry) = archive.find("/art/fx/spark.dds") {
//!     let data = archive.content(entry, true)?;
//!     println!("{} bytes", data.len());
//! }
//!
//! let job = archive.extract(ExtractionRequest::new("out").root("/art/"))?;
//! let report = job.wait()?;
//! println!("{} extracted, {} failed", report.succeeded(), report.failed);
//! # Ok::<(), mnfkit_archive::Error>(())
//! ```

mod archive;
pub mod codec;
pub mod container;
mod data_file;
mod entry;
mod error;
mod extract;
mod install;
mod registry;
pub mod scan;
mod search;
pub mod table;

#[cfg(test)]
mod testutil;

pub use archive::{
    Archive, ArchiveOptions, DirectoryItem, FolderStats, Resolution, ResolutionStats, SearchResult,
    FILE_TABLE_PATH,
};
pub use codec::{ContentDecompressor, DecompressRequest, ZstdDecompressor};
pub use container::{CarrierStrategy, ContainerHeader};
pub use data_file::{data_file_path, DataFile};
pub use entry::{Entry, EntryId, EntryName, UNMAPPED_DIR};
pub use error::{CodecError, Error, Result};
pub use extract::{
    admit, available_space, CancellationToken, ExtractionEvent, ExtractionJob, ExtractionReport,
    ExtractionRequest,
};
pub use install::{BuildInfo, GameInstall};
pub use registry::ArchiveRegistry;
pub use scan::{SparseRow, SparseScanner};
pub use search::{SearchHit, SearchIndex};
pub use table::{FileTable, FileTableRow, Join};
