//! mnfkit - Elder Scrolls Online MNF archive access library.
//!
//! This crate provides a unified interface to the mnfkit crates.
//!
//! # Crates
//!
//! - [`mnfkit_common`] - Binary reading and declarative field schemas
//! - [`mnfkit_archive`] - Index parsing, file table resolution, content access and extraction
//!
//! # Example
//!
//! ```no_run
//! use mnfkit::prelude::*;
//!
//! let registry = ArchiveRegistry::new();
//! let archive = registry.open("game.mnf", ArchiveOptions::default())?;
//!
//! for hit in archive.search("spark", false)? {
//!     println!("{}", hit.path());
//! }
//! # Ok::<(), mnfkit::archive::Error>(())
//! ```

// Re-export all sub-crates
pub use mnfkit_archive as archive;
pub use mnfkit_common as common;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use mnfkit_archive::{
        Archive, ArchiveOptions, ArchiveRegistry, CancellationToken, CarrierStrategy,
        ContentDecompressor, DirectoryItem, Entry, EntryId, ExtractionEvent, ExtractionRequest,
        GameInstall, SearchResult,
    };
    pub use mnfkit_common::BinaryReader;
}

// Re-export commonly used types at the crate root
pub use mnfkit_archive::{Archive, Entry};

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
