//! Common utilities for mnfkit.
//!
//! This crate provides the low-level building blocks shared by the mnfkit crates:
//!
//! - [`BinaryReader`] - Zero-copy binary reading with selectable byte order
//! - [`schema`] - Declarative, conditional field schemas for headers
//! - [`Error`] - Decoding errors that carry the failing offset

mod error;
mod reader;

pub mod schema;

pub use error::{Error, Result};
pub use reader::{BinaryReader, Endian};

/// Re-export zerocopy traits for convenience
pub use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
