//! Error types for mnfkit-common.

use thiserror::Error;

/// Common error type for mnfkit binary decoding.
#[derive(Debug, Error)]
pub enum Error {
    /// End of buffer reached while reading.
    #[error("unexpected end of buffer at offset {offset}: needed {needed} bytes but only {available} available")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Invalid magic bytes encountered.
    #[error("invalid magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    /// Value did not match expected.
    #[error("expected value {expected}, got {actual}")]
    ExpectedValue { expected: String, actual: String },

    /// A schema field refers to a length field that was not decoded before it.
    #[error("length field {0:?} has not been decoded")]
    MissingLengthField(&'static str),

    /// Decoding a schema field failed.
    #[error("failed to decode field {field} at offset {offset:#x}: {source}")]
    Field {
        field: String,
        offset: usize,
        #[source]
        source: Box<Error>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;
