//! Decompression codecs.
//!
//! Metadata blocks inside the index and the file table are always zlib
//! streams and go through [`inflate`]. Bulk entry content is handed to a
//! [`ContentDecompressor`], which applications can replace with the codec
//! their archive family actually uses.

use std::io::Read;
use std::path::Path;

use flate2::read::ZlibDecoder;
use tracing::warn;

use crate::error::CodecError;
use crate::{Error, Result};

/// Inflate a zlib-compressed metadata block.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    inflate_sized(data, data.len().saturating_mul(4))
}

/// Upper bound on the expansion of a deflate stream.
const MAX_INFLATE_RATIO: usize = 1032;

/// Largest capacity reserved up front for decoded content; the buffer grows
/// past it on demand.
const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// Capacity to reserve for `expected` bytes decoded from `input` bytes.
fn output_capacity(expected: usize, input: usize) -> usize {
    expected
        .min(input.saturating_mul(MAX_INFLATE_RATIO))
        .min(MAX_PREALLOCATION)
}

/// Inflate a zlib-compressed block with a known output size.
///
/// `expected_size` is only a capacity hint.
pub fn inflate_sized(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(output_capacity(expected_size, data.len()));
    ZlibDecoder::new(data)
        .read_to_end(&mut output)
        .map_err(Error::Inflate)?;
    Ok(output)
}

/// Everything a content codec needs to decode one entry.
#[derive(Debug, Clone, Copy)]
pub struct DecompressRequest<'a> {
    /// Path of the data file holding the payload.
    pub path: &'a Path,
    pub offset: u64,
    pub compressed_size: u32,
    pub decompressed_size: u32,
    /// Compression code of the entry.
    pub compression: u16,
    /// The compressed payload, already mapped from `path`.
    pub data: &'a [u8],
}

/// Archive-specific decompression service for bulk content.
pub trait ContentDecompressor: Send + Sync {
    fn decompress(&self, request: &DecompressRequest<'_>) -> std::result::Result<Vec<u8>, CodecError>;
}

/// Zstandard content codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdDecompressor;

impl ContentDecompressor for ZstdDecompressor {
    fn decompress(&self, request: &DecompressRequest<'_>) -> std::result::Result<Vec<u8>, CodecError> {
        let mut output = Vec::with_capacity(output_capacity(
            request.decompressed_size as usize,
            request.data.len(),
        ));
        zstd::Decoder::new(request.data)?.read_to_end(&mut output)?;
        Ok(output)
    }
}

impl<F> ContentDecompressor for F
where
    F: Fn(&DecompressRequest<'_>) -> std::result::Result<Vec<u8>, CodecError> + Send + Sync,
{
    fn decompress(&self, request: &DecompressRequest<'_>) -> std::result::Result<Vec<u8>, CodecError> {
        self(request)
    }
}

/// Minimum length of a buffer that can carry a wrapper header.
const WRAPPER_MIN_LEN: usize = 16;

/// Drop the wrapper some archive families put in front of decoded content.
///
/// A wrapper starts with a zero big-endian word and has the shape
/// `[marker][len][len bytes][marker][len][len bytes][marker]`, lengths
/// big-endian. A wrapper that does not fit the buffer leaves it untouched.
pub fn strip_wrapper_header(data: Vec<u8>) -> Vec<u8> {
    if data.len() < WRAPPER_MIN_LEN || data[..4] != [0, 0, 0, 0] {
        return data;
    }

    match wrapper_len(&data) {
        Some(skip) => data[skip..].to_vec(),
        None => {
            warn!(len = data.len(), "wrapper header runs past the end of the content, keeping it");
            data
        }
    }
}

fn wrapper_len(data: &[u8]) -> Option<usize> {
    let read_len = |at: usize| -> Option<usize> {
        let bytes = data.get(at..at.checked_add(4)?)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
    };

    let mut pos = 4;
    for _ in 0..2 {
        let len = read_len(pos)?;
        pos = pos.checked_add(4)?.checked_add(len)?;
        // the following marker
        pos = pos.checked_add(4)?;
    }

    (pos <= data.len()).then_some(pos)
}
