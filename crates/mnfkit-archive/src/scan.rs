//! Sparse, type-tagged row scanning.
//!
//! Several MNF structures store one 32-bit word per row where the high byte
//! is a type tag and the low 24 bits an id. Rows whose tag is zero are
//! padding and are skipped, so one logical row can span several words.

use mnfkit_common::BinaryReader;
use tracing::warn;

/// Tag of a regular, addressable row.
pub const TAG_NORMAL: u8 = 0x80;
/// Tag of a removed row.
pub const TAG_REMOVED: u8 = 0x40;
/// Tag of an empty (skipped) row.
pub const TAG_EMPTY: u8 = 0x00;

/// Tags seen in shipped archives.
pub const KNOWN_TAGS: &[u8] = &[TAG_NORMAL, TAG_REMOVED, TAG_EMPTY];

/// One logical row produced by [`SparseScanner::next_row`].
///
/// `tag` and `id` are `None` when the stream ran out before a non-empty
/// word was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SparseRow {
    pub tag: Option<u8>,
    pub id: Option<u32>,
    /// Words consumed for this row, including skipped empty ones.
    pub words: u32,
}

impl SparseRow {
    #[inline]
    pub fn is_unmapped(&self) -> bool {
        self.tag.is_none()
    }
}

/// Reusable scanner parameterised by the set of valid tags.
#[derive(Debug, Clone)]
pub struct SparseScanner<'t> {
    known_tags: &'t [u8],
    rows: usize,
    anomalies: usize,
}

impl<'t> SparseScanner<'t> {
    pub fn new(known_tags: &'t [u8]) -> Self {
        Self {
            known_tags,
            rows: 0,
            anomalies: 0,
        }
    }

    /// Read words until one carries a non-zero tag.
    pub fn next_row(&mut self, reader: &mut BinaryReader<'_>) -> SparseRow {
        let mut row = SparseRow::default();

        loop {
            if reader.remaining() < 4 {
                return SparseRow {
                    tag: None,
                    id: None,
                    words: row.words,
                };
            }

            let offset = reader.position();
            let Ok(value) = reader.read_u32() else {
                return SparseRow::default();
            };
            let tag = (value >> 24) as u8;
            let id = value & 0x00FF_FFFF;
            row.words += 1;

            if !self.known_tags.contains(&tag) || (tag != TAG_NORMAL && id > 0) {
                self.anomalies += 1;
                warn!(offset, tag, id, "unexpected sparse row value {:#010x}", value);
            }

            if tag != TAG_EMPTY {
                self.rows += 1;
                row.tag = Some(tag);
                row.id = Some(id);
                return row;
            }
        }
    }

    /// Number of non-empty rows produced so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of words with an unexpected tag/id combination.
    pub fn anomalies(&self) -> usize {
        self.anomalies
    }
}

impl Default for SparseScanner<'static> {
    fn default() -> Self {
        Self::new(KNOWN_TAGS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_skips_empty_rows() {
        let data = words(&[0, 0, 0x8000_0007, 0x4000_0000]);
        let mut reader = BinaryReader::new(&data);
        let mut scanner = SparseScanner::default();

        let first = scanner.next_row(&mut reader);
        assert_eq!(first.tag, Some(TAG_NORMAL));
        assert_eq!(first.id, Some(7));
        assert_eq!(first.words, 3);

        let second = scanner.next_row(&mut reader);
        assert_eq!(second.tag, Some(TAG_REMOVED));
        assert_eq!(second.id, Some(0));
        assert_eq!(scanner.rows(), 2);
        assert_eq!(scanner.anomalies(), 0);
    }

    #[test]
    fn test_exhausted_reader_is_unmapped() {
        let data = words(&[0x8000_0001, 0]);
        let mut reader = BinaryReader::new(&data);
        let mut scanner = SparseScanner::default();

        assert!(!scanner.next_row(&mut reader).is_unmapped());
        let row = scanner.next_row(&mut reader);
        assert!(row.is_unmapped());
        assert_eq!(row.id, None);
        assert!(scanner.next_row(&mut reader).is_unmapped());
    }

    #[test]
    fn test_trailing_partial_word_is_unmapped() {
        let data = [0x01, 0x00, 0x00];
        let mut reader = BinaryReader::new(&data);
        assert!(SparseScanner::default().next_row(&mut reader).is_unmapped());
    }

    #[test]
    fn test_counts_anomalies() {
        // unknown tag 0x20, and a removed row carrying an id
        let data = words(&[0x2000_0001, 0x4000_0005]);
        let mut reader = BinaryReader::new(&data);
        let mut scanner = SparseScanner::default();

        assert_eq!(scanner.next_row(&mut reader).tag, Some(0x20));
        assert_eq!(scanner.next_row(&mut reader).id, Some(5));
        assert_eq!(scanner.anomalies(), 2);
    }
}
