//! Embedded file table (`ZOSFT`) parsing and joining.
//!
//! The carrier entry of an archive decodes to a table that maps file ids to
//! path names. The table is column oriented: three segments of up to three
//! zlib blocks each, every block holding one column for rows `0..n`. A block
//! with zero rows is absent from the stream entirely.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use memchr::{memchr, memrchr};
use mnfkit_common::schema::{decode_fields, Condition, FieldDef, FieldList, FieldSummary, Len};
use mnfkit_common::BinaryReader;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::codec::inflate_sized;
use crate::entry::{Entry, EntryId};
use crate::scan::{SparseRow, SparseScanner, KNOWN_TAGS};
use crate::{Error, Result};

/// File table magic, at the start and at the end.
pub const ZOSFT_MAGIC: &[u8; 5] = b"ZOSFT";

/// Segments per table.
pub const SEGMENT_COUNT: usize = 3;

/// Blocks per segment.
pub const BLOCKS_PER_SEGMENT: usize = 3;

const HEADER_SCHEMA: &[FieldDef] = &[
    FieldDef::u16("unknown0"),
    FieldDef::u32("unknown1"),
    FieldDef::u32("unknown2"),
    FieldDef::u32("entry_count"),
];

const SEGMENT_SCHEMA: &[FieldDef] = &[
    FieldDef::u16("segment_type"),
    FieldDef::u32("segment_unknown"),
    FieldDef::u32("block0_rows"),
    FieldDef::u32("block1_rows"),
    FieldDef::u32("block2_rows"),
    FieldDef::u32("block0_size").when(Condition::NonZero("block0_rows")),
    FieldDef::u32("block0_compressed_size").when(Condition::NonZero("block0_rows")),
    FieldDef::bytes("block0", Len::Field("block0_compressed_size")).when(Condition::NonZero("block0_rows")),
    FieldDef::u32("block1_size").when(Condition::NonZero("block1_rows")),
    FieldDef::u32("block1_compressed_size").when(Condition::NonZero("block1_rows")),
    FieldDef::bytes("block1", Len::Field("block1_compressed_size")).when(Condition::NonZero("block1_rows")),
    FieldDef::u32("block2_size").when(Condition::NonZero("block2_rows")),
    FieldDef::u32("block2_compressed_size").when(Condition::NonZero("block2_rows")),
    FieldDef::bytes("block2", Len::Field("block2_compressed_size")).when(Condition::NonZero("block2_rows")),
];

const NAMES_SCHEMA: &[FieldDef] = &[
    FieldDef::u32("names_len"),
    FieldDef::bytes("names", Len::Field("names_len")),
];

const BLOCK_NAMES: [(&str, &str, &str); BLOCKS_PER_SEGMENT] = [
    ("block0_rows", "block0_size", "block0"),
    ("block1_rows", "block1_size", "block1"),
    ("block2_rows", "block2_size", "block2"),
];

/// Column layouts of blocks 1 and 2, per segment. Block 0 is always sparse.
const COLUMN_SCHEMAS: [[&[FieldDef]; 2]; SEGMENT_COUNT] = [
    [
        &[FieldDef::u32("unknown0"), FieldDef::u32("unknown1")],
        &[FieldDef::u32("file_id")],
    ],
    [
        &[FieldDef::u32("file_id")],
        &[
            FieldDef::u32("file_id"),
            FieldDef::u32("name_offset"),
            FieldDef::u32("unknown0"),
            FieldDef::u32("unknown1"),
        ],
    ],
    [&[FieldDef::u32("unknown0")], &[FieldDef::u32("unknown0")]],
];

/// Table header values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileTableHeader {
    pub unknown0: u16,
    pub unknown1: u32,
    pub unknown2: u32,
    pub entry_count: u32,
}

/// Header of one segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SegmentHeader {
    pub segment_type: u16,
    pub unknown: u32,
    /// Row count per block; zero means the block is absent.
    pub rows: [u32; BLOCKS_PER_SEGMENT],
}

/// A raw column value without a dedicated field on [`FileTableRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ColumnValue {
    pub segment: u8,
    pub block: u8,
    pub name: &'static str,
    pub value: u32,
}

/// One row of the file table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FileTableRow {
    pub index: usize,
    /// Block 0 row of each segment.
    pub sparse: [Option<SparseRow>; SEGMENT_COUNT],
    /// Join key, from segment 0 block 2.
    pub file_id: Option<u32>,
    /// Offset into the name blob, from segment 1 block 2.
    pub name_offset: Option<u32>,
    pub columns: Vec<ColumnValue>,
    pub name: Option<String>,
}

impl FileTableRow {
    fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    fn apply(&mut self, segment: usize, block: usize, fields: &FieldList<'_>) {
        for field in fields.iter() {
            let (Some(name), Some(value)) = (field.name, field.value.as_u64()) else {
                continue;
            };
            let value = value as u32;
            match (segment, block, name) {
                (0, 2, "file_id") => self.file_id = Some(value),
                (1, 2, "name_offset") => self.name_offset = Some(value),
                _ => self.columns.push(ColumnValue {
                    segment: segment as u8,
                    block: block as u8,
                    name,
                    value,
                }),
            }
        }
    }
}

/// Parsed file table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTable {
    header: FileTableHeader,
    segments: [SegmentHeader; SEGMENT_COUNT],
    rows: Vec<FileTableRow>,
    fields: Vec<FieldSummary>,
    names_len: usize,
}

/// Outcome of [`FileTable::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// The full entry collection with joined entries promoted.
    pub entries: BTreeMap<EntryId, Entry>,
    /// Table row → entry.
    pub links: BTreeMap<usize, EntryId>,
    /// Rows whose file id matches no live entry.
    pub unmatched: usize,
    /// Rows that hit an entry another row already claimed.
    pub duplicates: usize,
    /// Rows without a name or file id.
    pub unnamed: usize,
}

struct BlockData<'a> {
    segment: usize,
    block: usize,
    rows: u32,
    size: u32,
    compressed: &'a [u8],
}

impl FileTable {
    /// Parse a decoded carrier payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let start = Instant::now();
        let mut reader = BinaryReader::new(data);
        reader.expect_magic(ZOSFT_MAGIC)?;

        let header_fields = decode_fields(&mut reader, HEADER_SCHEMA)?;
        let header = FileTableHeader {
            unknown0: header_fields.u16("unknown0").unwrap_or_default(),
            unknown1: header_fields.u32("unknown1").unwrap_or_default(),
            unknown2: header_fields.u32("unknown2").unwrap_or_default(),
            entry_count: header_fields.u32("entry_count").unwrap_or_default(),
        };
        let mut fields = header_fields.summaries();

        let mut segments = [SegmentHeader::default(); SEGMENT_COUNT];
        let mut blocks = Vec::new();
        for (segment, segment_header) in segments.iter_mut().enumerate() {
            let segment_fields = decode_fields(&mut reader, SEGMENT_SCHEMA)?;
            segment_header.segment_type = segment_fields.u16("segment_type").unwrap_or_default();
            segment_header.unknown = segment_fields.u32("segment_unknown").unwrap_or_default();

            for (block, (rows_name, size_name, data_name)) in BLOCK_NAMES.iter().enumerate() {
                let rows = segment_fields.u32(rows_name).unwrap_or_default();
                segment_header.rows[block] = rows;
                if let Some(compressed) = segment_fields.bytes(data_name) {
                    blocks.push(BlockData {
                        segment,
                        block,
                        rows,
                        size: segment_fields.u32(size_name).unwrap_or_default(),
                        compressed,
                    });
                }
            }

            fields.extend(segment_fields.summaries().into_iter().map(|mut f| {
                f.name = format!("segment{}.{}", segment, f.name);
                f
            }));
        }

        let inflated = blocks
            .par_iter()
            .map(|block| inflate_sized(block.compressed, block.size as usize))
            .collect::<Result<Vec<_>>>()?;
        debug!(blocks = blocks.len(), elapsed = ?start.elapsed(), "file table blocks inflated");

        // every row takes at least one 32-bit word in each block it appears in
        let entry_count = header.entry_count as usize;
        let max_rows = inflated.iter().map(|data| data.len() / 4).max().unwrap_or(0);
        if entry_count > max_rows {
            return Err(Error::Format(format!(
                "file table declares {} rows, blocks hold at most {}",
                entry_count, max_rows
            )));
        }
        let mut rows: Vec<FileTableRow> = (0..entry_count).map(FileTableRow::new).collect();
        for (block, data) in blocks.iter().zip(&inflated) {
            apply_block(block, data, &mut rows)?;
        }

        let names_fields = decode_fields(&mut reader, NAMES_SCHEMA)?;
        let names = names_fields.bytes("names").unwrap_or_default();
        fields.extend(names_fields.summaries());

        let mut unnamed = 0usize;
        for row in &mut rows {
            row.name = row.name_offset.and_then(|offset| resolve_name(names, offset as usize));
            if row.name.is_none() {
                unnamed += 1;
            }
        }
        if unnamed > 0 {
            warn!(unnamed, "file table rows without a usable name offset");
        }

        match reader.read_bytes(ZOSFT_MAGIC.len()) {
            Ok(magic) if magic == ZOSFT_MAGIC => {}
            Ok(magic) => warn!("incorrect file table end marker {:?}", String::from_utf8_lossy(magic)),
            Err(_) => warn!("file table end marker missing"),
        }

        info!(rows = rows.len(), elapsed = ?start.elapsed(), "parsed file table");

        Ok(Self {
            header,
            segments,
            rows,
            fields,
            names_len: names.len(),
        })
    }

    #[inline]
    pub fn header(&self) -> &FileTableHeader {
        &self.header
    }

    #[inline]
    pub fn segments(&self) -> &[SegmentHeader; SEGMENT_COUNT] {
        &self.segments
    }

    #[inline]
    pub fn rows(&self) -> &[FileTableRow] {
        &self.rows
    }

    #[inline]
    pub fn row(&self, index: usize) -> Option<&FileTableRow> {
        self.rows.get(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Size of the name blob in bytes.
    #[inline]
    pub fn names_len(&self) -> usize {
        self.names_len
    }

    /// Decoded header and segment fields.
    pub fn fields(&self) -> &[FieldSummary] {
        &self.fields
    }

    /// Join table rows onto `entries` by file id.
    ///
    /// Every in-bounds entry is a join target, removed ones included. When
    /// several share a file id a live entry beats a removed one, then the
    /// highest id wins. The input is left untouched.
    pub fn join(&self, entries: &BTreeMap<EntryId, Entry>) -> Join {
        let mut by_file_id: HashMap<u32, &Entry> = HashMap::new();
        for entry in entries.values().filter(|e| e.is_valid()) {
            match by_file_id.get(&entry.file_id) {
                Some(current) if current.is_live() && !entry.is_live() => {}
                _ => {
                    by_file_id.insert(entry.file_id, entry);
                }
            }
        }

        let mut joined = entries.clone();
        let mut links = BTreeMap::new();
        let mut claimed = HashSet::new();
        let (mut unmatched, mut duplicates, mut unnamed) = (0usize, 0usize, 0usize);

        for row in &self.rows {
            let (Some(file_id), Some(name)) = (row.file_id, row.name.as_deref()) else {
                unnamed += 1;
                continue;
            };
            let Some(id) = by_file_id.get(&file_id).map(|e| e.id) else {
                unmatched += 1;
                continue;
            };
            if !claimed.insert(id) {
                duplicates += 1;
                warn!(row = row.index, entry = id, file_id, "entry already has a file table row");
                continue;
            }

            if let Some(entry) = joined.remove(&id) {
                joined.insert(id, entry.resolve(name, row.index));
                links.insert(row.index, id);
            }
        }

        if unmatched > 0 {
            warn!(unmatched, "file table rows without a matching entry");
        }
        debug!(linked = links.len(), duplicates, unnamed, "joined file table");

        Join {
            entries: joined,
            links,
            unmatched,
            duplicates,
            unnamed,
        }
    }
}

fn apply_block(block: &BlockData<'_>, data: &[u8], rows: &mut [FileTableRow]) -> Result<()> {
    let mut reader = BinaryReader::new(data);
    let mut scanner = SparseScanner::new(KNOWN_TAGS);
    let row_count = block.rows as usize;

    if row_count > rows.len() {
        warn!(
            segment = block.segment,
            block = block.block,
            rows = row_count,
            entries = rows.len(),
            "block has more rows than the table, ignoring the excess"
        );
    }

    for row in rows.iter_mut().take(row_count) {
        if block.block == 0 {
            row.sparse[block.segment] = Some(scanner.next_row(&mut reader));
        } else {
            let schema = COLUMN_SCHEMAS[block.segment][block.block - 1];
            let fields = decode_fields(&mut reader, schema).map_err(|e| {
                Error::Format(format!(
                    "segment {} block {} row {}: {}",
                    block.segment, block.block, row.index, e
                ))
            })?;
            row.apply(block.segment, block.block, &fields);
        }
    }

    if !reader.is_empty() {
        warn!(
            segment = block.segment,
            block = block.block,
            unread = reader.remaining(),
            "not all block data read"
        );
    }

    Ok(())
}

/// Name starting at or around `offset` in a NUL-separated blob.
///
/// Some archives store offsets that point into the middle of a name, so the
/// start is moved back to just after the preceding NUL.
pub fn resolve_name(names: &[u8], offset: usize) -> Option<String> {
    if offset > names.len() {
        warn!(offset, len = names.len(), "name offset outside the name blob");
        return None;
    }

    let start = memrchr(0, &names[..offset]).map_or(0, |nul| nul + 1);
    let end = memchr(0, &names[offset..]).map_or(names.len(), |nul| offset + nul);
    Some(String::from_utf8_lossy(&names[start..end]).into_owned())
}
