//! MNF index container parsing.
//!
//! An index starts with the magic `MES2` and a little-endian version word,
//! followed by a header with mixed byte order and three zlib blocks:
//!
//! - id table: one sparse, tagged 32-bit row per entry
//! - flags: [`FlagsRecord`] per entry
//! - locations: [`LocationRecord`] per entry

use std::collections::btree_map::{BTreeMap, Entry as MapEntry};
use std::path::Path;
use std::time::Instant;

use mnfkit_common::schema::{decode_fields, Condition, FieldDef, FieldList, FieldSummary, Len};
use mnfkit_common::BinaryReader;
use rayon::prelude::*;
use tracing::{debug, info, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::codec::inflate_sized;
use crate::data_file::DataFile;
use crate::entry::{Entry, EntryId};
use crate::scan::{SparseScanner, KNOWN_TAGS};
use crate::{Error, Result};

/// Index file magic.
pub const MNF_MAGIC: &[u8; 4] = b"MES2";

/// The only supported container version.
pub const MNF_VERSION: u16 = 3;

/// Extension of index files.
pub const MNF_EXTENSION: &str = "mnf";

/// Carrier file id used by `game.mnf` archives.
pub const GAME_CARRIER_FILE_ID: u32 = 0;

/// Carrier file id used by `eso.mnf` archives.
pub const ESO_CARRIER_FILE_ID: u32 = 0x00FF_FFFF;

const HAS_EXTRA: Condition = Condition::Equals("block_type1", 0);

/// Header layout following the magic and version.
pub const HEADER_SCHEMA: &[FieldDef] = &[
    FieldDef::u16("data_file_count"),
    FieldDef::u16_array("data_file_lookup", Len::Field("data_file_count")),
    FieldDef::u32("unknown0").be(),
    FieldDef::u32("eof_offset"),
    FieldDef::u16("block_type1").be(),
    FieldDef::u16("extra_type").be().when(HAS_EXTRA),
    FieldDef::u32("extra1_size").be().when(HAS_EXTRA),
    FieldDef::bytes("extra1", Len::Field("extra1_size")).when(HAS_EXTRA),
    FieldDef::u32("extra2_size").be().when(HAS_EXTRA),
    FieldDef::bytes("extra2", Len::Field("extra2_size")).when(HAS_EXTRA),
    FieldDef::u16("block_type2").be().when(HAS_EXTRA),
    FieldDef::u32("unknown1").be(),
    FieldDef::u32("unknown2").be(),
    FieldDef::u32("file_count1").be(),
    FieldDef::u32("file_count2").be(),
    FieldDef::u32("id_table_size").be(),
    FieldDef::u32("id_table_compressed_size").be(),
    FieldDef::bytes("id_table", Len::Field("id_table_compressed_size")),
    FieldDef::u32("flags_size").be(),
    FieldDef::u32("flags_compressed_size").be(),
    FieldDef::bytes("flags", Len::Field("flags_compressed_size")),
    FieldDef::u32("locations_size").be(),
    FieldDef::u32("locations_compressed_size").be(),
    FieldDef::bytes("locations", Len::Field("locations_compressed_size")),
];

/// Per-entry record of the flags block.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct FlagsRecord {
    pub file_id: u32,
    pub flags: u32,
}

/// Per-entry record of the location block.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct LocationRecord {
    pub decompressed_size: u32,
    pub compressed_size: u32,
    pub reserved: u32,
    pub offset: u32,
    pub data_file: u8,
    pub reserved2: u8,
    pub compression: u16,
}

/// Sizes of one embedded zlib block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BlockInfo {
    pub size: u32,
    pub compressed_size: u32,
}

/// The optional area present when `block_type1 == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExtraBlock {
    pub extra_type: u16,
    pub extra1_size: u32,
    pub extra2_size: u32,
    pub block_type2: u16,
}

/// Typed index header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ContainerHeader {
    pub version: u16,
    pub data_file_count: u16,
    pub data_file_lookup: Vec<u16>,
    pub eof_offset: u32,
    pub block_type1: u16,
    pub extra: Option<ExtraBlock>,
    pub file_count1: u32,
    /// Number of entries.
    pub file_count2: u32,
    pub id_table: BlockInfo,
    pub flags: BlockInfo,
    pub locations: BlockInfo,
}

impl ContainerHeader {
    fn from_fields(version: u16, fields: &FieldList<'_>) -> Result<Self> {
        let u16_field = |name: &'static str| {
            fields
                .u16(name)
                .ok_or_else(|| Error::Format(format!("missing header field {}", name)))
        };
        let u32_field = |name: &'static str| {
            fields
                .u32(name)
                .ok_or_else(|| Error::Format(format!("missing header field {}", name)))
        };
        let block = |size: &'static str, compressed: &'static str| -> Result<BlockInfo> {
            Ok(BlockInfo {
                size: u32_field(size)?,
                compressed_size: u32_field(compressed)?,
            })
        };

        let block_type1 = u16_field("block_type1")?;
        let extra = if block_type1 == 0 {
            Some(ExtraBlock {
                extra_type: u16_field("extra_type")?,
                extra1_size: u32_field("extra1_size")?,
                extra2_size: u32_field("extra2_size")?,
                block_type2: u16_field("block_type2")?,
            })
        } else {
            None
        };

        Ok(Self {
            version,
            data_file_count: u16_field("data_file_count")?,
            data_file_lookup: fields.u16_array("data_file_lookup").unwrap_or_default().to_vec(),
            eof_offset: u32_field("eof_offset")?,
            block_type1,
            extra,
            file_count1: u32_field("file_count1")?,
            file_count2: u32_field("file_count2")?,
            id_table: block("id_table_size", "id_table_compressed_size")?,
            flags: block("flags_size", "flags_compressed_size")?,
            locations: block("locations_size", "locations_compressed_size")?,
        })
    }
}

/// How the entry carrying the file table is recognised.
///
/// The carrier file ids are reverse-engineered constants, so callers can
/// override the filename heuristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CarrierStrategy {
    /// `game.mnf` → file id 0, `eso.mnf` → 0xFFFFFF, anything else → none.
    #[default]
    Auto,
    /// A fixed file id.
    FileId(u32),
    /// Never look for a file table.
    Disabled,
}

impl CarrierStrategy {
    /// File id of the carrier entry for the archive at `path`.
    pub fn carrier_file_id(&self, path: &Path) -> Option<u32> {
        match *self {
            CarrierStrategy::Auto => {
                let path = path.to_string_lossy();
                if path.ends_with("game.mnf") {
                    Some(GAME_CARRIER_FILE_ID)
                } else if path.ends_with("eso.mnf") {
                    Some(ESO_CARRIER_FILE_ID)
                } else {
                    None
                }
            }
            CarrierStrategy::FileId(id) => Some(id),
            CarrierStrategy::Disabled => None,
        }
    }
}

/// Result of parsing an index file.
#[derive(Debug)]
pub struct Container {
    pub header: ContainerHeader,
    /// Raw header fields for diagnostic dumps.
    pub fields: Vec<FieldSummary>,
    /// Every entry, including invalid and removed ones.
    pub entries: BTreeMap<EntryId, Entry>,
    /// Data files referenced by at least one entry.
    pub data_files: BTreeMap<u8, DataFile>,
    pub carrier: Option<EntryId>,
    /// Unexpected id table rows.
    pub anomalies: usize,
}

/// Parse the index file at `path` whose content is `data`.
pub fn parse_container(path: &Path, data: &[u8], carrier: CarrierStrategy) -> Result<Container> {
    let start = Instant::now();
    let mut reader = BinaryReader::new(data);

    reader.expect_magic(MNF_MAGIC)?;
    let version = reader.read_u16()?;
    if version != MNF_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let fields = decode_fields(&mut reader, HEADER_SCHEMA)?;
    let header = ContainerHeader::from_fields(version, &fields)?;
    if reader.remaining() > 0 {
        debug!(remaining = reader.remaining(), "trailing bytes after index header");
    }

    let raw = [
        (fields.bytes("id_table").unwrap_or_default(), header.id_table),
        (fields.bytes("flags").unwrap_or_default(), header.flags),
        (fields.bytes("locations").unwrap_or_default(), header.locations),
    ];
    let blocks = raw
        .par_iter()
        .map(|(bytes, info)| inflate_sized(bytes, info.size as usize))
        .collect::<Result<Vec<_>>>()?;
    debug!(elapsed = ?start.elapsed(), "index blocks inflated");

    let count = header.file_count2 as usize;
    check_block_len("flags", &blocks[1], count, std::mem::size_of::<FlagsRecord>())?;
    check_block_len("location", &blocks[2], count, std::mem::size_of::<LocationRecord>())?;

    let carrier_file_id = carrier.carrier_file_id(path);
    let mut id_table = BinaryReader::new(&blocks[0]);
    let mut flags_block = BinaryReader::new(&blocks[1]);
    let mut location_block = BinaryReader::new(&blocks[2]);
    let mut scanner = SparseScanner::new(KNOWN_TAGS);
    let mut entries = BTreeMap::new();
    let mut data_files: BTreeMap<u8, DataFile> = BTreeMap::new();
    let mut carrier = None;

    for id in 0..header.file_count2 {
        let row = scanner.next_row(&mut id_table);
        let flags: FlagsRecord = flags_block.read_struct()?;
        let location: LocationRecord = location_block.read_struct()?;

        let data_file = match data_files.entry(location.data_file) {
            MapEntry::Occupied(slot) => slot.into_mut(),
            MapEntry::Vacant(slot) => slot.insert(DataFile::locate(path, location.data_file)),
        };

        let entry = Entry::new(
            id,
            flags.file_id,
            row.tag,
            row.id,
            flags.flags,
            location.offset,
            location.compressed_size,
            location.decompressed_size,
            location.compression,
            location.data_file,
            data_file.prefix(),
            data_file.size(),
        );

        if carrier_file_id == Some(entry.file_id) {
            match carrier {
                None => carrier = Some(id),
                Some(first) => warn!(
                    archive = %path.display(),
                    first,
                    ignored = id,
                    "more than one file table carrier"
                ),
            }
        }

        entries.insert(id, entry);
    }

    let invalid = entries.values().filter(|e| !e.is_valid()).count();
    if invalid > 0 {
        warn!(archive = %path.display(), invalid, "entries outside their data files");
    }
    info!(
        archive = %path.display(),
        entries = entries.len(),
        data_files = data_files.len(),
        elapsed = ?start.elapsed(),
        "parsed index"
    );

    Ok(Container {
        header,
        fields: fields.summaries(),
        entries,
        data_files,
        carrier,
        anomalies: scanner.anomalies(),
    })
}

fn check_block_len(name: &str, block: &[u8], count: usize, width: usize) -> Result<()> {
    let needed = count.saturating_mul(width);
    if block.len() < needed {
        return Err(Error::Format(format!(
            "{} block holds {} bytes, {} entries need {}",
            name,
            block.len(),
            count,
            needed
        )));
    }
    if block.len() > needed {
        debug!(block = name, extra = block.len() - needed, "unused bytes in index block");
    }
    Ok(())
}
