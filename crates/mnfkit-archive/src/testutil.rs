//! Builders for synthetic archives used by the unit tests.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tempfile::TempDir;

use crate::data_file::data_file_path;
use crate::table::ZOSFT_MAGIC;

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// One entry of a synthetic index.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    file_id: u32,
    stored: Vec<u8>,
    decompressed_size: u32,
    compression: u16,
    tag: u8,
    data_file: u8,
    offset_override: Option<u32>,
    id_row: bool,
}

impl EntrySpec {
    /// Uncompressed content.
    pub fn stored(file_id: u32, content: &[u8]) -> Self {
        Self {
            file_id,
            stored: content.to_vec(),
            decompressed_size: content.len() as u32,
            compression: 0,
            tag: 0x80,
            data_file: 0,
            offset_override: None,
            id_row: true,
        }
    }

    /// Zstandard-compressed content.
    pub fn zstd(file_id: u32, content: &[u8]) -> Self {
        Self {
            stored: zstd::encode_all(content, 3).unwrap(),
            compression: 1,
            ..Self::stored(file_id, content)
        }
    }

    pub fn tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    pub fn data_file(mut self, number: u8) -> Self {
        self.data_file = number;
        self
    }

    pub fn decompressed_size(mut self, size: u32) -> Self {
        self.decompressed_size = size;
        self
    }

    /// Record a different offset than where the content was written.
    pub fn offset_override(mut self, offset: u32) -> Self {
        self.offset_override = Some(offset);
        self
    }

    /// Leave this entry without an id table row; only valid for trailing entries.
    pub fn no_id_row(mut self) -> Self {
        self.id_row = false;
        self
    }
}

/// A written archive; the directory is removed on drop.
pub struct BuiltArchive {
    pub dir: TempDir,
    pub index: PathBuf,
}

/// Writes an index file and its data files into a temporary directory.
pub struct IndexBuilder {
    name: String,
    entries: Vec<EntrySpec>,
    extra: Option<(Vec<u8>, Vec<u8>)>,
    declared_count: Option<u32>,
}

impl IndexBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
            extra: None,
            declared_count: None,
        }
    }

    pub fn entry(mut self, entry: EntrySpec) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn extra_block(mut self, first: &[u8], second: &[u8]) -> Self {
        self.extra = Some((first.to_vec(), second.to_vec()));
        self
    }

    /// Declare a different entry count than the number of entries written.
    pub fn declared_count(mut self, count: u32) -> Self {
        self.declared_count = Some(count);
        self
    }

    pub fn write(self) -> BuiltArchive {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join(&self.name);

        let mut data_files: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
        let mut id_table = Vec::new();
        let mut flags = Vec::new();
        let mut locations = Vec::new();

        for (i, entry) in self.entries.iter().enumerate() {
            let data = data_files.entry(entry.data_file).or_default();
            let offset = data.len() as u32;
            data.extend_from_slice(&entry.stored);

            if entry.id_row {
                // an empty row in front of every other entry
                if i % 2 == 1 {
                    id_table.extend_from_slice(&0u32.to_le_bytes());
                }
                let content_id = if entry.tag == 0x80 { i as u32 + 1 } else { 0 };
                id_table.extend_from_slice(&(((entry.tag as u32) << 24) | content_id).to_le_bytes());
            }

            flags.extend_from_slice(&entry.file_id.to_le_bytes());
            flags.extend_from_slice(&0u32.to_le_bytes());

            locations.extend_from_slice(&entry.decompressed_size.to_le_bytes());
            locations.extend_from_slice(&(entry.stored.len() as u32).to_le_bytes());
            locations.extend_from_slice(&0u32.to_le_bytes());
            locations.extend_from_slice(&entry.offset_override.unwrap_or(offset).to_le_bytes());
            locations.push(entry.data_file);
            locations.push(0);
            locations.extend_from_slice(&entry.compression.to_le_bytes());
        }

        let file_count = data_files.keys().max().map_or(1, |n| *n as u16 + 1);
        let count = self.entries.len() as u32;

        let mut out = Vec::new();
        out.extend_from_slice(b"MES2");
        out.extend_from_slice(&3u16.to_le_bytes());
        out.extend_from_slice(&file_count.to_le_bytes());
        for n in 0..file_count {
            out.extend_from_slice(&n.to_le_bytes());
        }
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        match &self.extra {
            Some((first, second)) => {
                out.extend_from_slice(&0u16.to_be_bytes());
                out.extend_from_slice(&7u16.to_be_bytes());
                out.extend_from_slice(&(first.len() as u32).to_be_bytes());
                out.extend_from_slice(first);
                out.extend_from_slice(&(second.len() as u32).to_be_bytes());
                out.extend_from_slice(second);
                out.extend_from_slice(&1u16.to_be_bytes());
            }
            None => out.extend_from_slice(&1u16.to_be_bytes()),
        }
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        out.extend_from_slice(&self.declared_count.unwrap_or(count).to_be_bytes());
        for block in [&id_table, &flags, &locations] {
            let compressed = zlib(block);
            out.extend_from_slice(&(block.len() as u32).to_be_bytes());
            out.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
            out.extend_from_slice(&compressed);
        }

        std::fs::write(&index, out).unwrap();
        for (number, data) in data_files {
            std::fs::write(data_file_path(&index, number), data).unwrap();
        }

        BuiltArchive { dir, index }
    }
}

/// Builds a file table payload.
pub struct TableBuilder {
    rows: Vec<(u32, String)>,
    misalign: BTreeMap<usize, u32>,
    entry_count: Option<u32>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            misalign: BTreeMap::new(),
            entry_count: None,
        }
    }

    pub fn row(mut self, file_id: u32, name: &str) -> Self {
        self.rows.push((file_id, name.to_string()));
        self
    }

    /// Point row `index`'s name offset `by` bytes into its name.
    pub fn misalign(mut self, index: usize, by: u32) -> Self {
        self.misalign.insert(index, by);
        self
    }

    pub fn entry_count_override(mut self, count: u32) -> Self {
        self.entry_count = Some(count);
        self
    }

    fn column(&self, f: impl Fn(usize, u32) -> Vec<u32>) -> Vec<u8> {
        self.rows
            .iter()
            .enumerate()
            .flat_map(|(i, (file_id, _))| f(i, *file_id))
            .flat_map(u32::to_le_bytes)
            .collect()
    }

    pub fn build(&self) -> Vec<u8> {
        let rows = self.rows.len() as u32;

        let mut names = Vec::new();
        let mut offsets = Vec::new();
        for (i, (_, name)) in self.rows.iter().enumerate() {
            offsets.push(names.len() as u32 + self.misalign.get(&i).copied().unwrap_or(0));
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        let sparse: Vec<u8> = (0..rows).flat_map(|i| (0x8000_0000u32 | i).to_le_bytes()).collect();
        let segments: [[Option<Vec<u8>>; 3]; 3] = [
            [
                Some(sparse.clone()),
                Some(self.column(|i, _| vec![i as u32, 0])),
                Some(self.column(|_, id| vec![id])),
            ],
            [
                Some(sparse),
                Some(self.column(|_, id| vec![id])),
                Some(self.column(|i, id| vec![id, offsets[i], 0, 0])),
            ],
            [None, Some(self.column(|_, _| vec![0])), None],
        ];

        let mut out = Vec::new();
        out.extend_from_slice(ZOSFT_MAGIC);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.entry_count.unwrap_or(rows).to_le_bytes());

        for blocks in &segments {
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            for block in blocks {
                let block_rows = if block.is_some() { rows } else { 0 };
                out.extend_from_slice(&block_rows.to_le_bytes());
            }
            for block in blocks.iter().flatten() {
                let compressed = zlib(block);
                out.extend_from_slice(&(block.len() as u32).to_le_bytes());
                out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
                out.extend_from_slice(&compressed);
            }
        }

        out.extend_from_slice(&(names.len() as u32).to_le_bytes());
        out.extend_from_slice(&names);
        out.extend_from_slice(ZOSFT_MAGIC);
        out
    }
}
