//! MNF archive aggregate.
//!
//! An [`Archive`] owns everything parsed from one index file: the entry
//! collection, its data files, the optional file table and the search
//! index built from the resolved names. It is immutable after parsing;
//! data files are memory mapped lazily on first read.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use mnfkit_common::schema::FieldSummary;
use tracing::{debug, warn};

use crate::codec::{strip_wrapper_header, ContentDecompressor, DecompressRequest, ZstdDecompressor};
use crate::container::{parse_container, CarrierStrategy, ContainerHeader};
use crate::data_file::DataFile;
use crate::entry::{Entry, EntryId};
use crate::search::{dir_prefix, SearchHit, SearchIndex};
use crate::table::FileTable;
use crate::{Error, Result};

/// Name given to the carrier entry once its table has been loaded.
pub const FILE_TABLE_PATH: &str = "/filetable.zosft";

/// Options for opening an archive.
#[derive(Clone)]
pub struct ArchiveOptions {
    /// Number of index bytes to parse; the whole file when `None`.
    pub declared_size: Option<u64>,
    pub carrier: CarrierStrategy,
    /// Codec for compressed entry content.
    pub decompressor: Arc<dyn ContentDecompressor>,
}

impl ArchiveOptions {
    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_carrier(mut self, carrier: CarrierStrategy) -> Self {
        self.carrier = carrier;
        self
    }

    pub fn with_decompressor(mut self, decompressor: Arc<dyn ContentDecompressor>) -> Self {
        self.decompressor = decompressor;
        self
    }
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            declared_size: None,
            carrier: CarrierStrategy::Auto,
            decompressor: Arc::new(ZstdDecompressor),
        }
    }
}

impl std::fmt::Debug for ArchiveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveOptions")
            .field("declared_size", &self.declared_size)
            .field("carrier", &self.carrier)
            .finish_non_exhaustive()
    }
}

/// Counters of one resolution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ResolutionStats {
    pub linked: usize,
    pub unmatched: usize,
    pub duplicates: usize,
    pub unnamed: usize,
}

/// Entries, links and search index produced by joining the file table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub entries: BTreeMap<EntryId, Entry>,
    /// Table row → entry.
    pub links: BTreeMap<usize, EntryId>,
    pub stats: ResolutionStats,
    pub search: SearchIndex,
}

/// One child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum DirectoryItem {
    Folder {
        name: String,
        path: String,
    },
    File {
        name: String,
        path: String,
        entry: EntryId,
        compressed_size: u32,
        decompressed_size: u32,
    },
}

impl DirectoryItem {
    pub fn name(&self) -> &str {
        match self {
            DirectoryItem::Folder { name, .. } | DirectoryItem::File { name, .. } => name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            DirectoryItem::Folder { path, .. } | DirectoryItem::File { path, .. } => path,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, DirectoryItem::Folder { .. })
    }
}

/// Recursive totals below a folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FolderStats {
    pub folders: usize,
    pub files: usize,
    pub compressed: u64,
    pub decompressed: u64,
}

/// A search match tagged with the archive it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResult {
    Directory { archive: Arc<Path>, path: String },
    File { archive: Arc<Path>, path: String, entry: Entry },
}

impl SearchResult {
    pub fn path(&self) -> &str {
        match self {
            SearchResult::Directory { path, .. } | SearchResult::File { path, .. } => path,
        }
    }

    pub fn archive(&self) -> &Path {
        match self {
            SearchResult::Directory { archive, .. } | SearchResult::File { archive, .. } => archive,
        }
    }
}

/// A parsed MNF archive.
pub struct Archive {
    path: Arc<Path>,
    size: u64,
    header: ContainerHeader,
    fields: Vec<FieldSummary>,
    entries: BTreeMap<EntryId, Entry>,
    live: BTreeSet<EntryId>,
    data_files: BTreeMap<u8, DataFile>,
    carrier: Option<EntryId>,
    table: Option<FileTable>,
    links: BTreeMap<usize, EntryId>,
    stats: ResolutionStats,
    search: SearchIndex,
    id_anomalies: usize,
    decompressor: Arc<dyn ContentDecompressor>,
    extracting: AtomicBool,
}

impl Archive {
    /// Open an archive with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, ArchiveOptions::default())
    }

    /// Open an archive.
    pub fn open_with<P: AsRef<Path>>(path: P, options: ArchiveOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let len = match options.declared_size {
            Some(declared) if declared > mmap.len() as u64 => {
                warn!(
                    archive = %path.display(),
                    declared,
                    actual = mmap.len(),
                    "index is shorter than its declared size"
                );
                mmap.len()
            }
            Some(declared) => declared as usize,
            None => mmap.len(),
        };

        Self::parse(path, &mmap[..len], options)
    }

    /// Parse an index whose bytes are already in memory.
    ///
    /// Data files are still located relative to `path`.
    pub fn parse<P: AsRef<Path>>(path: P, data: &[u8], options: ArchiveOptions) -> Result<Self> {
        let path: Arc<Path> = Arc::from(path.as_ref());
        let container = parse_container(&path, data, options.carrier)?;

        let mut archive = Self {
            path,
            size: data.len() as u64,
            header: container.header,
            fields: container.fields,
            live: BTreeSet::new(),
            entries: container.entries,
            data_files: container.data_files,
            carrier: container.carrier,
            table: None,
            links: BTreeMap::new(),
            stats: ResolutionStats::default(),
            search: SearchIndex::default(),
            id_anomalies: container.anomalies,
            decompressor: options.decompressor,
            extracting: AtomicBool::new(false),
        };
        archive.live = archive
            .entries
            .values()
            .filter(|e| e.is_live())
            .map(|e| e.id)
            .collect();

        if let Some(carrier) = archive.carrier {
            match archive.load_table(carrier) {
                Ok(table) => archive.table = Some(table),
                Err(e) => warn!(
                    archive = %archive.path.display(),
                    "failed to load file table, keeping placeholder names: {}",
                    e
                ),
            }
        } else {
            debug!(archive = %archive.path.display(), "no file table carrier");
        }

        let resolution = archive.resolve_names();
        archive.entries = resolution.entries;
        archive.links = resolution.links;
        archive.stats = resolution.stats;
        archive.search = resolution.search;

        Ok(archive)
    }

    fn load_table(&self, carrier: EntryId) -> Result<FileTable> {
        let entry = self
            .entries
            .get(&carrier)
            .ok_or_else(|| Error::EntryNotFound(format!("carrier entry {}", carrier)))?;
        let content = self.content(entry, true)?;
        FileTable::parse(&content)
    }

    /// Join the file table onto the entries and rebuild the search index.
    ///
    /// The archive is not modified; running this twice yields equal results.
    pub fn resolve_names(&self) -> Resolution {
        let (mut entries, links, mut stats) = match &self.table {
            Some(table) => {
                let join = table.join(&self.entries);
                let stats = ResolutionStats {
                    linked: join.links.len(),
                    unmatched: join.unmatched,
                    duplicates: join.duplicates,
                    unnamed: join.unnamed,
                };
                (join.entries, join.links, stats)
            }
            None => (self.entries.clone(), BTreeMap::new(), ResolutionStats::default()),
        };

        if let (Some(_), Some(carrier)) = (&self.table, self.carrier) {
            if let Some(entry) = entries.remove(&carrier) {
                entries.insert(carrier, entry.renamed(FILE_TABLE_PATH));
            }
        }

        let search = SearchIndex::build(entries.values().filter(|e| e.is_live()));
        stats.linked = links.len();

        Resolution {
            entries,
            links,
            stats,
            search,
        }
    }

    /// Index file path; the archive's identity.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn path_arc(&self) -> Arc<Path> {
        Arc::clone(&self.path)
    }

    /// Number of index bytes parsed.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Raw header fields, for diagnostics.
    #[inline]
    pub fn header_fields(&self) -> &[FieldSummary] {
        &self.fields
    }

    #[inline]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn entry(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    /// Every entry, including invalid and removed ones.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.entries.values()
    }

    /// Extractable entries.
    pub fn live_entries(&self) -> impl Iterator<Item = &Entry> + '_ {
        self.live.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn is_live(&self, id: EntryId) -> bool {
        self.live.contains(&id)
    }

    /// Live entry at `path`.
    pub fn find(&self, path: &str) -> Option<&Entry> {
        self.search.lookup(path).and_then(|id| self.entries.get(&id))
    }

    pub fn carrier(&self) -> Option<&Entry> {
        self.carrier.and_then(|id| self.entries.get(&id))
    }

    pub fn file_table(&self) -> Option<&FileTable> {
        self.table.as_ref()
    }

    /// Entry joined to a file table row.
    pub fn table_row_entry(&self, row: usize) -> Option<&Entry> {
        self.links.get(&row).and_then(|id| self.entries.get(id))
    }

    pub fn resolution_stats(&self) -> ResolutionStats {
        self.stats
    }

    /// Id table rows with unexpected tag/id combinations.
    pub fn id_anomalies(&self) -> usize {
        self.id_anomalies
    }

    pub fn search_index(&self) -> &SearchIndex {
        &self.search
    }

    pub fn data_file(&self, number: u8) -> Option<&DataFile> {
        self.data_files.get(&number)
    }

    pub fn data_files(&self) -> impl Iterator<Item = &DataFile> + '_ {
        self.data_files.values()
    }

    /// Bytes of an entry.
    ///
    /// Stored entries, and any entry when `decompress` is false, borrow the
    /// raw range from the mapped data file. Compressed entries go through the
    /// content codec and lose a wrapper header if one is present.
    pub fn content(&self, entry: &Entry, decompress: bool) -> Result<Cow<'_, [u8]>> {
        if !entry.is_valid() {
            return Err(Error::EntryOutOfBounds {
                id: entry.id,
                path: entry.path().to_string(),
            });
        }

        let data_file = self
            .data_files
            .get(&entry.data_file)
            .ok_or(Error::DataFileMissing(entry.data_file))?;
        let raw = data_file.slice(entry.offset as u64, entry.compressed_size as u64)?;

        if !decompress || !entry.is_compressed() {
            return Ok(Cow::Borrowed(raw));
        }

        let request = DecompressRequest {
            path: data_file.path(),
            offset: entry.offset as u64,
            compressed_size: entry.compressed_size,
            decompressed_size: entry.decompressed_size,
            compression: entry.compression,
            data: raw,
        };
        let decoded = self.decompressor.decompress(&request).map_err(Error::Decompression)?;
        Ok(Cow::Owned(strip_wrapper_header(decoded)))
    }

    /// Bytes of the live entry at `path`.
    pub fn read(&self, path: &str, decompress: bool) -> Result<Cow<'_, [u8]>> {
        let entry = self
            .find(path)
            .ok_or_else(|| Error::EntryNotFound(path.to_string()))?;
        self.content(entry, decompress)
    }

    /// Immediate children of `path`: folders first, then files, each sorted.
    pub fn list_directory(&self, path: &str) -> Vec<DirectoryItem> {
        let prefix = dir_prefix(path);
        let child = |full: &str| -> Option<String> {
            let rest = full.strip_prefix(prefix.as_str())?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let mut items: Vec<DirectoryItem> = self
            .search
            .directories_below(path)
            .filter_map(|dir| {
                child(dir).map(|name| DirectoryItem::Folder {
                    name,
                    path: dir.to_string(),
                })
            })
            .collect();

        items.extend(self.search.files_below(path).filter_map(|(file, id)| {
            let name = child(file)?;
            let entry = self.entries.get(&id)?;
            Some(DirectoryItem::File {
                name,
                path: file.to_string(),
                entry: id,
                compressed_size: entry.compressed_size,
                decompressed_size: entry.decompressed_size,
            })
        }));

        items
    }

    /// Live entries anywhere below `path`.
    pub fn entries_in_folder(&self, path: &str) -> Vec<&Entry> {
        self.search
            .files_below(path)
            .filter_map(|(_, id)| self.entries.get(&id))
            .collect()
    }

    /// Recursive folder and file totals below `path`.
    pub fn folder_stats(&self, path: &str) -> FolderStats {
        let mut stats = FolderStats {
            folders: self.search.directories_below(path).count(),
            ..Default::default()
        };
        for entry in self.entries_in_folder(path) {
            stats.files += 1;
            stats.compressed += entry.compressed_size as u64;
            stats.decompressed += entry.decompressed_size as u64;
        }
        stats
    }

    /// Search directories by path and files by name.
    pub fn search(&self, pattern: &str, is_regex: bool) -> Result<Vec<SearchResult>> {
        let hits = self.search.search(pattern, is_regex)?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| match hit {
                SearchHit::Directory(path) => Some(SearchResult::Directory {
                    archive: self.path_arc(),
                    path,
                }),
                SearchHit::File { path, entry } => {
                    self.entries.get(&entry).map(|e| SearchResult::File {
                        archive: self.path_arc(),
                        path,
                        entry: e.clone(),
                    })
                }
            })
            .collect())
    }

    /// Claim the archive for an extraction job.
    pub(crate) fn begin_extraction(self: &Arc<Self>) -> Option<ExtractionClaim> {
        self.extracting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ExtractionClaim {
                archive: Arc::clone(self),
            })
    }

    /// Whether an extraction job is running.
    pub fn is_extracting(&self) -> bool {
        self.extracting.load(Ordering::Acquire)
    }
}

/// Held while an extraction job runs; releases the archive on drop.
pub(crate) struct ExtractionClaim {
    archive: Arc<Archive>,
}

impl ExtractionClaim {
    pub(crate) fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }
}

impl Drop for ExtractionClaim {
    fn drop(&mut self) {
        self.archive.extracting.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .field("live", &self.live.len())
            .field("data_files", &self.data_files.len())
            .field("table_rows", &self.table.as_ref().map(FileTable::len))
            .finish()
    }
}
