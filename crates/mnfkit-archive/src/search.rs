//! Path index over resolved entries.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::entry::{Entry, EntryId};
use crate::Result;

/// A match produced by [`SearchIndex::search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchHit {
    Directory(String),
    File { path: String, entry: EntryId },
}

/// Directory set, path map and basename map of the live entries.
///
/// Rebuilt after every resolution pass. Two indexes built from the same
/// entries compare equal. Several entries may share one path; each keeps
/// its own slot in id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchIndex {
    paths: BTreeMap<String, Vec<EntryId>>,
    directories: BTreeSet<String>,
    basenames: BTreeMap<String, Vec<EntryId>>,
}

impl SearchIndex {
    pub fn build<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a Entry>,
    {
        let mut index = Self::default();

        for entry in entries {
            let path = entry.path();
            index.directories.extend(ancestors(path).map(str::to_string));
            index.paths.entry(path.to_string()).or_default().push(entry.id);
            index
                .basenames
                .entry(entry.basename().to_string())
                .or_default()
                .push(entry.id);
        }

        index
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.paths.values().map(Vec::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Entry at exactly `path`, the lowest id when the path is shared.
    pub fn lookup(&self, path: &str) -> Option<EntryId> {
        self.lookup_all(path).first().copied()
    }

    /// Every entry at exactly `path`.
    pub fn lookup_all(&self, path: &str) -> &[EntryId] {
        self.paths.get(path).map_or(&[], Vec::as_slice)
    }

    /// Whether some entry lives below `path`. The root always exists.
    pub fn contains_directory(&self, path: &str) -> bool {
        let path = normalize_dir(path);
        path == "/" || self.directories.contains(path)
    }

    /// Entries with the given file name, in any directory.
    pub fn files_named(&self, name: &str) -> &[EntryId] {
        self.basenames.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn directories(&self) -> impl Iterator<Item = &str> + '_ {
        self.directories.iter().map(String::as_str)
    }

    /// Directories strictly below `path`, in sorted order.
    pub fn directories_below<'s>(&'s self, path: &str) -> impl Iterator<Item = &'s str> + 's {
        let prefix = dir_prefix(path);
        self.directories
            .range(prefix.clone()..)
            .take_while(move |dir| dir.starts_with(&prefix))
            .map(String::as_str)
    }

    /// Files strictly below `path`, in path order.
    pub fn files_below<'s>(&'s self, path: &str) -> impl Iterator<Item = (&'s str, EntryId)> + 's {
        let prefix = dir_prefix(path);
        self.paths
            .range(prefix.clone()..)
            .take_while(move |(p, _)| p.starts_with(&prefix))
            .flat_map(|(p, ids)| ids.iter().map(move |id| (p.as_str(), *id)))
    }

    /// Match directories by full path and files by basename.
    ///
    /// Plain patterns are case-sensitive substrings. Directories come first.
    /// Both groups are in path order rather than index order, so results are
    /// stable across rebuilds. Every entry at a shared path is a separate hit.
    pub fn search(&self, pattern: &str, is_regex: bool) -> Result<Vec<SearchHit>> {
        let matcher = compile(pattern, is_regex)?;
        let mut hits: Vec<SearchHit> = self
            .directories
            .iter()
            .filter(|dir| matcher.is_match(dir))
            .map(|dir| SearchHit::Directory(dir.clone()))
            .collect();

        hits.extend(
            self.paths
                .iter()
                .filter(|(path, _)| matcher.is_match(basename(path)))
                .flat_map(|(path, ids)| {
                    ids.iter().map(move |id| SearchHit::File {
                        path: path.clone(),
                        entry: *id,
                    })
                }),
        );

        Ok(hits)
    }
}

fn compile(pattern: &str, is_regex: bool) -> Result<Regex> {
    if is_regex {
        Ok(Regex::new(pattern)?)
    } else {
        Ok(Regex::new(&regex::escape(pattern))?)
    }
}

/// Ancestor directories of `path`, nearest first, excluding the root.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let (parent, _) = current.rsplit_once('/')?;
        if parent.is_empty() || parent == "/" || parent == "." {
            return None;
        }
        current = parent;
        Some(parent)
    })
}

fn basename(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn normalize_dir(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// `path` with exactly one trailing separator.
pub(crate) fn dir_prefix(path: &str) -> String {
    match normalize_dir(path) {
        "/" => "/".to_string(),
        dir => format!("{}/", dir),
    }
}
