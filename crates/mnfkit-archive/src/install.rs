//! Discovery of archives inside a game installation.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::container::MNF_EXTENSION;

/// Build stamp location relative to the install directory.
pub const BUILD_STAMP_PATH: &str = "depot/_databuild/databuild.stamp";

/// How deep below the install directory archives are searched for.
pub const MAX_SEARCH_DEPTH: usize = 5;

/// Contents of the build stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BuildInfo {
    pub build_number: String,
    pub build_date: String,
    pub version: String,
}

impl BuildInfo {
    /// Parse the first three lines of a stamp file.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines().map(str::trim);
        let build_number = lines.next()?.to_string();
        let build_date = lines.next()?.to_string();
        let version = lines.next()?.to_string();
        Some(Self {
            build_number,
            build_date,
            version,
        })
    }
}

/// A game installation and the archives found in it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct GameInstall {
    pub path: PathBuf,
    pub build: Option<BuildInfo>,
    /// Index files, sorted.
    pub archives: Vec<PathBuf>,
}

impl GameInstall {
    /// Scan `dir` for index files and the build stamp.
    pub fn discover<P: AsRef<Path>>(dir: P) -> Self {
        let path = dir.as_ref().to_path_buf();

        let mut archives: Vec<PathBuf> = WalkDir::new(&path)
            .max_depth(MAX_SEARCH_DEPTH)
            .into_iter()
            .filter_map(|e| match e {
                Ok(e) => Some(e),
                Err(err) => {
                    warn!("skipping unreadable path: {}", err);
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(MNF_EXTENSION))
            })
            .map(|e| e.into_path())
            .collect();
        archives.sort();

        let stamp = path.join(BUILD_STAMP_PATH);
        let build = match std::fs::read_to_string(&stamp) {
            Ok(text) => BuildInfo::parse(&text),
            Err(e) => {
                debug!(stamp = %stamp.display(), "no build stamp: {}", e);
                None
            }
        };

        Self {
            path,
            build,
            archives,
        }
    }
}
