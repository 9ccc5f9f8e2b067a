use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the tree root, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Modification marker, seconds since the unix epoch.
    pub mtime: i64,
    pub mode: u32,
}

/// Directory below the tree root, kept so empty directories and directory
/// modes survive a round trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDir {
    pub path: String,
    pub mtime: i64,
    pub mode: u32,
}

/// Ordered file listing of an input path. Immutable once read.
#[derive(Clone, Debug)]
pub struct InputTree {
    root: PathBuf,
    entries: Vec<TreeEntry>,
    dirs: Vec<TreeDir>,
}

impl InputTree {
    pub fn from_entries(root: impl Into<PathBuf>, entries: Vec<TreeEntry>) -> Self {
        Self {
            root: root.into(),
            entries,
            dirs: Vec::new(),
        }
    }

    pub fn with_dirs(mut self, mut dirs: Vec<TreeDir>) -> Self {
        dirs.sort_by(|a, b| a.path.cmp(&b.path));
        self.dirs = dirs;
        self
    }

    /// Walk `input` (a file or a directory). Entries are sorted by relative path
    /// so the order is a pure function of the tree contents.
    pub fn scan(input: &Path) -> Result<Self> {
        let meta = fs::metadata(input)?;
        if meta.is_file() {
            let root = input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            return Ok(Self {
                root,
                entries: vec![TreeEntry {
                    path: name,
                    size: meta.len(),
                    mtime: mtime_from(&meta),
                    mode: mode_from(&meta),
                }],
                dirs: Vec::new(),
            });
        }

        let mut entries = Vec::new();
        let mut dirs = Vec::new();
        for e in WalkDir::new(input)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
        {
            let e = e.map_err(std::io::Error::other)?;
            let md = e.metadata().map_err(std::io::Error::other)?;
            let path = rel_path(e.path(), input);
            if e.file_type().is_dir() {
                dirs.push(TreeDir {
                    path,
                    mtime: mtime_from(&md),
                    mode: mode_from(&md),
                });
            } else if e.file_type().is_file() {
                entries.push(TreeEntry {
                    path,
                    size: md.len(),
                    mtime: mtime_from(&md),
                    mode: mode_from(&md),
                });
            }
            // symlinks skipped
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        dirs.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(
            root = %input.display(),
            files = entries.len(),
            dirs = dirs.len(),
            "scanned input tree"
        );
        Ok(Self {
            root: input.to_path_buf(),
            entries,
            dirs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn dirs(&self) -> &[TreeDir] {
        &self.dirs
    }

    /// Directories owned by the unit covering `entries[start..end]`.
    ///
    /// A directory goes with the unit holding the first file that sorts after
    /// it; directories after the last file go with the last unit.
    pub fn dirs_for(&self, start: usize, end: usize) -> &[TreeDir] {
        let owner = |d: &TreeDir| self.entries.partition_point(|e| e.path <= d.path);
        let lo = self.dirs.partition_point(|d| owner(d) < start);
        let hi = if end >= self.entries.len() {
            self.dirs.len()
        } else {
            self.dirs.partition_point(|d| owner(d) < end)
        };
        &self.dirs[lo..hi.max(lo)]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

fn rel_path(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn mode_from(_md: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        _md.permissions().mode()
    }
    #[cfg(not(unix))]
    {
        0o100644
    }
}

pub(crate) fn mtime_from(md: &fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
