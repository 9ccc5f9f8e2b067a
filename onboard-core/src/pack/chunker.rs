use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::tree::{InputTree, TreeDir, TreeEntry};

/// 16 GiB
pub const DEFAULT_SLICE_SIZE: u64 = 17_179_869_184;

#[derive(Clone, Debug)]
pub struct ChunkOptions {
    pub slice_size_limit: u64,
    /// Upper bound on concurrent archive builds consuming the units.
    pub parallelism: usize,
    /// Record the tree root's name in every unit so restoration recreates it.
    pub parent_path: bool,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            slice_size_limit: DEFAULT_SLICE_SIZE,
            parallelism: 5,
            parent_path: false,
        }
    }
}

impl ChunkOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_size_limit == 0 {
            return Err(ConfigError::InvalidSliceSize);
        }
        if self.parallelism == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingUnit {
    pub index: usize,
    /// Offset of the first entry in the input tree.
    pub first_entry: usize,
    pub source_root: PathBuf,
    pub entries: Vec<TreeEntry>,
    /// Directories recreated when this unit is restored.
    #[serde(default)]
    pub dirs: Vec<TreeDir>,
    pub total_bytes: u64,
    /// A single entry larger than the slice size limit.
    pub oversized: bool,
    pub parent_path: Option<String>,
}

/// Position in the unit sequence. Resuming from a cursor yields the same units
/// an uninterrupted pass would have produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCursor {
    pub entry: usize,
    pub unit: usize,
}

/// Lazy sequence of packing units over an input tree, in tree order.
pub struct Chunks<'a> {
    tree: &'a InputTree,
    limit: u64,
    parallelism: usize,
    parent_path: Option<String>,
    cursor: ChunkCursor,
}

pub fn chunk<'a>(tree: &'a InputTree, opts: &ChunkOptions) -> Result<Chunks<'a>, ConfigError> {
    resume(tree, opts, ChunkCursor::default())
}

pub fn resume<'a>(
    tree: &'a InputTree,
    opts: &ChunkOptions,
    cursor: ChunkCursor,
) -> Result<Chunks<'a>, ConfigError> {
    opts.validate()?;
    let parent_path = if opts.parent_path {
        tree.root()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    } else {
        None
    };
    Ok(Chunks {
        tree,
        limit: opts.slice_size_limit,
        parallelism: opts.parallelism,
        parent_path,
        cursor,
    })
}

impl Chunks<'_> {
    pub fn cursor(&self) -> ChunkCursor {
        self.cursor
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn slice_size_limit(&self) -> u64 {
        self.limit
    }
}

impl Iterator for Chunks<'_> {
    type Item = PackingUnit;

    fn next(&mut self) -> Option<PackingUnit> {
        let entries = self.tree.entries();
        let start = self.cursor.entry;
        if start >= entries.len() {
            return None;
        }

        let mut end = start;
        let mut total = 0u64;
        while end < entries.len() {
            let size = entries[end].size;
            if end > start && total.saturating_add(size) > self.limit {
                break;
            }
            total = total.saturating_add(size);
            end += 1;
            if size > self.limit {
                // alone in its unit
                break;
            }
        }

        let oversized = total > self.limit;
        if oversized {
            let e = &entries[start];
            warn!(
                path = %e.path,
                size = e.size,
                limit = self.limit,
                "entry exceeds slice size limit; packed alone"
            );
        }

        let unit = PackingUnit {
            index: self.cursor.unit,
            first_entry: start,
            source_root: self.tree.root().to_path_buf(),
            entries: entries[start..end].to_vec(),
            dirs: self.tree.dirs_for(start, end).to_vec(),
            total_bytes: total,
            oversized,
            parent_path: self.parent_path.clone(),
        };
        self.cursor = ChunkCursor {
            entry: end,
            unit: self.cursor.unit + 1,
        };
        Some(unit)
    }
}
