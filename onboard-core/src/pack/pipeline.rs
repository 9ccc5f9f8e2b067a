use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::domain::ArchiveDescriptor;
use crate::encoder::Encoder;
use crate::error::{ConfigError, Result};
use crate::pack::builder::{BuildOptions, PackReport, build_all};
use crate::pack::chunker::{ChunkOptions, chunk};
use crate::tree::InputTree;

/// Name of the descriptor listing written next to the archives.
pub const DESCRIPTORS_FILE: &str = "archives.json";

#[derive(Clone, Debug, Default)]
pub struct PackOptions {
    pub chunk: ChunkOptions,
    pub build: BuildOptions,
}

/// Scan `input`, chunk it, build every unit and write `archives.json` into the
/// output directory. Units that failed are left out of the listing.
pub fn pack_tree(input: &Path, opts: &PackOptions, backend: &dyn Encoder) -> Result<PackReport> {
    opts.chunk.validate()?;
    let tree = InputTree::scan(input)?;
    if tree.is_empty() {
        return Err(ConfigError::NoArchives.into());
    }
    info!(
        input = %input.display(),
        files = tree.len(),
        bytes = tree.total_bytes(),
        limit = opts.chunk.slice_size_limit,
        "packing input tree"
    );

    fs::create_dir_all(&opts.build.out_dir)?;
    let report = build_all(chunk(&tree, &opts.chunk)?, backend, &opts.build)?;
    write_descriptors(&descriptors_path(&opts.build.out_dir), &report.descriptors)?;

    if !report.failures.is_empty() {
        warn!(failed = report.failures.len(), total = report.total(), "some units failed to build");
    }
    Ok(report)
}

pub fn descriptors_path(out_dir: &Path) -> PathBuf {
    out_dir.join(DESCRIPTORS_FILE)
}

pub fn write_descriptors(path: &Path, descriptors: &[ArchiveDescriptor]) -> Result<()> {
    let tmp = path.with_extension("json.partial");
    let mut w = BufWriter::new(File::create(&tmp)?);
    serde_json::to_writer_pretty(&mut w, descriptors)?;
    w.flush()?;
    drop(w);
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_descriptors(path: &Path) -> Result<Vec<ArchiveDescriptor>> {
    let r = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(r)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::LocalEncoder;
    use std::time::Duration;

    #[test]
    fn pack_tree_writes_a_readable_listing() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(src.path().join(format!("f{i}.dat")), vec![i as u8; 100]).unwrap();
        }
        let opts = PackOptions {
            chunk: ChunkOptions {
                slice_size_limit: 250,
                parallelism: 3,
                parent_path: false,
            },
            build: BuildOptions {
                out_dir: out.path().to_path_buf(),
                generate_checksum: false,
                build_retries: 0,
                retry_delay: Duration::ZERO,
            },
        };

        let report = pack_tree(src.path(), &opts, &LocalEncoder::default()).unwrap();
        assert_eq!(report.descriptors.len(), 3);
        assert!(report.failures.is_empty());

        let listed = read_descriptors(&descriptors_path(out.path())).unwrap();
        assert_eq!(listed, report.descriptors);
        let files: usize = listed.iter().map(|d| d.unit.entries.len()).sum();
        assert_eq!(files, 5);
    }

    #[test]
    fn empty_input_has_nothing_to_pack() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let opts = PackOptions {
            build: BuildOptions {
                out_dir: out.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(pack_tree(src.path(), &opts, &LocalEncoder::default()).is_err());
    }
}
