use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::encoder::{Encoder, RestoredFile};
use crate::error::{BuildError, OnboardError, Result};
use crate::pack::builder::ARCHIVE_EXT;

#[derive(Debug)]
pub struct RestoreFailure {
    pub archive: PathBuf,
    pub error: BuildError,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub archives: usize,
    pub files: Vec<RestoredFile>,
    pub failures: Vec<RestoreFailure>,
}

impl RestoreReport {
    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Archives under `input`: the file itself, or every `*.obar` below a directory,
/// sorted by path.
pub fn find_archives(input: &Path) -> Result<Vec<PathBuf>> {
    if fs::metadata(input)?.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut found = Vec::new();
    for e in WalkDir::new(input).follow_links(false) {
        let e = e.map_err(std::io::Error::other)?;
        let is_archive = e.file_type().is_file()
            && e.path().extension().is_some_and(|x| x == ARCHIVE_EXT);
        if is_archive {
            found.push(e.into_path());
        }
    }
    found.sort();
    Ok(found)
}

/// Decode every archive found under `input` into `dest`, `parallelism` at a time.
pub fn restore(
    input: &Path,
    dest: &Path,
    backend: &dyn Encoder,
    parallelism: usize,
) -> Result<RestoreReport> {
    let archives = find_archives(input)?;
    fs::create_dir_all(dest)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism.max(1))
        .build()
        .map_err(|e| OnboardError::Format(format!("restore pool: {e}")))?;

    let results: Vec<_> = pool.install(|| {
        archives
            .par_iter()
            .map(|a| (a, backend.decode(a, dest)))
            .collect()
    });

    let mut report = RestoreReport {
        archives: archives.len(),
        ..Default::default()
    };
    for (archive, res) in results {
        match res {
            Ok(files) => {
                info!(archive = %archive.display(), files = files.len(), "archive restored");
                report.files.extend(files);
            }
            Err(error) => {
                error!(archive = %archive.display(), error = %error, "restore failed");
                report.failures.push(RestoreFailure {
                    archive: archive.clone(),
                    error,
                });
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::LocalEncoder;
    use crate::pack::builder::BuildOptions;
    use crate::pack::chunker::ChunkOptions;
    use crate::pack::pipeline::{PackOptions, pack_tree};
    use std::time::Duration;

    #[test]
    fn directory_of_archives_restores_with_parent_path() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("photos");
        fs::create_dir_all(src.join("2024")).unwrap();
        fs::write(src.join("2024/a.jpg"), vec![1u8; 300]).unwrap();
        fs::write(src.join("2024/b.jpg"), vec![2u8; 300]).unwrap();
        fs::write(src.join("index.txt"), b"two photos").unwrap();

        let out = tempfile::tempdir().unwrap();
        let opts = PackOptions {
            chunk: ChunkOptions {
                slice_size_limit: 400,
                parallelism: 2,
                parent_path: true,
            },
            build: BuildOptions {
                out_dir: out.path().to_path_buf(),
                generate_checksum: false,
                build_retries: 0,
                retry_delay: Duration::ZERO,
            },
        };
        let enc = LocalEncoder::default();
        let packed = pack_tree(&src, &opts, &enc).unwrap();
        assert_eq!(packed.descriptors.len(), 2);

        let dest = tempfile::tempdir().unwrap();
        let report = restore(out.path(), dest.path(), &enc, 2).unwrap();
        assert_eq!(report.archives, 2);
        assert!(report.failures.is_empty());
        assert_eq!(report.files.len(), 3);
        assert_eq!(fs::read(dest.path().join("photos/2024/b.jpg")).unwrap(), vec![2u8; 300]);
        assert_eq!(fs::read(dest.path().join("photos/index.txt")).unwrap(), b"two photos");
    }

    #[test]
    fn broken_archive_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("junk.obar"), b"not an archive").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let report = restore(dir.path(), dest.path(), &LocalEncoder::default(), 1).unwrap();
        assert_eq!(report.archives, 1);
        assert_eq!(report.failures.len(), 1);
    }
}
