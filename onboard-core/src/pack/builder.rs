use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::domain::ArchiveDescriptor;
use crate::encoder::Encoder;
use crate::error::{BuildError, OnboardError, Result};
use crate::pack::chunker::{Chunks, PackingUnit};
use crate::util::hash_forward::HashingForward;

pub const ARCHIVE_EXT: &str = "obar";

#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub out_dir: PathBuf,
    pub generate_checksum: bool,
    /// Extra attempts after a retryable backend failure.
    pub build_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("/tmp/tasks"),
            generate_checksum: true,
            build_retries: 2,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct UnitFailure {
    pub unit_index: usize,
    pub error: BuildError,
}

#[derive(Debug, Default)]
pub struct PackReport {
    /// Ordered by unit index.
    pub descriptors: Vec<ArchiveDescriptor>,
    pub failures: Vec<UnitFailure>,
    pub oversized: Vec<usize>,
}

impl PackReport {
    pub fn total(&self) -> usize {
        self.descriptors.len() + self.failures.len()
    }

    /// Descriptors if every unit built.
    pub fn into_result(self) -> Result<Vec<ArchiveDescriptor>> {
        if self.failures.is_empty() {
            Ok(self.descriptors)
        } else {
            Err(OnboardError::PackIncomplete {
                failed: self.failures.len(),
                total: self.total(),
            })
        }
    }
}

pub fn unit_dir(out_dir: &Path, index: usize) -> PathBuf {
    out_dir.join(format!("unit-{index:06}"))
}

/// Encode one unit into `<out_dir>/unit-<index>/<content_id>.obar`.
///
/// The archive is streamed into a `.partial` file in the unit directory while
/// being digested, then renamed. A failed build leaves nothing behind.
/// Retryable backend failures are retried `build_retries` times.
pub fn build(
    unit: &PackingUnit,
    backend: &dyn Encoder,
    opts: &BuildOptions,
) -> std::result::Result<ArchiveDescriptor, BuildError> {
    let dir = unit_dir(&opts.out_dir, unit.index);
    fs::create_dir_all(&dir)?;

    let mut attempt = 0u32;
    loop {
        match build_once(unit, backend, opts, &dir) {
            Ok(d) => return Ok(d),
            Err(e) if e.is_retryable() && attempt < opts.build_retries => {
                attempt += 1;
                warn!(unit = unit.index, attempt, error = %e, "backend unavailable, retrying");
                thread::sleep(opts.retry_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

fn build_once(
    unit: &PackingUnit,
    backend: &dyn Encoder,
    opts: &BuildOptions,
    dir: &Path,
) -> std::result::Result<ArchiveDescriptor, BuildError> {
    let partial = tempfile::Builder::new()
        .prefix("archive-")
        .suffix(".partial")
        .tempfile_in(dir)?;

    let mut hf = HashingForward::new(BufWriter::new(partial), opts.generate_checksum);
    let written = backend.encode(unit, &mut hf)?;
    hf.flush()?;
    let (w, digests) = hf.finish();
    if written != digests.len {
        return Err(BuildError::Format(format!(
            "encoder reported {written} bytes, {} written",
            digests.len
        )));
    }
    let partial = w.into_inner().map_err(|e| e.into_error())?;
    partial.as_file().sync_all()?;

    let archive_path = dir.join(format!("{}.{ARCHIVE_EXT}", digests.content_id));
    partial.persist(&archive_path).map_err(|e| e.error)?;

    Ok(ArchiveDescriptor {
        content_id: digests.content_id,
        byte_size: digests.len,
        unit: unit.clone(),
        aux_checksum: digests.md5_hex,
        archive_path,
        upload_url: None,
    })
}

/// Build every unit on a pool of `chunks.parallelism()` threads. A failed unit
/// is reported and does not stop the others.
pub fn build_all(chunks: Chunks<'_>, backend: &dyn Encoder, opts: &BuildOptions) -> Result<PackReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(chunks.parallelism())
        .build()
        .map_err(|e| OnboardError::Format(format!("build pool: {e}")))?;

    let results: Vec<(usize, bool, std::result::Result<ArchiveDescriptor, BuildError>)> =
        pool.install(|| {
            chunks
                .par_bridge()
                .map(|unit| {
                    let res = build(&unit, backend, opts);
                    match &res {
                        Ok(d) => info!(
                            unit = unit.index,
                            content_id = %d.content_id,
                            bytes = d.byte_size,
                            files = unit.entries.len(),
                            "archive built"
                        ),
                        Err(e) => error!(unit = unit.index, error = %e, "archive build failed"),
                    }
                    (unit.index, unit.oversized, res)
                })
                .collect()
        });

    let mut report = PackReport::default();
    for (index, oversized, res) in results {
        if oversized {
            report.oversized.push(index);
        }
        match res {
            Ok(d) => report.descriptors.push(d),
            Err(error) => report.failures.push(UnitFailure {
                unit_index: index,
                error,
            }),
        }
    }
    report.descriptors.sort_by_key(|d| d.unit.index);
    report.failures.sort_by_key(|f| f.unit_index);
    report.oversized.sort_unstable();
    Ok(report)
}
