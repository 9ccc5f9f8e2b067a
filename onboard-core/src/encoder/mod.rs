//! Archive encoding backends.
//!
//! [`Backend`] is selected once from configuration and threaded through the
//! builder and the restorer. Both variants produce the same archive format:
//! the remote service wraps a [`LocalEncoder`].

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{EncoderBackend, EncoderSection};
use crate::error::{BuildError, ConfigError};
use crate::pack::chunker::PackingUnit;
use crate::tree::TreeDir;

pub mod local;
pub mod remote;
pub mod service;

pub use local::LocalEncoder;
pub use remote::RemoteServiceEncoder;

pub trait Encoder: Send + Sync {
    /// Encode the unit's files into `out`, returning the archive length.
    fn encode(&self, unit: &PackingUnit, out: &mut dyn Write) -> Result<u64, BuildError>;

    /// Restore the files of `archive` below `dest`.
    fn decode(&self, archive: &Path, dest: &Path) -> Result<Vec<RestoredFile>, BuildError>;
}

pub enum Backend {
    Local(LocalEncoder),
    Remote(RemoteServiceEncoder),
}

impl Backend {
    pub fn from_config(cfg: &EncoderSection) -> Result<Self, crate::error::OnboardError> {
        let local = LocalEncoder {
            level: cfg.compression_level,
            min_gain: cfg.min_gain,
        };
        match cfg.backend {
            EncoderBackend::Local => Ok(Backend::Local(local)),
            EncoderBackend::Remote => {
                let url = cfg
                    .remote_url
                    .as_deref()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or(ConfigError::MissingRemoteUrl)?;
                Ok(Backend::Remote(RemoteServiceEncoder::new(
                    url,
                    cfg.request_timeout(),
                )?))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local",
            Backend::Remote(_) => "remote",
        }
    }
}

impl Encoder for Backend {
    fn encode(&self, unit: &PackingUnit, out: &mut dyn Write) -> Result<u64, BuildError> {
        match self {
            Backend::Local(e) => e.encode(unit, out),
            Backend::Remote(e) => e.encode(unit, out),
        }
    }

    fn decode(&self, archive: &Path, dest: &Path) -> Result<Vec<RestoredFile>, BuildError> {
        match self {
            Backend::Local(e) => e.decode(archive, dest),
            Backend::Remote(e) => e.decode(archive, dest),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoredFile {
    pub path: PathBuf,
    pub size: u64,
}

/// In-memory form of a unit, exchanged with the remote encoder service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitPayload {
    pub parent_path: Option<String>,
    pub files: Vec<PayloadFile>,
    #[serde(default)]
    pub dirs: Vec<TreeDir>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    pub path: String,
    pub mode: u32,
    pub mtime: i64,
    pub data: Vec<u8>,
}

impl UnitPayload {
    /// Read every file of `unit` into memory.
    pub fn from_unit(unit: &PackingUnit) -> Result<Self, BuildError> {
        let mut files = Vec::with_capacity(unit.entries.len());
        for e in &unit.entries {
            let src = unit.source_root.join(&e.path);
            let data = fs::read(&src).map_err(|source| BuildError::SourceUnreadable {
                path: src.clone(),
                source,
            })?;
            files.push(PayloadFile {
                path: e.path.clone(),
                mode: e.mode,
                mtime: e.mtime,
                data,
            });
        }
        Ok(Self {
            parent_path: unit.parent_path.clone(),
            files,
            dirs: unit.dirs.clone(),
        })
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, BuildError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| BuildError::Format(format!("payload encode: {e}")))?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, BuildError> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| BuildError::Format(format!("payload decode: {e}")))
    }

    pub fn write_to(&self, dest: &Path) -> Result<Vec<RestoredFile>, BuildError> {
        let parent = self.parent_path.as_deref();
        let mut made = Vec::with_capacity(self.dirs.len());
        for d in &self.dirs {
            made.push((create_restored_dir(dest, parent, &d.path)?, d.mode));
        }
        let mut restored = Vec::with_capacity(self.files.len());
        for f in &self.files {
            let (path, mut out) = create_restored(dest, self.parent_path.as_deref(), &f.path)?;
            out.write_all(&f.data)?;
            finish_restored(&path, f.mode)?;
            restored.push(RestoredFile {
                path,
                size: f.data.len() as u64,
            });
        }
        for (path, mode) in made {
            finish_restored_dir(&path, mode)?;
        }
        Ok(restored)
    }
}

pub(crate) fn safe_join(root: &Path, rel: &str) -> Result<PathBuf, BuildError> {
    let p = Path::new(rel);
    let escapes = p
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if rel.is_empty() || escapes {
        return Err(BuildError::Format(format!("unsafe path: {rel}")));
    }
    Ok(root.join(p))
}

/// Create the output file for a restored entry, below `dest/<parent>`.
pub(crate) fn create_restored(
    dest: &Path,
    parent_path: Option<&str>,
    rel: &str,
) -> Result<(PathBuf, File), BuildError> {
    let base = match parent_path {
        Some(parent) => safe_join(dest, parent)?,
        None => dest.to_path_buf(),
    };
    let outp = safe_join(&base, rel)?;
    if let Some(parent) = outp.parent() {
        fs::create_dir_all(parent)?;
    }
    let f = File::create(&outp)?;
    Ok((outp, f))
}

/// Create a directory entry below `dest/<parent>`.
pub(crate) fn create_restored_dir(
    dest: &Path,
    parent_path: Option<&str>,
    rel: &str,
) -> Result<PathBuf, BuildError> {
    let base = match parent_path {
        Some(parent) => safe_join(dest, parent)?,
        None => dest.to_path_buf(),
    };
    let outp = safe_join(&base, rel)?;
    fs::create_dir_all(&outp)?;
    Ok(outp)
}

/// Apply a directory's recorded mode once its files are written. The owner
/// keeps rwx so sibling archives restoring into it in parallel still can.
pub(crate) fn finish_restored_dir(_path: &Path, _mode: u32) -> Result<(), BuildError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if _mode != 0 {
            let mode = (_mode & 0o7777) | 0o700;
            fs::set_permissions(_path, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

pub(crate) fn finish_restored(_path: &Path, _mode: u32) -> Result<(), BuildError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if _mode != 0 {
            fs::set_permissions(_path, fs::Permissions::from_mode(_mode & 0o7777))?;
        }
    }
    Ok(())
}

/// Read adapter remembering whether the source side failed, so errors can be
/// attributed to the input file rather than the archive sink.
pub(crate) struct TrackedRead<R: Read> {
    inner: R,
    pub failed: bool,
}

impl<R: Read> TrackedRead<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            failed: false,
        }
    }
}

impl<R: Read> Read for TrackedRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| self.failed = true)
    }
}
