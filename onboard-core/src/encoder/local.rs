use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{
    Encoder, PayloadFile, RestoredFile, TrackedRead, UnitPayload, create_restored,
    create_restored_dir, finish_restored, finish_restored_dir,
};
use crate::codec::{CodecId, should_compress};
use crate::container::manifest::{DirEntry, FileEntry, Manifest, Meta, TOOL};
use crate::container::superblock::{HEADER_LEN, Superblock};
use crate::container::tail::{TAIL_LEN, TailSummary, read_tail_at_eof};
use crate::error::BuildError;
use crate::pack::chunker::PackingUnit;
use crate::tree::TreeDir;

/// Bytes of each file trial-compressed to choose its codec.
const SAMPLE_LEN: u64 = 64 * 1024;

/// In-process archive encoder.
#[derive(Clone, Debug)]
pub struct LocalEncoder {
    pub level: i32,
    /// Minimum fraction a trial compression must save for zstd to be used.
    pub min_gain: f32,
}

impl Default for LocalEncoder {
    fn default() -> Self {
        Self {
            level: 3,
            min_gain: 0.05,
        }
    }
}

struct Source<R> {
    path: String,
    mode: u32,
    mtime: i64,
    size: u64,
    origin: PathBuf,
    reader: R,
}

struct CountingWriter<'a> {
    inner: &'a mut dyn Write,
    n: u64,
}

impl Write for CountingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let k = self.inner.write(buf)?;
        self.n += k as u64;
        Ok(k)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Refuses to accept more than the manifest said a file decodes to.
struct BoundedWriter<W> {
    inner: W,
    left: u64,
}

impl<W: Write> Write for BoundedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.len() as u64 > self.left {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "decoded data exceeds recorded size",
            ));
        }
        let k = self.inner.write(buf)?;
        self.left -= k as u64;
        Ok(k)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn dir_entries(dirs: &[TreeDir]) -> Vec<DirEntry> {
    dirs.iter()
        .map(|d| DirEntry {
            path: d.path.clone(),
            mode: d.mode,
            mtime: d.mtime,
        })
        .collect()
}

/// Receives decoded files while an archive is read.
trait ArchiveSink {
    type Out: Write;

    fn begin(&mut self, _manifest: &Manifest) -> Result<(), BuildError> {
        Ok(())
    }
    fn open(&mut self, entry: &FileEntry) -> Result<Self::Out, BuildError>;
    fn close(&mut self, entry: &FileEntry, out: Self::Out) -> Result<(), BuildError>;
    fn end(&mut self) -> Result<(), BuildError> {
        Ok(())
    }
}

struct DirSink<'a> {
    dest: &'a Path,
    parent_path: Option<String>,
    current: Option<PathBuf>,
    dirs: Vec<(PathBuf, u32)>,
    restored: Vec<RestoredFile>,
}

impl ArchiveSink for DirSink<'_> {
    type Out = BufWriter<File>;

    fn begin(&mut self, manifest: &Manifest) -> Result<(), BuildError> {
        self.parent_path = manifest.parent_path.clone();
        for d in &manifest.dirs {
            let path = create_restored_dir(self.dest, self.parent_path.as_deref(), &d.path)?;
            self.dirs.push((path, d.mode));
        }
        Ok(())
    }

    fn open(&mut self, entry: &FileEntry) -> Result<Self::Out, BuildError> {
        let (path, f) = create_restored(self.dest, self.parent_path.as_deref(), &entry.path)?;
        self.current = Some(path);
        Ok(BufWriter::new(f))
    }

    fn close(&mut self, entry: &FileEntry, mut out: Self::Out) -> Result<(), BuildError> {
        out.flush()?;
        drop(out);
        if let Some(path) = self.current.take() {
            finish_restored(&path, entry.mode)?;
            self.restored.push(RestoredFile {
                path,
                size: entry.u_size,
            });
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), BuildError> {
        for (path, mode) in self.dirs.drain(..) {
            finish_restored_dir(&path, mode)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct PayloadSink {
    payload: UnitPayload,
}

impl ArchiveSink for PayloadSink {
    type Out = Vec<u8>;

    fn begin(&mut self, manifest: &Manifest) -> Result<(), BuildError> {
        self.payload.parent_path = manifest.parent_path.clone();
        self.payload.dirs = manifest
            .dirs
            .iter()
            .map(|d| TreeDir {
                path: d.path.clone(),
                mtime: d.mtime,
                mode: d.mode,
            })
            .collect();
        Ok(())
    }

    fn open(&mut self, entry: &FileEntry) -> Result<Self::Out, BuildError> {
        // c_size is bounds-checked against the archive; u_size is not
        Ok(Vec::with_capacity(entry.u_size.min(entry.c_size) as usize))
    }

    fn close(&mut self, entry: &FileEntry, out: Self::Out) -> Result<(), BuildError> {
        self.payload.files.push(PayloadFile {
            path: entry.path.clone(),
            mode: entry.mode,
            mtime: entry.mtime,
            data: out,
        });
        Ok(())
    }
}

impl LocalEncoder {
    /// Encode an in-memory unit. Used by the encoder service.
    pub fn encode_payload(
        &self,
        payload: &UnitPayload,
        out: &mut dyn Write,
    ) -> Result<u64, BuildError> {
        let sources = payload.files.iter().map(|f| {
            Ok::<_, BuildError>(Source {
                path: f.path.clone(),
                mode: f.mode,
                mtime: f.mtime,
                size: f.data.len() as u64,
                origin: PathBuf::from(&f.path),
                reader: &f.data[..],
            })
        });
        self.write_archive(
            payload.parent_path.clone(),
            dir_entries(&payload.dirs),
            sources,
            out,
        )
    }

    /// Decode archive bytes back into an in-memory unit.
    pub fn decode_payload(&self, archive: &[u8]) -> Result<UnitPayload, BuildError> {
        let mut sink = PayloadSink::default();
        read_archive(&mut Cursor::new(archive), &mut sink)?;
        Ok(sink.payload)
    }

    fn pick_codec(&self, sample: &[u8]) -> Result<CodecId, BuildError> {
        if sample.is_empty() || self.level <= 0 {
            return Ok(CodecId::Store);
        }
        let mut trial = Vec::with_capacity(sample.len());
        CodecId::Zstd
            .compressor()
            .compress(&mut &sample[..], &mut trial, self.level)?;
        Ok(if should_compress(sample.len(), trial.len(), self.min_gain) {
            CodecId::Zstd
        } else {
            CodecId::Store
        })
    }

    fn write_archive<I, R>(
        &self,
        parent_path: Option<String>,
        dirs: Vec<DirEntry>,
        sources: I,
        out: &mut dyn Write,
    ) -> Result<u64, BuildError>
    where
        I: Iterator<Item = Result<Source<R>, BuildError>>,
        R: Read,
    {
        let mut out = CountingWriter { inner: out, n: 0 };
        Superblock::current().write_to(&mut out)?;

        let mut files = Vec::new();
        let mut total_u = 0u64;
        for src in sources {
            let Source {
                path,
                mode,
                mtime,
                size,
                origin,
                mut reader,
            } = src?;
            let unreadable = |source: std::io::Error| BuildError::SourceUnreadable {
                path: origin.clone(),
                source,
            };

            let mut sample = Vec::new();
            (&mut reader)
                .take(SAMPLE_LEN)
                .read_to_end(&mut sample)
                .map_err(unreadable)?;
            let codec = self.pick_codec(&sample)?;

            let start = out.n;
            let mut tracked = TrackedRead::new(Cursor::new(sample).chain(reader));
            let u_size = codec
                .compressor()
                .compress(&mut tracked, &mut out, self.level)
                .map_err(|e| {
                    if tracked.failed {
                        unreadable(e)
                    } else {
                        BuildError::Io(e)
                    }
                })?;
            if u_size != size {
                return Err(unreadable(std::io::Error::other(format!(
                    "size changed while packing: expected {size}, read {u_size}"
                ))));
            }

            files.push(FileEntry {
                path,
                mode,
                mtime,
                u_size,
                codec: codec as u8,
                c_size: out.n - start,
                data_off: start - HEADER_LEN,
            });
            total_u += u_size;
        }

        let manifest = Manifest {
            parent_path,
            files,
            dirs,
            meta: Meta { tool: TOOL.into() },
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&manifest, &mut buf)
            .map_err(|e| BuildError::Format(format!("manifest encode: {e}")))?;
        let manifest_off = out.n;
        out.write_all(&buf)?;

        TailSummary {
            manifest_off,
            manifest_len: buf.len() as u64,
            manifest_blake3: *blake3::hash(&buf).as_bytes(),
            total_u,
        }
        .write_to(&mut out)?;
        out.flush()?;
        Ok(out.n)
    }
}

fn format_err(e: std::io::Error) -> BuildError {
    match e.kind() {
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
            BuildError::Format(e.to_string())
        }
        _ => BuildError::Io(e),
    }
}

fn read_archive<R: Read + Seek, S: ArchiveSink>(
    r: &mut R,
    sink: &mut S,
) -> Result<Manifest, BuildError> {
    let stream_len = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(0))?;
    Superblock::read_from(&mut *r).map_err(format_err)?;
    let tail = read_tail_at_eof(r).map_err(format_err)?;

    // every offset below comes from the archive itself and is checked first
    let data_end = stream_len.saturating_sub(TAIL_LEN);
    let in_bounds = tail.manifest_off >= HEADER_LEN
        && tail
            .manifest_off
            .checked_add(tail.manifest_len)
            .is_some_and(|end| end <= data_end);
    if !in_bounds {
        return Err(BuildError::Format(format!(
            "manifest range {}+{} outside archive of {stream_len} bytes",
            tail.manifest_off, tail.manifest_len
        )));
    }

    r.seek(SeekFrom::Start(tail.manifest_off))?;
    let mut buf = vec![0u8; tail.manifest_len as usize];
    r.read_exact(&mut buf).map_err(format_err)?;
    if blake3::hash(&buf).as_bytes() != &tail.manifest_blake3 {
        return Err(BuildError::Format("manifest digest mismatch".into()));
    }
    let manifest: Manifest = ciborium::de::from_reader(&buf[..])
        .map_err(|e| BuildError::Format(format!("manifest decode: {e}")))?;

    let data_len = tail.manifest_off - HEADER_LEN;
    for fe in &manifest.files {
        let fits = fe
            .data_off
            .checked_add(fe.c_size)
            .is_some_and(|end| end <= data_len);
        if !fits {
            return Err(BuildError::Format(format!(
                "data range of {} outside the data section",
                fe.path
            )));
        }
    }

    sink.begin(&manifest)?;
    for fe in &manifest.files {
        let codec = CodecId::from_u8(fe.codec)
            .ok_or_else(|| BuildError::Format(format!("unknown codec {}", fe.codec)))?;
        r.seek(SeekFrom::Start(HEADER_LEN + fe.data_off))?;
        let mut data = (&mut *r).take(fe.c_size);
        let mut out = BoundedWriter {
            inner: sink.open(fe)?,
            left: fe.u_size,
        };
        let produced = codec
            .compressor()
            .decompress(&mut data, &mut out)
            .map_err(format_err)?;
        let out = out.inner;
        if produced != fe.u_size {
            return Err(BuildError::Format(format!(
                "size mismatch for {}: manifest {}, decoded {produced}",
                fe.path, fe.u_size
            )));
        }
        sink.close(fe, out)?;
    }
    sink.end()?;
    Ok(manifest)
}

impl Encoder for LocalEncoder {
    fn encode(&self, unit: &PackingUnit, out: &mut dyn Write) -> Result<u64, BuildError> {
        let sources = unit.entries.iter().map(|e| -> Result<_, BuildError> {
            let origin = unit.source_root.join(&e.path);
            let f = File::open(&origin).map_err(|source| BuildError::SourceUnreadable {
                path: origin.clone(),
                source,
            })?;
            Ok(Source {
                path: e.path.clone(),
                mode: e.mode,
                mtime: e.mtime,
                size: e.size,
                origin,
                reader: BufReader::new(f),
            })
        });
        let n = self.write_archive(
            unit.parent_path.clone(),
            dir_entries(&unit.dirs),
            sources,
            out,
        )?;
        debug!(unit = unit.index, files = unit.entries.len(), bytes = n, "encoded unit");
        Ok(n)
    }

    fn decode(&self, archive: &Path, dest: &Path) -> Result<Vec<RestoredFile>, BuildError> {
        let mut f = BufReader::new(File::open(archive)?);
        let mut sink = DirSink {
            dest,
            parent_path: None,
            current: None,
            dirs: Vec::new(),
            restored: Vec::new(),
        };
        read_archive(&mut f, &mut sink)?;
        Ok(sink.restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::chunker::{ChunkOptions, chunk};
    use crate::tree::InputTree;
    use std::fs;

    fn sample_payload() -> UnitPayload {
        UnitPayload {
            parent_path: None,
            files: vec![
                PayloadFile {
                    path: "text.txt".into(),
                    mode: 0o100644,
                    mtime: 1_700_000_000,
                    data: b"lorem ipsum dolor sit amet ".repeat(500),
                },
                PayloadFile {
                    path: "empty".into(),
                    mode: 0o100600,
                    mtime: 0,
                    data: Vec::new(),
                },
            ],
            dirs: vec![TreeDir {
                path: "cache".into(),
                mtime: 1_700_000_000,
                mode: 0o040755,
            }],
        }
    }

    /// Re-encode the manifest of `bytes` after `edit`, with a matching tail.
    fn rewrite_manifest(bytes: &[u8], edit: impl FnOnce(&mut Manifest)) -> Vec<u8> {
        let tail = read_tail_at_eof(&mut Cursor::new(bytes)).unwrap();
        let start = tail.manifest_off as usize;
        let end = start + tail.manifest_len as usize;
        let mut manifest: Manifest = ciborium::de::from_reader(&bytes[start..end]).unwrap();
        edit(&mut manifest);

        let mut cbor = Vec::new();
        ciborium::ser::into_writer(&manifest, &mut cbor).unwrap();
        let mut out = bytes[..start].to_vec();
        out.extend_from_slice(&cbor);
        TailSummary {
            manifest_off: tail.manifest_off,
            manifest_len: cbor.len() as u64,
            manifest_blake3: *blake3::hash(&cbor).as_bytes(),
            total_u: tail.total_u,
        }
        .write_to(&mut out)
        .unwrap();
        out
    }

    #[test]
    fn payload_round_trips_through_archive_bytes() {
        let enc = LocalEncoder::default();
        let payload = sample_payload();
        let mut bytes = Vec::new();
        let n = enc.encode_payload(&payload, &mut bytes).unwrap();
        assert_eq!(n, bytes.len() as u64);
        assert_eq!(enc.decode_payload(&bytes).unwrap(), payload);
    }

    #[test]
    fn encoding_is_deterministic() {
        let enc = LocalEncoder::default();
        let mut a = Vec::new();
        let mut b = Vec::new();
        enc.encode_payload(&sample_payload(), &mut a).unwrap();
        enc.encode_payload(&sample_payload(), &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn compressible_data_uses_zstd_and_noise_is_stored() {
        let enc = LocalEncoder::default();
        assert_eq!(enc.pick_codec(&[b'a'; 4096]).unwrap(), CodecId::Zstd);
        let mut x = 0x9e37_79b9_7f4a_7c15u64;
        let noise: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect();
        let store = LocalEncoder {
            min_gain: 0.5,
            ..LocalEncoder::default()
        };
        assert_eq!(store.pick_codec(&noise).unwrap(), CodecId::Store);
        assert_eq!(enc.pick_codec(&[]).unwrap(), CodecId::Store);
    }

    #[test]
    fn corrupted_manifest_is_detected() {
        let enc = LocalEncoder::default();
        let mut bytes = Vec::new();
        enc.encode_payload(&sample_payload(), &mut bytes).unwrap();
        // last manifest byte sits just before the tail
        let idx = bytes.len() - 65;
        bytes[idx] ^= 0xff;
        assert!(matches!(
            enc.decode_payload(&bytes),
            Err(BuildError::Format(_))
        ));
    }

    #[test]
    fn manifest_length_past_the_stream_is_rejected() {
        let mut bytes = Vec::new();
        Superblock::current().write_to(&mut bytes).unwrap();
        TailSummary {
            manifest_off: HEADER_LEN,
            manifest_len: 1 << 46,
            manifest_blake3: [0u8; 32],
            total_u: 0,
        }
        .write_to(&mut bytes)
        .unwrap();
        assert!(matches!(
            LocalEncoder::default().decode_payload(&bytes),
            Err(BuildError::Format(_))
        ));
    }

    #[test]
    fn file_extent_past_the_data_section_is_rejected() {
        let enc = LocalEncoder::default();
        let mut bytes = Vec::new();
        enc.encode_payload(&sample_payload(), &mut bytes).unwrap();
        let bad = rewrite_manifest(&bytes, |m| m.files[0].c_size = u64::MAX - 4);
        assert!(matches!(enc.decode_payload(&bad), Err(BuildError::Format(_))));
        let bad = rewrite_manifest(&bytes, |m| m.files[1].data_off = 1 << 40);
        assert!(matches!(enc.decode_payload(&bad), Err(BuildError::Format(_))));
    }

    #[test]
    fn understated_decoded_size_is_rejected() {
        let enc = LocalEncoder::default();
        let mut bytes = Vec::new();
        enc.encode_payload(&sample_payload(), &mut bytes).unwrap();
        let bad = rewrite_manifest(&bytes, |m| m.files[0].u_size = 10);
        assert!(matches!(enc.decode_payload(&bad), Err(BuildError::Format(_))));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let enc = LocalEncoder::default();
        assert!(matches!(
            enc.decode_payload(b"definitely not an archive, just bytes"),
            Err(BuildError::Format(_))
        ));
    }

    #[test]
    fn unit_round_trips_through_disk() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a.txt"), b"alpha".repeat(100)).unwrap();
        fs::write(src.path().join("sub/b.bin"), [0u8, 1, 2, 3]).unwrap();
        fs::create_dir_all(src.path().join("sub/void")).unwrap();

        let tree = InputTree::scan(src.path()).unwrap();
        let unit = chunk(&tree, &ChunkOptions::default()).unwrap().next().unwrap();

        let enc = LocalEncoder::default();
        let archive = src.path().join("unit.obar");
        let mut f = File::create(&archive).unwrap();
        enc.encode(&unit, &mut f).unwrap();
        drop(f);

        let dest = tempfile::tempdir().unwrap();
        let restored = enc.decode(&archive, dest.path()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(
            fs::read(dest.path().join("a.txt")).unwrap(),
            b"alpha".repeat(100)
        );
        assert_eq!(fs::read(dest.path().join("sub/b.bin")).unwrap(), [0u8, 1, 2, 3]);
        assert!(dest.path().join("sub/void").is_dir());
    }

    #[test]
    fn missing_source_is_unreadable() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("gone.txt"), b"soon gone").unwrap();
        let tree = InputTree::scan(src.path()).unwrap();
        let unit = chunk(&tree, &ChunkOptions::default()).unwrap().next().unwrap();
        fs::remove_file(src.path().join("gone.txt")).unwrap();

        let err = LocalEncoder::default()
            .encode(&unit, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, BuildError::SourceUnreadable { .. }));
    }
}
