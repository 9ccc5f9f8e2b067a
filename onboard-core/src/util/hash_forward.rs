use std::io::{Result, Write};

use md5::{Digest, Md5};

use crate::domain::ContentId;

/// Write adapter that digests everything passing through it.
pub struct HashingForward<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
    md5: Option<Md5>,
    pub counted: u64,
}

pub struct Digests {
    pub content_id: ContentId,
    pub md5_hex: Option<String>,
    pub len: u64,
}

impl<W: Write> HashingForward<W> {
    pub fn new(inner: W, with_md5: bool) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            md5: with_md5.then(Md5::new),
            counted: 0,
        }
    }

    pub fn finish(self) -> (W, Digests) {
        let digests = Digests {
            content_id: ContentId(*self.hasher.finalize().as_bytes()),
            md5_hex: self.md5.map(|m| hex::encode(m.finalize())),
            len: self.counted,
        };
        (self.inner, digests)
    }
}

impl<W: Write> Write for HashingForward<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        if let Some(m) = self.md5.as_mut() {
            m.update(&buf[..n]);
        }
        self.counted += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
