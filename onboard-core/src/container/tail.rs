use std::io::{Read, Seek, SeekFrom, Write};

pub const TAIL_MAGIC: [u8; 8] = *b"OBARTAIL";
pub const TAIL_LEN: u64 = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TailSummary {
    /// Absolute offset of the CBOR manifest.
    pub manifest_off: u64,
    pub manifest_len: u64,
    pub manifest_blake3: [u8; 32],
    /// Sum of uncompressed file sizes.
    pub total_u: u64,
}

impl TailSummary {
    pub fn write_to<W: Write>(self, mut w: W) -> std::io::Result<()> {
        w.write_all(&self.manifest_off.to_le_bytes())?;
        w.write_all(&self.manifest_len.to_le_bytes())?;
        w.write_all(&self.manifest_blake3)?;
        w.write_all(&self.total_u.to_le_bytes())?;
        w.write_all(&TAIL_MAGIC)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> std::io::Result<Self> {
        let mut t = TailSummary::default();
        let mut buf8 = [0u8; 8];
        r.read_exact(&mut buf8)?;
        t.manifest_off = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf8)?;
        t.manifest_len = u64::from_le_bytes(buf8);
        r.read_exact(&mut t.manifest_blake3)?;
        r.read_exact(&mut buf8)?;
        t.total_u = u64::from_le_bytes(buf8);
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != TAIL_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad tail magic",
            ));
        }
        Ok(t)
    }
}

/// Locate the tail by reading the last `TAIL_LEN` bytes.
pub fn read_tail_at_eof<F: Read + Seek>(f: &mut F) -> std::io::Result<TailSummary> {
    let len = f.seek(SeekFrom::End(0))?;
    if len < TAIL_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "file too small for tail",
        ));
    }
    f.seek(SeekFrom::End(-(TAIL_LEN as i64)))?;
    TailSummary::read_from(f)
}
