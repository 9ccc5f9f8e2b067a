use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::domain::DealAttempt;
use crate::error::StoreError;

const MAGIC: &[u8; 8] = b"OBLOG\0\0\0";
const VERSION: u8 = 1;
const HEADER_LEN: u64 = 9;

/// Append-only log of deal attempts, one per piece.
///
/// Records are a uvarint length followed by a CBOR `DealAttempt`. A torn
/// record at the tail (crash mid-append) is dropped on open.
pub struct Journal {
    f: File,
}

impl Journal {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if f.metadata()?.len() < HEADER_LEN {
            f.set_len(0)?;
            f.write_all(MAGIC)?;
            f.write_all(&[VERSION])?;
            f.flush()?;
        } else {
            read_header(&mut f)?;
            let good_end = {
                let mut r = BufReader::new(&mut f);
                let mut end = HEADER_LEN;
                while let Some((_, len)) = read_next(&mut r)? {
                    end += len;
                }
                end
            };
            f.set_len(good_end)?;
        }
        f.seek(SeekFrom::End(0))?;
        Ok(Self { f })
    }

    pub fn append(&mut self, rec: &DealAttempt) -> Result<(), StoreError> {
        let body = serde_cbor::to_vec(rec)?;
        let mut frame = Vec::with_capacity(body.len() + 10);
        put_uvarint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        self.f.write_all(&frame)?;
        self.f.sync_data()?;
        Ok(())
    }
}

/// All complete records of the journal at `path`, in append order.
pub fn read_all(path: &Path) -> Result<Vec<DealAttempt>, StoreError> {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    read_header(&mut f)?;
    let mut r = BufReader::new(f);
    let mut out = Vec::new();
    while let Some((rec, _)) = read_next(&mut r)? {
        out.push(rec);
    }
    Ok(out)
}

fn read_header(f: &mut File) -> Result<(), StoreError> {
    f.seek(SeekFrom::Start(0))?;
    let mut hdr = [0u8; HEADER_LEN as usize];
    f.read_exact(&mut hdr)?;
    if &hdr[..8] != MAGIC {
        return Err(StoreError::Encoding("not an attempt journal".into()));
    }
    if hdr[8] != VERSION {
        return Err(StoreError::Encoding(format!(
            "unsupported journal version {}",
            hdr[8]
        )));
    }
    Ok(())
}

/// Next record and its framed length, or `None` at a clean or torn end.
fn read_next<R: Read>(r: &mut R) -> Result<Option<(DealAttempt, u64)>, StoreError> {
    let len = match get_uvarint(r)? {
        Some(n) => n,
        None => return Ok(None),
    };
    // the prefix is untrusted: grow with the bytes actually present
    let mut buf = Vec::new();
    r.by_ref().take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Ok(None);
    }
    match serde_cbor::from_slice(&buf) {
        Ok(rec) => Ok(Some((rec, uvarint_len(len) as u64 + len))),
        // torn write that happened to frame cleanly
        Err(_) => Ok(None),
    }
}

fn put_uvarint(out: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        out.push((x as u8) | 0x80);
        x >>= 7;
    }
    out.push(x as u8);
}

fn get_uvarint<R: Read>(r: &mut R) -> Result<Option<u64>, StoreError> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                let byte = b[0];
                if byte < 0x80 {
                    x |= (byte as u64) << s;
                    return Ok(Some(x));
                }
                x |= ((byte & 0x7f) as u64) << s;
                s += 7;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::Encoding("varint too long".into()))
}

fn uvarint_len(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}
