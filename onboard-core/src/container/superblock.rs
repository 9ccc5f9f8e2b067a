use std::io::{Read, Write};

pub const MAGIC: &[u8; 6] = b"OBARCV";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: u64 = 8;

/// Fixed archive header. Everything else is located through the tail.
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub version: u16,
}

impl Superblock {
    pub fn current() -> Self {
        Self { version: VERSION }
    }

    pub fn write_to(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&self.version.to_le_bytes())?;
        Ok(())
    }

    pub fn read_from(mut r: impl Read) -> std::io::Result<Self> {
        let mut magic = [0u8; 6];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not an onboard archive",
            ));
        }
        let mut v = [0u8; 2];
        r.read_exact(&mut v)?;
        let version = u16::from_le_bytes(v);
        if version != VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported archive version {version}"),
            ));
        }
        Ok(Self { version })
    }
}
