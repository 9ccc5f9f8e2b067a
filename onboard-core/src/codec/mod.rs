use std::io::{Read, Write};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecId {
    Store = 0,
    Zstd = 1,
}

impl CodecId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CodecId::Store),
            1 => Some(CodecId::Zstd),
            _ => None,
        }
    }

    pub fn compressor(self) -> &'static dyn Compressor {
        match self {
            CodecId::Store => &Passthrough,
            CodecId::Zstd => &SingleThreadZstd,
        }
    }
}

/// Streaming codec. `compress` returns the number of uncompressed bytes consumed,
/// `decompress` the number of uncompressed bytes produced.
pub trait Compressor: Send + Sync {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> std::io::Result<u64>;
    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> std::io::Result<u64>;
}

/// True if compressing `u` bytes down to `c` saves at least `min_gain` of `u`.
pub fn should_compress(u: usize, c: usize, min_gain: f32) -> bool {
    (u as f64 - c as f64) >= (u as f64 * min_gain as f64)
}

struct Passthrough;

impl Compressor for Passthrough {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, _level: i32) -> std::io::Result<u64> {
        std::io::copy(src, dst)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> std::io::Result<u64> {
        std::io::copy(src, dst)
    }
}

/// No worker threads, so equal input always yields equal frames.
struct SingleThreadZstd;

impl Compressor for SingleThreadZstd {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> std::io::Result<u64> {
        let mut enc = zstd::stream::Encoder::new(dst, level.max(1))?;
        let consumed = std::io::copy(src, &mut enc)?;
        enc.finish()?;
        Ok(consumed)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> std::io::Result<u64> {
        let mut dec = zstd::stream::Decoder::new(src)?;
        std::io::copy(&mut dec, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_threshold() {
        assert!(should_compress(100, 90, 0.05));
        assert!(!should_compress(100, 97, 0.05));
        assert!(!should_compress(0, 9, 0.05));
    }

    #[test]
    fn passthrough_copies_verbatim() {
        let mut out = Vec::new();
        let n = CodecId::Store
            .compressor()
            .compress(&mut &b"raw"[..], &mut out, 9)
            .unwrap();
        assert_eq!((n, out.as_slice()), (3, &b"raw"[..]));
        assert_eq!(CodecId::from_u8(1), Some(CodecId::Zstd));
        assert_eq!(CodecId::from_u8(7), None);
    }

    #[test]
    fn zstd_streams_back_to_input() {
        let input = b"onboard onboard onboard onboard onboard".repeat(64);
        let z = CodecId::Zstd.compressor();
        let mut packed = Vec::new();
        let consumed = z.compress(&mut &input[..], &mut packed, 3).unwrap();
        assert_eq!(consumed, input.len() as u64);
        assert!(packed.len() < input.len());

        let mut out = Vec::new();
        let produced = z.decompress(&mut &packed[..], &mut out).unwrap();
        assert_eq!(produced, input.len() as u64);
        assert_eq!(out, input);
    }
}
