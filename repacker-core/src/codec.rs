use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::{lzkn64, RepackError, Result};

/// Compression scheme used for the segments of a container.
pub trait SegmentCodec {
    fn decompress(&self, packed: &[u8]) -> Result<Vec<u8>>;
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>>;
}

/// LZKN64 segments, as used by Castlevania 64.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lzkn64;

impl SegmentCodec for Lzkn64 {
    fn decompress(&self, packed: &[u8]) -> Result<Vec<u8>> {
        Ok(lzkn64::decompress(packed))
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(lzkn64::compress(raw))
    }
}

/// zlib segments behind a 4-byte `0x80000000 | total_size` header, as used by
/// Legacy of Darkness.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zlib;

const ZLIB_HEADER_SIZE: usize = 4;
const ZLIB_HEADER_FLAG: u32 = 0x8000_0000;

impl SegmentCodec for Zlib {
    fn decompress(&self, packed: &[u8]) -> Result<Vec<u8>> {
        if packed.len() < ZLIB_HEADER_SIZE {
            return Err(RepackError::Decompression(format!(
                "zlib segment is only {} bytes long",
                packed.len()
            )));
        }

        let declared = u32::from_be_bytes([packed[0], packed[1], packed[2], packed[3]]) & 0x00FF_FFFF;
        let end = (declared as usize).clamp(ZLIB_HEADER_SIZE, packed.len());

        let mut decoder = ZlibDecoder::new(&packed[ZLIB_HEADER_SIZE..end]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| RepackError::Decompression(format!("zlib segment: {e}")))?;
        Ok(out)
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(raw)?;
        let mut data = encoder.finish()?;

        if data.len() % 2 != 0 {
            data.push(0x00);
        }

        let header = ZLIB_HEADER_FLAG + (ZLIB_HEADER_SIZE + data.len()) as u32;
        let mut out = Vec::with_capacity(ZLIB_HEADER_SIZE + data.len());
        out.extend_from_slice(&header.to_be_bytes());
        out.extend_from_slice(&data);
        Ok(out)
    }
}

/// Names a [`SegmentCodec`] in settings and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Lzkn64,
    Zlib,
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::Lzkn64 => f.write_str("lzkn64"),
            CodecKind::Zlib => f.write_str("zlib"),
        }
    }
}

impl FromStr for CodecKind {
    type Err = RepackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lzkn64" | "nagano" => Ok(CodecKind::Lzkn64),
            "zlib" => Ok(CodecKind::Zlib),
            other => Err(RepackError::Config(format!("unknown segment codec: {other}"))),
        }
    }
}
