//! Compressed frame envelope.
//!
//! Frame layout:
//!
//! ```text
//! | checksum (16) | method (1) | compressed size (4 LE) | raw size (4 LE) | payload |
//! ```
//!
//! The checksum is CityHash128 v1.0.2 over everything after it. The
//! compressed size counts the 9 header bytes plus the payload.
//!
//! Codecs live in an explicit [`CodecTable`] handed to the connection when it
//! is built. There is no process-wide registry.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use cityhash_rs::cityhash_102_128;
use serde::{Deserialize, Serialize};

use super::binary::ByteRead;
use crate::error::{Error, Result};

pub const CHECKSUM_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 9;

/// Largest frame the server accepts.
pub const MAX_COMPRESSED_SIZE: usize = 0x4000_0000;

/// Outgoing payloads are cut into frames of at most this many raw bytes.
pub const MAX_FRAME_RAW_SIZE: usize = 1024 * 1024;

/// Default zstd level, matching the server's default.
pub const DEFAULT_ZSTD_LEVEL: i32 = 1;

// ============================================================================
// Methods and codecs
// ============================================================================

/// Compression algorithm identifiers as they appear in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Framed but stored uncompressed.
    None,
    Lz4,
    Zstd,
}

impl CompressionMethod {
    pub fn method_byte(self) -> u8 {
        match self {
            CompressionMethod::None => 0x02,
            CompressionMethod::Lz4 => 0x82,
            CompressionMethod::Zstd => 0x90,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(CompressionMethod::None),
            0x82 => Some(CompressionMethod::Lz4),
            0x90 => Some(CompressionMethod::Zstd),
            _ => None,
        }
    }
}

/// A block compressor usable inside the frame envelope.
pub trait Codec: Send + Sync {
    fn method(&self) -> CompressionMethod;

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `payload`, which must expand to exactly `raw_len` bytes.
    fn decompress(&self, payload: &[u8], raw_len: usize) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy)]
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::None
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decompress(&self, payload: &[u8], _raw_len: usize) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Lz4
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::block::compress(raw))
    }

    fn decompress(&self, payload: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        lz4_flex::block::decompress(payload, raw_len)
            .map_err(|e| Error::CorruptFrame(format!("lz4: {}", e)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    pub level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self {
            level: DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl Codec for ZstdCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(raw, self.level).map_err(Error::Io)
    }

    fn decompress(&self, payload: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        zstd::bulk::decompress(payload, raw_len)
            .map_err(|e| Error::CorruptFrame(format!("zstd: {}", e)))
    }
}

/// The set of codecs a connection can read and write.
#[derive(Clone)]
pub struct CodecTable {
    codecs: Vec<Arc<dyn Codec>>,
}

impl CodecTable {
    /// An empty table.
    pub fn empty() -> Self {
        Self { codecs: Vec::new() }
    }

    /// Table with the none, LZ4 and zstd codecs.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register(Arc::new(NoneCodec));
        table.register(Arc::new(Lz4Codec));
        table.register(Arc::new(ZstdCodec::default()));
        table
    }

    /// Add a codec, replacing any codec with the same method.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        let method = codec.method();
        self.codecs.retain(|c| c.method() != method);
        self.codecs.push(codec);
    }

    pub fn get(&self, method: CompressionMethod) -> Option<&dyn Codec> {
        self.codecs
            .iter()
            .find(|c| c.method() == method)
            .map(|c| c.as_ref())
    }

    fn get_by_byte(&self, byte: u8) -> Option<&dyn Codec> {
        CompressionMethod::from_byte(byte).and_then(|m| self.get(m))
    }
}

impl Default for CodecTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for CodecTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.codecs.iter().map(|c| c.method()))
            .finish()
    }
}

/// Negotiated compression for one connection: the codec used for outgoing
/// frames plus the table used to unwrap incoming ones.
#[derive(Debug, Clone)]
pub struct Compression {
    method: CompressionMethod,
    table: Arc<CodecTable>,
}

impl Compression {
    pub fn new(method: CompressionMethod, table: Arc<CodecTable>) -> Result<Self> {
        if table.get(method).is_none() {
            return Err(Error::Usage(format!(
                "no codec registered for {:?}",
                method
            )));
        }
        Ok(Self { method, table })
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn table(&self) -> &CodecTable {
        &self.table
    }

    /// Wrap `raw` into one or more frames appended to `out`.
    pub fn write_frames(&self, raw: &[u8], out: &mut BytesMut) -> Result<()> {
        let codec = self
            .table
            .get(self.method)
            .ok_or_else(|| Error::Usage(format!("no codec registered for {:?}", self.method)))?;

        if raw.is_empty() {
            return encode_frame(codec, raw, out);
        }
        for chunk in raw.chunks(MAX_FRAME_RAW_SIZE) {
            encode_frame(codec, chunk, out)?;
        }
        Ok(())
    }
}

// ============================================================================
// Frame encoding and decoding
// ============================================================================

fn checksum(data: &[u8]) -> u128 {
    // cityhash-rs packs the first half into the high bits; the wire wants it first.
    cityhash_102_128(data).rotate_right(64)
}

/// Append one frame holding `raw` to `out`.
pub fn encode_frame(codec: &dyn Codec, raw: &[u8], out: &mut BytesMut) -> Result<()> {
    let payload = codec.compress(raw)?;
    let compressed_size = HEADER_SIZE + payload.len();
    if compressed_size > MAX_COMPRESSED_SIZE || raw.len() > MAX_COMPRESSED_SIZE {
        return Err(Error::Usage(format!(
            "frame of {} bytes exceeds maximum {}",
            compressed_size.max(raw.len()),
            MAX_COMPRESSED_SIZE
        )));
    }

    let start = out.len();
    out.reserve(CHECKSUM_SIZE + compressed_size);
    out.put_bytes(0, CHECKSUM_SIZE);
    out.put_u8(codec.method().method_byte());
    out.put_u32_le(compressed_size as u32);
    out.put_u32_le(raw.len() as u32);
    out.put_slice(&payload);

    let sum = checksum(&out[start + CHECKSUM_SIZE..]);
    out[start..start + CHECKSUM_SIZE].copy_from_slice(&sum.to_le_bytes());
    Ok(())
}

/// Read one frame from `reader` and return its decompressed payload.
///
/// The checksum is verified before the payload is handed to a codec.
pub fn decode_frame<R: ByteRead>(reader: &mut R, codecs: &CodecTable) -> Result<Vec<u8>> {
    let mut expected = [0u8; CHECKSUM_SIZE];
    reader.read_into(&mut expected)?;

    let mut header = [0u8; HEADER_SIZE];
    reader.read_into(&mut header)?;
    let compressed_size =
        u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let raw_size = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;

    if !(HEADER_SIZE..=MAX_COMPRESSED_SIZE).contains(&compressed_size) {
        return Err(Error::CorruptFrame(format!(
            "compressed size {} out of range",
            compressed_size
        )));
    }
    if raw_size > MAX_COMPRESSED_SIZE {
        return Err(Error::CorruptFrame(format!(
            "raw size {} out of range",
            raw_size
        )));
    }

    let payload = reader.read_bytes(compressed_size - HEADER_SIZE)?;
    let mut framed = Vec::with_capacity(compressed_size);
    framed.extend_from_slice(&header);
    framed.extend_from_slice(&payload);

    if checksum(&framed) != u128::from_le_bytes(expected) {
        return Err(Error::CorruptFrame("checksum mismatch".to_string()));
    }

    let codec = codecs.get_by_byte(header[0]).ok_or_else(|| {
        Error::CorruptFrame(format!("unknown compression method 0x{:02x}", header[0]))
    })?;
    let raw = codec.decompress(&payload, raw_size)?;
    if raw.len() != raw_size {
        return Err(Error::CorruptFrame(format!(
            "decompressed {} bytes, header declares {}",
            raw.len(),
            raw_size
        )));
    }
    Ok(raw)
}

/// A [`ByteRead`] that pulls frames from an inner source on demand.
///
/// Values may straddle frame boundaries; the reader stitches them together.
pub struct FrameReader<'c, R> {
    inner: R,
    codecs: &'c CodecTable,
    current: Vec<u8>,
    pos: usize,
}

impl<'c, R: ByteRead> FrameReader<'c, R> {
    pub fn new(inner: R, codecs: &'c CodecTable) -> Self {
        Self {
            inner,
            codecs,
            current: Vec::new(),
            pos: 0,
        }
    }

    /// Check that the last frame was consumed completely.
    pub fn finish(self) -> Result<()> {
        let trailing = self.current.len() - self.pos;
        if trailing != 0 {
            return Err(Error::MalformedBlock(format!(
                "{} unread bytes left in compressed frame",
                trailing
            )));
        }
        Ok(())
    }
}

impl<R: ByteRead> ByteRead for FrameReader<'_, R> {
    fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dst.len() {
            if self.pos == self.current.len() {
                self.current = decode_frame(&mut self.inner, self.codecs)?;
                self.pos = 0;
                continue;
            }
            let n = (dst.len() - filled).min(self.current.len() - self.pos);
            dst[filled..filled + n].copy_from_slice(&self.current[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(())
    }
}
