//! Varint and little-endian primitives shared by every layer of the codec.
//!
//! Decoding is pure and synchronous: it runs over an in-memory source and
//! reports `Error::TruncatedInput` when the source ends mid-value. The
//! connection uses that signal to read more bytes and retry.

use bytes::BufMut;

use crate::error::{Error, Result};

/// A u64 never needs more than ten 7-bit groups.
pub const MAX_VARINT_LEN: usize = 10;

/// Upper bound for one length-prefixed string (1 GiB).
pub const MAX_STRING_SIZE: u64 = 1 << 30;

// ============================================================================
// Fixed-width scalars
// ============================================================================

/// A scalar stored on the wire as a fixed number of little-endian bytes.
pub trait FixedWidth: Copy + Sized {
    const SIZE: usize;

    fn from_le_slice(bytes: &[u8]) -> Self;

    fn put_le<B: BufMut>(self, buf: &mut B);
}

macro_rules! fixed_width {
    ($($t:ty),* $(,)?) => {
        $(
            impl FixedWidth for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_le_bytes(raw)
                }

                #[inline]
                fn put_le<B: BufMut>(self, buf: &mut B) {
                    buf.put_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

fixed_width!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

// ============================================================================
// Reading
// ============================================================================

/// A source of protocol bytes.
///
/// Implemented for plain slices (`&[u8]`, advanced in place), for
/// [`SliceReader`] and for the decompressing reader in
/// [`super::compression`].
pub trait ByteRead {
    /// Fill `dst` completely or fail with `TruncatedInput`.
    fn read_into(&mut self, dst: &mut [u8]) -> Result<()>;

    /// Bytes known to be available, when the source can tell.
    fn remaining_hint(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_into(&mut byte)?;
        Ok(byte[0])
    }

    #[inline]
    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read an unsigned LEB128 integer.
    fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::ProtocolViolation(
            "varint longer than 10 bytes".to_string(),
        ))
    }

    #[inline]
    fn read_fixed<T: FixedWidth>(&mut self) -> Result<T> {
        let mut raw = [0u8; 32];
        let raw = &mut raw[..T::SIZE];
        self.read_into(raw)?;
        Ok(T::from_le_slice(raw))
    }

    /// Read exactly `len` raw bytes.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if let Some(remaining) = self.remaining_hint() {
            if remaining < len {
                return Err(Error::TruncatedInput);
            }
        }
        let mut bytes = vec![0u8; len];
        self.read_into(&mut bytes)?;
        Ok(bytes)
    }

    /// Read a varint-length-prefixed byte string.
    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()?;
        if len > MAX_STRING_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "string length {} exceeds maximum {}",
                len, MAX_STRING_SIZE
            )));
        }
        self.read_bytes(len as usize)
    }

    /// Read a length-prefixed string, replacing invalid UTF-8.
    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_binary()?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }
}

impl ByteRead for &[u8] {
    #[inline]
    fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.len() < dst.len() {
            return Err(Error::TruncatedInput);
        }
        let (head, tail) = self.split_at(dst.len());
        dst.copy_from_slice(head);
        *self = tail;
        Ok(())
    }

    #[inline]
    fn remaining_hint(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<R: ByteRead + ?Sized> ByteRead for &mut R {
    #[inline]
    fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        (**self).read_into(dst)
    }

    #[inline]
    fn remaining_hint(&self) -> Option<usize> {
        (**self).remaining_hint()
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        (**self).read_bytes(len)
    }
}

/// A slice cursor that remembers how far a failed read wanted to go.
///
/// After `TruncatedInput`, [`SliceReader::wanted`] is a lower bound on the
/// input length needed to get past the point of failure. A fixed-width
/// column or a compressed frame reports its full extent, so the caller can
/// wait for all of it before decoding again.
#[derive(Debug)]
pub struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
    wanted: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            wanted: 0,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Input length the furthest failed read needed, or 0.
    pub fn wanted(&self) -> usize {
        self.wanted
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn short(&mut self, len: usize) -> Error {
        self.wanted = self.wanted.max(self.pos.saturating_add(len));
        Error::TruncatedInput
    }
}

impl ByteRead for SliceReader<'_> {
    fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.remaining() < dst.len() {
            return Err(self.short(dst.len()));
        }
        let end = self.pos + dst.len();
        dst.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    #[inline]
    fn remaining_hint(&self) -> Option<usize> {
        Some(self.remaining())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.remaining() < len {
            return Err(self.short(len));
        }
        let end = self.pos + len;
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}

// ============================================================================
// Writing
// ============================================================================

/// Writers for protocol primitives, available on any `BufMut`.
pub trait ByteWrite {
    fn write_varint(&mut self, value: u64);

    fn write_binary(&mut self, bytes: &[u8]);

    fn write_string(&mut self, s: &str);

    fn write_fixed<T: FixedWidth>(&mut self, value: T);

    fn write_bool(&mut self, value: bool);
}

impl<B: BufMut> ByteWrite for B {
    fn write_varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.put_u8(byte);
                return;
            }
            self.put_u8(byte | 0x80);
        }
    }

    fn write_binary(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.put_slice(bytes);
    }

    #[inline]
    fn write_string(&mut self, s: &str) {
        self.write_binary(s.as_bytes());
    }

    #[inline]
    fn write_fixed<T: FixedWidth>(&mut self, value: T) {
        value.put_le(self);
    }

    #[inline]
    fn write_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }
}
