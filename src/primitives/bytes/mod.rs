#![forbid(unsafe_code)]
//! Varints, length-prefixed strings, and a bounds-checked read cursor shared
//! by the page, chunk, and redo-log codecs.

use crate::types::{Result, StoreError};

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use crate::types::{Result, StoreError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(StoreError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if i == 9 && payload > 1 {
                return Err(StoreError::Corruption("varint overflow"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(StoreError::Corruption("varint longer than 10 bytes"))
    }

    /// Encodes an i64 as a ZigZag-encoded varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        let zigzag = ((v << 1) ^ (v >> 63)) as u64;
        encode_u64(zigzag, out);
    }

    /// Decodes a ZigZag-encoded i64 varint from a slice, updating the offset.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let zigzag = decode_u64(src, off)?;
        Ok(((zigzag >> 1) as i64) ^ (-((zigzag & 1) as i64)))
    }
}

/// Appends a varint-length-prefixed UTF-8 string.
pub fn put_str(out: &mut Vec<u8>, s: &str) {
    var::encode_u64(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

/// Appends a varint-length-prefixed byte string.
pub fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    var::encode_u64(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Overwrites four bytes at `at` with `value` in big-endian order.
///
/// Used to backpatch length placeholders once a record body is known.
pub fn put_u32_at(out: &mut [u8], at: usize, value: u32) -> Result<()> {
    let slot = out
        .get_mut(at..at + 4)
        .ok_or(StoreError::Invalid("backpatch offset out of range"))?;
    slot.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Forward-only cursor over an encoded byte slice.
///
/// Every read is bounds checked; running off the end yields
/// [`StoreError::Corruption`] so callers can treat a short buffer as a torn
/// record.
#[derive(Debug, Clone)]
pub struct ReadBuffer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.src.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(StoreError::Corruption("read length overflow"))?;
        let out = self
            .src
            .get(self.pos..end)
            .ok_or(StoreError::Corruption("buffer truncated"))?;
        self.pos = end;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_slice(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.get_slice(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.get_slice(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn get_var_u64(&mut self) -> Result<u64> {
        var::decode_u64(self.src, &mut self.pos)
    }

    pub fn get_var_i64(&mut self) -> Result<i64> {
        var::decode_i64(self.src, &mut self.pos)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_var_u64()?;
        let len = usize::try_from(len).map_err(|_| StoreError::Corruption("length overflow"))?;
        self.get_slice(len)
    }

    pub fn get_str(&mut self) -> Result<&'a str> {
        let raw = self.get_bytes()?;
        std::str::from_utf8(raw).map_err(|_| StoreError::Corruption("string is not utf-8"))
    }
}
