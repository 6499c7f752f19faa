//! Redo record wire format.
//!
//! ```text
//! map_name (varint len + utf8) | body_len u32 BE | key | tag u8 | value
//! ```
//!
//! `tag` is 0 for a delete (no value follows) and 1 for a put. The body
//! length is backpatched once the key and value are written, so a reader can
//! skip records of maps whose codecs it does not know.

use crate::primitives::bytes::{put_str, put_u32_at, ReadBuffer};
use crate::storage::btree::{KeyCodec, ValCodec};
use crate::types::{Result, StoreError};

const TAG_DELETE: u8 = 0;
const TAG_PUT: u8 = 1;

/// One redo record with its body left encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedoRecord {
    pub map: String,
    /// `key | tag | value` as written by [`encode_record`].
    pub body: Vec<u8>,
}

impl RedoRecord {
    /// Appends the record in wire format.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let len = u32::try_from(self.body.len())
            .map_err(|_| StoreError::Invalid("redo record too large"))?;
        put_str(out, &self.map);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.body);
        Ok(())
    }
}

/// Appends one record for `key` in `map`; `value == None` records a delete.
pub fn encode_record<K: KeyCodec, V: ValCodec>(
    out: &mut Vec<u8>,
    map: &str,
    key: &K,
    value: Option<&V>,
) -> Result<()> {
    put_str(out, map);
    let len_at = out.len();
    out.extend_from_slice(&[0u8; 4]);
    K::encode_key(key, out);
    match value {
        Some(value) => {
            out.push(TAG_PUT);
            V::encode_val(value, out);
        }
        None => out.push(TAG_DELETE),
    }
    let body_len = u32::try_from(out.len() - len_at - 4)
        .map_err(|_| StoreError::Invalid("redo record too large"))?;
    put_u32_at(out, len_at, body_len)
}

/// Decodes a record body into its key and, for puts, its value.
pub fn decode_body<K: KeyCodec, V: ValCodec>(body: &[u8]) -> Result<(K, Option<V>)> {
    let mut buf = ReadBuffer::new(body);
    let key = K::decode_key(&mut buf)?;
    let value = match buf.get_u8()? {
        TAG_DELETE => None,
        TAG_PUT => Some(V::decode_val(&mut buf)?),
        _ => return Err(StoreError::Corruption("invalid redo record tag")),
    };
    if !buf.is_empty() {
        return Err(StoreError::Corruption("trailing bytes in redo record"));
    }
    Ok((key, value))
}

/// Parses consecutive records from `src`.
///
/// Stops at the first record that is cut short or malformed and returns the
/// records before it together with the byte length they cover.
pub fn read_records(src: &[u8]) -> (Vec<RedoRecord>, usize) {
    let mut records = Vec::new();
    let mut buf = ReadBuffer::new(src);
    let mut valid = 0;
    while !buf.is_empty() {
        match read_one(&mut buf) {
            Ok(record) => {
                records.push(record);
                valid = buf.position();
            }
            Err(_) => break,
        }
    }
    (records, valid)
}

fn read_one(buf: &mut ReadBuffer<'_>) -> Result<RedoRecord> {
    let map = buf.get_str()?.to_string();
    if map.is_empty() {
        return Err(StoreError::Corruption("redo record without map name"));
    }
    let len = buf.get_u32()? as usize;
    // smallest body: one key byte plus the tag
    if len < 2 {
        return Err(StoreError::Corruption("redo record body too short"));
    }
    let body = buf.get_slice(len)?;
    Ok(RedoRecord {
        map,
        body: body.to_vec(),
    })
}
