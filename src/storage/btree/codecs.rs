//! Key and value codecs.
//!
//! Keys are compared in their decoded form through `Ord`; the encoding only
//! has to be self-delimiting so records can be concatenated in pages and
//! redo-log entries.

use crate::primitives::bytes::{put_bytes, put_str, var, ReadBuffer};
use crate::types::{Result, StoreError};

/// Trait implemented by key types stored in a [`super::BTree`].
pub trait KeyCodec: Ord + Clone + Send + Sync + 'static {
    /// Appends the encoded form of `key` to `out`.
    fn encode_key(key: &Self, out: &mut Vec<u8>);

    /// Decodes one key from the cursor.
    fn decode_key(src: &mut ReadBuffer<'_>) -> Result<Self>;

    /// Estimated heap plus inline footprint, used for split and cache decisions.
    fn key_memory(key: &Self) -> usize {
        let _ = key;
        std::mem::size_of::<Self>()
    }

    /// Numeric sequence value of a key, for maps that support `append`.
    fn to_sequence(key: &Self) -> Option<u64> {
        let _ = key;
        None
    }

    /// Builds the key for an appended entry.
    fn from_sequence(seq: u64) -> Option<Self> {
        let _ = seq;
        None
    }
}

/// Trait implemented by value types stored in a [`super::BTree`].
pub trait ValCodec: Clone + Send + Sync + 'static {
    /// Appends the encoded form of `value` to `out`.
    fn encode_val(value: &Self, out: &mut Vec<u8>);

    /// Decodes one value from the cursor.
    fn decode_val(src: &mut ReadBuffer<'_>) -> Result<Self>;

    /// Estimated heap plus inline footprint.
    fn val_memory(value: &Self) -> usize {
        let _ = value;
        std::mem::size_of::<Self>()
    }

    /// False while the value carries in-memory state that its encoded form
    /// does not, pinning the leaf that holds it in memory.
    fn can_evict(value: &Self) -> bool {
        let _ = value;
        true
    }

    /// False for a value that saves leave out of the leaf encoding, so the
    /// key is absent once the page is read back.
    fn is_persistent(value: &Self) -> bool {
        let _ = value;
        true
    }

    /// False for a value that the map size does not count.
    fn is_counted(value: &Self) -> bool {
        let _ = value;
        true
    }
}

impl KeyCodec for u64 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn decode_key(src: &mut ReadBuffer<'_>) -> Result<Self> {
        src.get_u64()
    }

    fn to_sequence(key: &Self) -> Option<u64> {
        Some(*key)
    }

    fn from_sequence(seq: u64) -> Option<Self> {
        Some(seq)
    }
}

impl KeyCodec for i64 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        var::encode_i64(*key, out);
    }

    fn decode_key(src: &mut ReadBuffer<'_>) -> Result<Self> {
        src.get_var_i64()
    }

    fn to_sequence(key: &Self) -> Option<u64> {
        u64::try_from(*key).ok()
    }

    fn from_sequence(seq: u64) -> Option<Self> {
        i64::try_from(seq).ok()
    }
}

impl KeyCodec for u32 {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn decode_key(src: &mut ReadBuffer<'_>) -> Result<Self> {
        src.get_u32()
    }

    fn to_sequence(key: &Self) -> Option<u64> {
        Some(u64::from(*key))
    }

    fn from_sequence(seq: u64) -> Option<Self> {
        u32::try_from(seq).ok()
    }
}

impl KeyCodec for String {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        put_str(out, key);
    }

    fn decode_key(src: &mut ReadBuffer<'_>) -> Result<Self> {
        Ok(src.get_str()?.to_owned())
    }

    fn key_memory(key: &Self) -> usize {
        std::mem::size_of::<String>() + key.len()
    }
}

impl KeyCodec for Vec<u8> {
    fn encode_key(key: &Self, out: &mut Vec<u8>) {
        put_bytes(out, key);
    }

    fn decode_key(src: &mut ReadBuffer<'_>) -> Result<Self> {
        Ok(src.get_bytes()?.to_vec())
    }

    fn key_memory(key: &Self) -> usize {
        std::mem::size_of::<Vec<u8>>() + key.len()
    }
}

impl ValCodec for u64 {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        var::encode_u64(*value, out);
    }

    fn decode_val(src: &mut ReadBuffer<'_>) -> Result<Self> {
        src.get_var_u64()
    }
}

impl ValCodec for i64 {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        var::encode_i64(*value, out);
    }

    fn decode_val(src: &mut ReadBuffer<'_>) -> Result<Self> {
        src.get_var_i64()
    }
}

impl ValCodec for bool {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        out.push(u8::from(*value));
    }

    fn decode_val(src: &mut ReadBuffer<'_>) -> Result<Self> {
        match src.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(StoreError::Corruption("invalid bool value")),
        }
    }
}

impl ValCodec for String {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        put_str(out, value);
    }

    fn decode_val(src: &mut ReadBuffer<'_>) -> Result<Self> {
        Ok(src.get_str()?.to_owned())
    }

    fn val_memory(value: &Self) -> usize {
        std::mem::size_of::<String>() + value.len()
    }
}

impl ValCodec for Vec<u8> {
    fn encode_val(value: &Self, out: &mut Vec<u8>) {
        put_bytes(out, value);
    }

    fn decode_val(src: &mut ReadBuffer<'_>) -> Result<Self> {
        Ok(src.get_bytes()?.to_vec())
    }

    fn val_memory(value: &Self) -> usize {
        std::mem::size_of::<Vec<u8>>() + value.len()
    }
}
