#![forbid(unsafe_code)]

pub trait Checksum {
    fn reset(&mut self);
    fn update(&mut self, bytes: &[u8]);
    fn finalize(&self) -> u32;
}

pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a page record, salted with the chunk it lives in so a record
/// copied into the wrong chunk does not validate.
pub fn page_record_crc32(chunk_id: u32, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&chunk_id.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// CRC32 over several slices as if they were concatenated.
pub fn compute_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_trait_roundtrip() {
        let mut c = Crc32Fast::default();
        c.update(b"chunk");
        let first = c.finalize();
        c.update(b" header");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"chunk header");
        assert_eq!(c.finalize(), second);
        assert_eq!(compute_crc32(&[b"chunk", b" header"]), second);
    }

    #[test]
    fn page_record_crc32_depends_on_chunk() {
        let payload = vec![3u8; 32];
        assert_eq!(page_record_crc32(1, &payload), page_record_crc32(1, &payload));
        assert_ne!(page_record_crc32(1, &payload), page_record_crc32(2, &payload));
        let mut altered = payload.clone();
        altered[5] = 4;
        assert_ne!(page_record_crc32(1, &payload), page_record_crc32(1, &altered));
    }
}
