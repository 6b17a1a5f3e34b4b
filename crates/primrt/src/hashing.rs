//! Stable fingerprints. Values hashed here end up on disk inside artifacts, so the hash
//! must not depend on the process (no `DefaultHasher`).

use serde::Serialize;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

/// Incremental FNV-1a hasher over raw bytes and serde-encoded values.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintHasher {
    state: u64,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            state: fnv1a_init(),
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.state = fnv1a_bytes(self.state, bytes);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_u64(value.len() as u64);
        self.write_bytes(value.as_bytes());
    }

    /// Hashes the bincode encoding of `value`. Encoding failures only occur for types
    /// bincode cannot represent; they are folded in as a marker byte.
    pub fn write_serialized<T: Serialize + ?Sized>(&mut self, value: &T) {
        match bincode::serialize(value) {
            Ok(bytes) => {
                self.write_u64(bytes.len() as u64);
                self.write_bytes(&bytes);
            }
            Err(_) => self.write_bytes(&[0xff]),
        }
    }

    pub fn finish(self) -> u64 {
        self.state
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

pub fn fingerprint_of<T: Serialize + ?Sized>(value: &T) -> u64 {
    let mut hasher = FingerprintHasher::new();
    hasher.write_serialized(value);
    hasher.finish()
}

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn serialized_fingerprints_separate_adjacent_fields() {
        let left = fingerprint_of(&("ab", "c"));
        let right = fingerprint_of(&("a", "bc"));
        assert_ne!(left, right);
        assert_eq!(left, fingerprint_of(&("ab", "c")));
    }
}
