//! Content checksums (BLAKE3, hex encoded).
//!
//! Checksums depend on content only: the same bytes always hash to the same
//! string regardless of file name or source.

use crate::constants::KDF_CONTEXT_SESSION_PASSWORD;

/// Hex-encoded BLAKE3 hash of `data`.
pub fn checksum(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Incremental hasher for content that arrives in pieces.
#[derive(Default)]
pub struct Checksummer {
    hasher: blake3::Hasher,
}

impl Checksummer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(data);
        self
    }

    pub fn finalize(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

/// One-way hash of a session password (BLAKE3 KDF with domain separation).
pub fn derive_password_hash(password: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SESSION_PASSWORD);
    hasher.update(password);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_deterministic() {
        let data = b"hello meshlink";
        assert_eq!(checksum(data), checksum(data));
        assert_eq!(checksum(data).len(), 64);
    }

    #[test]
    fn test_single_byte_mutation_changes_checksum() {
        let data = vec![7u8; 4096];
        let original = checksum(&data);
        for pos in [0usize, 1, 2047, 4095] {
            let mut mutated = data.clone();
            mutated[pos] ^= 0x01;
            assert_ne!(checksum(&mutated), original, "mutation at {pos}");
        }
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut summer = Checksummer::new();
        for piece in data.chunks(1000) {
            summer.update(piece);
        }
        assert_eq!(summer.finalize(), checksum(&data));
    }

    #[test]
    fn test_password_hash_is_not_plain_hash() {
        let derived = derive_password_hash(b"secret");
        assert_ne!(hex::encode(derived), checksum(b"secret"));
        assert_eq!(derived, derive_password_hash(b"secret"));
    }
}
