//! Canonical block header encoding and the proof-of-work hash derived from it.

use shared::{hex16_u64, hex8_u32, Hash256, Height, TimestampMs};

/// Builds the exact byte sequence that gets SHA-256'd into a block's hash:
/// 8-hex height, 16-hex timestamp, merkle root hex, previous-hash hex,
/// 8-hex nonce, concatenated as ASCII.
#[must_use]
pub fn header_bytes(
    height: Height,
    timestamp: TimestampMs,
    merkle: &Hash256,
    prev: &Hash256,
    nonce: u32,
) -> Vec<u8> {
    let mut s = String::with_capacity(8 + 16 + 64 + 64 + 8);
    s.push_str(&hex8_u32(height as u32));
    s.push_str(&hex16_u64(timestamp as u64));
    s.push_str(&merkle.to_hex());
    s.push_str(&prev.to_hex());
    s.push_str(&hex8_u32(nonce));
    s.into_bytes()
}

/// Hashes the canonical header for the given fields.
#[must_use]
pub fn block_hash(
    height: Height,
    timestamp: TimestampMs,
    merkle: &Hash256,
    prev: &Hash256,
    nonce: u32,
) -> Hash256 {
    Hash256::sha256(&header_bytes(height, timestamp, merkle, prev, nonce))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bytes_are_pure_ascii_hex_concatenation() {
        let merkle = Hash256::zero();
        let prev = Hash256::zero();
        let bytes = header_bytes(1, 1_610_998_200_000, &merkle, &prev, 0);
        assert_eq!(bytes.len(), 8 + 16 + 64 + 64 + 8);
        assert!(bytes.iter().all(u8::is_ascii_hexdigit));
    }

    #[test]
    fn block_hash_changes_with_nonce() {
        let merkle = Hash256::sha256(b"m");
        let prev = Hash256::sha256(b"p");
        let a = block_hash(5, 1000, &merkle, &prev, 0);
        let b = block_hash(5, 1000, &merkle, &prev, 1);
        assert_ne!(a, b);
    }
}
