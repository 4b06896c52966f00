use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::ChainError;

/// A 32-byte SHA-256 digest, rendered as lowercase fixed-width hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hash256([u8; 32]);

impl Hash256 {
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Single SHA-256 pass; the only digest the wire format ever uses.
    #[must_use]
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Count of MSB-first clear bits across the digest, used by the PoW check.
    #[must_use]
    pub fn leading_zero_bits(&self) -> u32 {
        let mut zeros = 0;
        for &byte in &self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }

    #[must_use]
    pub fn meets_difficulty(&self, difficulty: u32) -> bool {
        self.leading_zero_bits() >= difficulty
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ChainError::InvalidHash(format!("{s}: {e}")))?;
        if bytes.len() != 32 {
            return Err(ChainError::InvalidHash(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl TryFrom<String> for Hash256 {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Hash256> for String {
    fn from(value: Hash256) -> Self {
        value.to_hex()
    }
}

/// Fixed-width big-endian hex helpers used by the canonical encodings (block
/// header, coinbase previous-tx-id, checksum fields).
#[must_use]
pub fn hex8_u32(value: u32) -> String {
    format!("{value:08x}")
}

#[must_use]
pub fn hex16_u64(value: u64) -> String {
    format!("{value:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_round_trips_through_hex() {
        let h = Hash256::zero();
        assert_eq!(h.to_hex().len(), 64);
        assert_eq!(h.to_hex().parse::<Hash256>().unwrap(), h);
    }

    #[test]
    fn leading_zero_bits_counts_msb_first() {
        let mut bytes = [0xffu8; 32];
        bytes[0] = 0x00;
        bytes[1] = 0x0f;
        let h = Hash256::from_bytes(bytes);
        assert_eq!(h.leading_zero_bits(), 12);
    }

    #[test]
    fn meets_difficulty_boundary() {
        let mut bytes = [0u8; 32];
        bytes[2] = 0b0000_0001;
        let h = Hash256::from_bytes(bytes);
        assert!(h.meets_difficulty(23));
        assert!(!h.meets_difficulty(24));
    }

    #[test]
    fn hex_width_helpers() {
        assert_eq!(hex8_u32(0), "00000000");
        assert_eq!(hex8_u32(255), "000000ff");
        assert_eq!(hex16_u64(1), "0000000000000001");
    }
}
