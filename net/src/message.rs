//! Wire envelope and payload types: field names are kept short so an
//! unmodified peer on the existing network can parse them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::{Hash256, TimestampMs};

use emberchain_core::{Block, PendingTransaction};

pub const MSG_VERSION: i32 = 1;
pub const MSG_VERSION_ACK: i32 = 2;
pub const MSG_GET_LATEST_BLOCK: i32 = 10;
pub const MSG_GET_BLOCKS: i32 = 11;
pub const MSG_LATEST_BLOCK: i32 = 15;
pub const MSG_BLOCKS: i32 = 16;
pub const MSG_GET_MEMPOOL: i32 = 50;
pub const MSG_MEMPOOL: i32 = 55;
pub const MSG_PING: i32 = 1000;
pub const MSG_PONG: i32 = 1001;

/// The outer frame every line on the wire decodes into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "t")]
    pub msg_type: i32,
    #[serde(rename = "c")]
    pub checksum: i32,
    #[serde(rename = "d")]
    pub data: String,
}

/// First 4 bytes (big-endian) of SHA-256(data), reinterpreted as a signed
/// 32-bit integer.
#[must_use]
pub fn checksum_of(data: &str) -> i32 {
    let digest = Sha256::digest(data.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl Envelope {
    #[must_use]
    pub fn new(msg_type: i32, data: String) -> Self {
        let checksum = checksum_of(&data);
        Self {
            msg_type,
            checksum,
            data,
        }
    }

    #[must_use]
    pub fn checksum_is_valid(&self) -> bool {
        checksum_of(&self.data) == self.checksum
    }

    pub fn encode_payload<T: Serialize>(msg_type: i32, payload: &T) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_string(payload)?;
        Ok(Self::new(msg_type, data))
    }

    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionPayload {
    pub ver: i32,
    pub height: u64,
    /// 32-byte SHA-256 hex identifying this node instance.
    pub nonce: Hash256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub start_index: u64,
    pub max_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestBlockPayload {
    pub block: Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksPayload {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolPayload {
    pub rel: bool,
    pub txs: Vec<PendingTransaction>,
}

/// Generates a random 32-byte node-instance nonce used in the `Version`
/// handshake to detect self-connections.
#[must_use]
pub fn random_node_nonce() -> Hash256 {
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    Hash256::from_bytes(bytes)
}

#[must_use]
pub fn now_ms() -> TimestampMs {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMs)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_detects_tampering() {
        let env = Envelope::new(MSG_PING, "{}".to_string());
        assert!(env.checksum_is_valid());

        let mut tampered = env.clone();
        tampered.data = "{\"x\":1}".to_string();
        assert!(!tampered.checksum_is_valid());
    }

    #[test]
    fn payload_round_trips_through_envelope() {
        let payload = GetBlocksPayload {
            start_index: 5,
            max_count: 10,
        };
        let env = Envelope::encode_payload(MSG_GET_BLOCKS, &payload).unwrap();
        assert!(env.checksum_is_valid());
        let decoded: GetBlocksPayload = env.decode_payload().unwrap();
        assert_eq!(decoded.start_index, 5);
        assert_eq!(decoded.max_count, 10);
    }
}
