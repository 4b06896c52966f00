//! The block type and the fixed genesis constant.

use serde::{Deserialize, Serialize};
use shared::{Hash256, Height, TimestampMs};

use crate::transaction::Transaction;

/// A block in the chain. Equality (`==`) ignores `transactions` — two blocks
/// with the same header fields are equal even if their transaction lists
/// differ in representation, since the Merkle root is the transactions'
/// canonical summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "i")]
    pub height: Height,
    #[serde(rename = "t")]
    pub timestamp: TimestampMs,
    #[serde(rename = "txs")]
    pub transactions: Vec<Transaction>,
    pub merkle: Hash256,
    pub prev: Hash256,
    #[serde(rename = "h")]
    pub hash: Hash256,
    #[serde(rename = "n")]
    pub nonce: u32,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.height == other.height
            && self.timestamp == other.timestamp
            && self.merkle == other.merkle
            && self.prev == other.prev
            && self.hash == other.hash
            && self.nonce == other.nonce
    }
}

impl Eq for Block {}

/// Fixed genesis timestamp, ms since Unix epoch.
pub const GENESIS_TIMESTAMP_MS: TimestampMs = 1_610_998_200_000;

/// Fixed genesis previous-block-hash constant.
pub const GENESIS_PREV_HASH_HEX: &str =
    "4f571e9b08717e7627336808d26ea36958ccea7ff341cc2d218c3df61bd04d08";

/// Fixed genesis hash constant.
pub const GENESIS_HASH_HEX: &str =
    "4fd2d32ca7af3219af42639d740781fa75ca956a5e100e0de2579731d120e9f2";

/// Builds the fixed genesis block.
#[must_use]
pub fn genesis_block() -> Block {
    Block {
        height: 0,
        timestamp: GENESIS_TIMESTAMP_MS,
        transactions: Vec::new(),
        merkle: Hash256::zero(),
        prev: GENESIS_PREV_HASH_HEX.parse().expect("fixed constant"),
        hash: GENESIS_HASH_HEX.parse().expect("fixed constant"),
        nonce: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_matches_fixed_constants() {
        let g = genesis_block();
        assert_eq!(g.height, 0);
        assert_eq!(g.hash.to_hex(), GENESIS_HASH_HEX);
        assert!(g.transactions.is_empty());
    }

    #[test]
    fn equality_ignores_transaction_contents() {
        let mut a = genesis_block();
        let mut b = genesis_block();
        a.transactions
            .push(crate::transaction::Transaction::new_coinbase(
                0,
                1,
                "x".to_string(),
            ));
        b.transactions.clear();
        assert_eq!(a, b);
    }
}
