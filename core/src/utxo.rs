//! The unspent-output list: `(tx id, output index, address hint)`. The hint
//! exists purely as a filter optimization — callers must reconsult the
//! referenced output before trusting an amount.

use serde::{Deserialize, Serialize};
use shared::Hash256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentTxOut {
    #[serde(rename = "tx")]
    pub tx_id: Hash256,
    #[serde(rename = "index")]
    pub out_index: u32,
    #[serde(rename = "addr")]
    pub address_hint: String,
}

impl UnspentTxOut {
    #[must_use]
    pub fn new(tx_id: Hash256, out_index: u32, address_hint: String) -> Self {
        Self {
            tx_id,
            out_index,
            address_hint,
        }
    }

    #[must_use]
    pub fn matches(&self, tx_id: &Hash256, out_index: u32) -> bool {
        &self.tx_id == tx_id && self.out_index == out_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_compares_tx_id_and_index() {
        let tx_id = Hash256::sha256(b"tx");
        let utxo = UnspentTxOut::new(tx_id, 2, "addr".to_string());
        assert!(utxo.matches(&tx_id, 2));
        assert!(!utxo.matches(&tx_id, 3));
        assert!(!utxo.matches(&Hash256::sha256(b"other"), 2));
    }
}
