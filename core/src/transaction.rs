//! Transaction, input, output and mempool-entry types, plus the canonical
//! transaction-id recipe.

use serde::{Deserialize, Serialize};
use shared::{hex16_u64, hex8_u32, Amount, Hash256, Height, TimestampMs};

/// A previously-spent output reference plus its unlocking signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    /// Previous transaction id, hex. For a coinbase input this holds the
    /// 8-hex-digit big-endian block height instead of a real tx id.
    #[serde(rename = "t")]
    pub prev_tx: String,
    #[serde(rename = "i")]
    pub prev_index: u32,
    #[serde(rename = "s")]
    pub signature: String,
}

impl TxIn {
    #[must_use]
    pub fn coinbase(height: Height) -> Self {
        Self {
            prev_tx: hex8_u32(height as u32),
            prev_index: 0,
            signature: String::new(),
        }
    }

    #[must_use]
    pub fn is_coinbase_shaped(&self) -> bool {
        self.prev_tx.len() == 8 && self.prev_index == 0 && self.signature.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    #[serde(rename = "c")]
    pub amount: Amount,
    #[serde(rename = "a")]
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash256,
    #[serde(rename = "i")]
    pub inputs: Vec<TxIn>,
    #[serde(rename = "o")]
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    /// Builds a transaction from inputs/outputs and stamps its canonical id.
    #[must_use]
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        let id = Self::compute_id(&inputs, &outputs);
        Self {
            id,
            inputs,
            outputs,
        }
    }

    #[must_use]
    pub fn new_coinbase(height: Height, reward: Amount, miner_address: String) -> Self {
        Self::new(
            vec![TxIn::coinbase(height)],
            vec![TxOut {
                amount: reward,
                address: miner_address,
            }],
        )
    }

    /// SHA-256 over (prev tx id, 8-hex prev index) per input, then
    /// (address, 16-hex amount) per output, concatenated in order.
    #[must_use]
    pub fn compute_id(inputs: &[TxIn], outputs: &[TxOut]) -> Hash256 {
        let mut buf = String::new();
        for input in inputs {
            buf.push_str(&input.prev_tx);
            buf.push_str(&hex8_u32(input.prev_index));
        }
        for output in outputs {
            buf.push_str(&output.address);
            buf.push_str(&hex16_u64(output.amount as u64));
        }
        Hash256::sha256(buf.as_bytes())
    }

    /// Whether the recomputed id matches the stored id — never trust `id`
    /// on a transaction that arrived from the wire.
    #[must_use]
    pub fn id_is_consistent(&self) -> bool {
        Self::compute_id(&self.inputs, &self.outputs) == self.id
    }

    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_coinbase_shaped()
    }

    #[must_use]
    pub fn total_output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.amount).sum()
    }
}

/// A transaction sitting in the mempool, stamped with its arrival time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    #[serde(rename = "t")]
    pub arrival_ms: TimestampMs,
    pub tx: Transaction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coinbase_input_encodes_height_as_prev_tx() {
        let input = TxIn::coinbase(42);
        assert_eq!(input.prev_tx, "0000002a");
        assert!(input.is_coinbase_shaped());
    }

    #[test]
    fn id_round_trips_through_recomputation() {
        let tx = Transaction::new_coinbase(7, 100, "addr".to_string());
        assert!(tx.id_is_consistent());
    }

    #[test]
    fn different_outputs_yield_different_ids() {
        let a = Transaction::new_coinbase(1, 100, "addr-a".to_string());
        let b = Transaction::new_coinbase(1, 100, "addr-b".to_string());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn is_coinbase_requires_single_shaped_input() {
        let coinbase = Transaction::new_coinbase(1, 100, "addr".to_string());
        assert!(coinbase.is_coinbase());

        let regular = Transaction::new(
            vec![TxIn {
                prev_tx: Hash256::sha256(b"parent").to_hex(),
                prev_index: 0,
                signature: "sig.pubkey".to_string(),
            }],
            vec![TxOut {
                amount: 10,
                address: "addr".to_string(),
            }],
        );
        assert!(!regular.is_coinbase());
    }
}
