//! Transaction index, lazily-populated body cache, UTXO list, and mempool.
//!
//! Reads block bodies through a borrowed `&BlockStore` rather than owning
//! one — block-store ownership stays at the top of the chain engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shared::{Amount, ChainError, Hash256, Height, Result, TimestampMs};

use crate::block::Block;
use crate::params::{FEE_PER_TX, MAX_TX_IN_BLOCK};
use crate::store::block_store::BlockStore;
use crate::transaction::{PendingTransaction, Transaction, TxOut};
use crate::utxo::UnspentTxOut;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TxLocation {
    block: Height,
    index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct TxIndexDocument {
    tx_indices: HashMap<Hash256, TxLocation>,
    utxo: Vec<UnspentTxOut>,
    mempool: Vec<PendingTransaction>,
}

pub struct TransactionStore {
    dir: PathBuf,
    index: HashMap<Hash256, TxLocation>,
    cache: HashMap<Hash256, Transaction>,
    utxo: Vec<UnspentTxOut>,
    mempool: Vec<PendingTransaction>,
    dirty: bool,
}

impl TransactionStore {
    fn path(&self) -> PathBuf {
        self.dir.join("txindex.json")
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("txindex.json");
        if !path.exists() {
            return Ok(Self {
                dir,
                index: HashMap::new(),
                cache: HashMap::new(),
                utxo: Vec::new(),
                mempool: Vec::new(),
                dirty: false,
            });
        }
        let raw = std::fs::read_to_string(&path)?;
        let doc: TxIndexDocument = serde_json::from_str(&raw)?;
        Ok(Self {
            dir,
            index: doc.tx_indices,
            cache: HashMap::new(),
            utxo: doc.utxo,
            mempool: doc.mempool,
            dirty: false,
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let doc = TxIndexDocument {
            tx_indices: self.index.clone(),
            utxo: self.utxo.clone(),
            mempool: self.mempool.clone(),
        };
        let raw = serde_json::to_string_pretty(&doc)?;
        std::fs::write(self.path(), raw)?;
        self.dirty = false;
        Ok(())
    }

    #[must_use]
    pub fn has_tx(&self, id: &Hash256) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn mempool_has(&self, id: &Hash256) -> bool {
        self.mempool.iter().any(|p| &p.tx.id == id)
    }

    /// Fetches a transaction body, reading through to `blocks` if not cached.
    pub fn get_tx(&mut self, id: &Hash256, blocks: &BlockStore) -> Option<Transaction> {
        if let Some(tx) = self.cache.get(id) {
            return Some(tx.clone());
        }
        let location = *self.index.get(id)?;
        let block = blocks.get_by_height(location.block)?;
        let tx = block.transactions.get(location.index)?.clone();
        self.cache.insert(*id, tx.clone());
        Some(tx)
    }

    fn output_for(&mut self, tx_id: &Hash256, out_index: u32, blocks: &BlockStore) -> Option<TxOut> {
        let tx = self.get_tx(tx_id, blocks)?;
        tx.outputs.get(out_index as usize).cloned()
    }

    /// Indexes `tx` at `(block_height, position)`, consumes its inputs from
    /// the UTXO list, appends its outputs, and drops any matching mempool
    /// entry.
    pub fn add_tx(&mut self, tx: &Transaction, block_height: Height, position: usize) -> Result<()> {
        if self.index.contains_key(&tx.id) {
            return Err(ChainError::InvalidTransaction(format!(
                "{} already indexed",
                tx.id
            )));
        }
        self.index.insert(
            tx.id,
            TxLocation {
                block: block_height,
                index: position,
            },
        );
        self.cache.insert(tx.id, tx.clone());

        for input in &tx.inputs {
            if let Ok(prev_id) = input.prev_tx.parse::<Hash256>() {
                self.utxo
                    .retain(|u| !u.matches(&prev_id, input.prev_index));
            }
        }
        for (i, out) in tx.outputs.iter().enumerate() {
            self.utxo
                .push(UnspentTxOut::new(tx.id, i as u32, out.address.clone()));
        }
        self.mempool.retain(|p| p.tx.id != tx.id);
        self.dirty = true;
        Ok(())
    }

    /// Reverts `add_tx`: de-indexes `tx`, restores consumed UTXOs, and
    /// removes the outputs it produced.
    pub fn remove_tx(&mut self, tx: &Transaction, blocks: &BlockStore) {
        self.index.remove(&tx.id);
        self.cache.remove(&tx.id);

        for input in &tx.inputs {
            if let Ok(prev_id) = input.prev_tx.parse::<Hash256>() {
                if let Some(out) = self.output_for(&prev_id, input.prev_index, blocks) {
                    self.utxo
                        .push(UnspentTxOut::new(prev_id, input.prev_index, out.address));
                }
            }
        }
        self.utxo.retain(|u| u.tx_id != tx.id);
        self.dirty = true;
    }

    pub fn add_pending(&mut self, pending: PendingTransaction) {
        self.mempool.push(pending);
        self.dirty = true;
    }

    #[must_use]
    pub fn get_pending(&self, id: &Hash256) -> Option<&PendingTransaction> {
        self.mempool.iter().find(|p| &p.tx.id == id)
    }

    /// Mempool entries sorted oldest-first, bounded to `limit`.
    #[must_use]
    pub fn get_pending_sorted(&self, limit: usize) -> Vec<PendingTransaction> {
        let mut sorted = self.mempool.clone();
        sorted.sort_by_key(|p| p.arrival_ms);
        sorted.truncate(limit);
        sorted
    }

    /// Builds the coinbase plus up to `MAX_TX_IN_BLOCK` mempool entries for
    /// a new block at `height`, and returns the assembled transaction list.
    pub fn collect_pending_for_block(
        &self,
        height: Height,
        miner_address: &str,
        base_reward: Amount,
    ) -> Vec<Transaction> {
        let selected = self.get_pending_sorted(MAX_TX_IN_BLOCK);
        let total_fee = FEE_PER_TX * selected.len() as Amount;

        let mut txs = Vec::with_capacity(selected.len() + 1);
        txs.push(Transaction::new_coinbase(
            height,
            base_reward + total_fee,
            miner_address.to_string(),
        ));
        txs.extend(selected.into_iter().map(|p| p.tx));
        txs
    }

    /// UTXOs and still-pending outputs for `addr`, consulting the mempool to
    /// exclude already-spent-in-mempool outputs and include pending credits.
    pub fn collect_utxos_for_address(
        &mut self,
        addr: &str,
        blocks: &BlockStore,
    ) -> Result<(Vec<UnspentTxOut>, Vec<TxOut>)> {
        let mut confirmed: Vec<UnspentTxOut> = self
            .utxo
            .iter()
            .filter(|u| u.address_hint == addr)
            .cloned()
            .collect();

        for u in &confirmed {
            let actual = self
                .output_for(&u.tx_id, u.out_index, blocks)
                .ok_or(ChainError::UtxoNotFound)?;
            if actual.address != addr {
                return Err(ChainError::InvalidTransaction(
                    "utxo address hint inconsistent with referenced output".to_string(),
                ));
            }
        }

        let mut pending_outputs = Vec::new();
        for pending in &self.mempool {
            confirmed.retain(|u| {
                !pending
                    .tx
                    .inputs
                    .iter()
                    .any(|input| input.prev_tx.parse::<Hash256>().is_ok_and(|id| u.matches(&id, input.prev_index)))
            });
            for out in &pending.tx.outputs {
                if out.address == addr {
                    pending_outputs.push(out.clone());
                }
            }
        }

        Ok((confirmed, pending_outputs))
    }

    /// Re-indexes every transaction of `block` at its position, used when a
    /// block is (re)accepted into the chain.
    pub fn index_block(&mut self, block: &Block) -> Result<()> {
        for (pos, tx) in block.transactions.iter().enumerate() {
            self.add_tx(tx, block.height, pos)?;
        }
        Ok(())
    }

    /// De-indexes every transaction of `block`, used when it is rolled back
    /// during fork replacement.
    pub fn deindex_block(&mut self, block: &Block, blocks: &BlockStore) {
        for tx in &block.transactions {
            self.remove_tx(tx, blocks);
        }
    }

    #[must_use]
    pub fn arrival_timestamp(now_ms: TimestampMs) -> TimestampMs {
        now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_pair() -> (TransactionStore, BlockStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tx_store = TransactionStore::load(dir.path()).unwrap();
        let block_store = BlockStore::load(dir.path()).unwrap();
        (tx_store, block_store)
    }

    #[test]
    fn add_tx_then_remove_tx_is_a_no_op_on_indexing() {
        let (mut store, blocks) = store_pair();
        let tx = Transaction::new_coinbase(1, 100, "addr".to_string());
        store.add_tx(&tx, 1, 0).unwrap();
        assert!(store.has_tx(&tx.id));
        assert_eq!(store.utxo.len(), 1);

        store.remove_tx(&tx, &blocks);
        assert!(!store.has_tx(&tx.id));
        assert!(store.utxo.is_empty());
    }

    #[test]
    fn mempool_disjoint_from_index_after_add_tx() {
        let (mut store, _blocks) = store_pair();
        let tx = Transaction::new_coinbase(1, 100, "addr".to_string());
        store.add_pending(PendingTransaction {
            arrival_ms: 0,
            tx: tx.clone(),
        });
        assert!(store.mempool_has(&tx.id));

        store.add_tx(&tx, 1, 0).unwrap();
        assert!(!store.mempool_has(&tx.id));
        assert!(store.has_tx(&tx.id));
    }

    #[test]
    fn collect_pending_for_block_prepends_coinbase() {
        let (store, _blocks) = store_pair();
        let txs = store.collect_pending_for_block(5, "miner", 1000);
        assert_eq!(txs.len(), 1);
        assert!(txs[0].is_coinbase());
    }
}
