//! Block/transaction validation, fork resolution, mempool admission, and
//! send-transaction construction: the engine every other component calls
//! under the chain lock.

use std::collections::{HashMap, HashSet};

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use shared::{crypto, Address, Amount, ChainError, Hash256, Height, Result, TimestampMs};

use crate::block::Block;
use crate::events::{ChainEvent, EventSink};
use crate::merkle::merkle_root;
use crate::params::{
    base_reward, difficulty, min_distance_ms, CONFLICT_RESOLUTION_STEPS, FEE_PER_TX,
    MAX_FUTURE_DRIFT_MS, MAX_TX_INPUTS,
};
use crate::pow;
use crate::store::{BlockStore, TransactionStore};
use crate::transaction::{PendingTransaction, Transaction, TxOut};

/// Outcome of `add_blocks_from_peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddBlocksResult {
    Empty,
    NeedMore { from_height: Height },
    NeedMoreShouldStore { from_height: Height },
    NothingChanged,
    AddedSingleBlock,
    AddedMultipleBlocks,
    RejectedInvalidSingleBlock,
    RejectedInvalidMultipleBlocks,
    RejectedShorterChain,
    ReplacedMultipleBlocks,
}

/// Outcome of `add_pending`. `SoftRejected` is defined by the source
/// protocol but never actually produced — see `DESIGN.md`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddPendingResult {
    Empty,
    Added,
    HardRejected,
    SoftRejected,
}

/// Outcome of `send`. The spec names the success case `None` (no error);
/// it is modeled here as `Sent` carrying the constructed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Sent(Transaction),
    InvalidKey,
    Insufficient,
    TooManyInputs,
}

pub struct ChainEngine {
    blocks: BlockStore,
    txs: TransactionStore,
    events: EventSink,
    events_rx: Option<tokio::sync::mpsc::Receiver<ChainEvent>>,
}

impl ChainEngine {
    pub fn load(data_dir: impl AsRef<std::path::Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        let blocks = BlockStore::load(dir.join("blocks"))?;
        let txs = TransactionStore::load(dir.join("txs"))?;
        let (events, rx) = EventSink::channel();
        Ok(Self {
            blocks,
            txs,
            events,
            events_rx: Some(rx),
        })
    }

    #[must_use]
    pub fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    /// Hands the receiving half of the event channel to the caller. Only
    /// the first call after `load` returns `Some`.
    pub fn take_event_receiver(&mut self) -> Option<tokio::sync::mpsc::Receiver<ChainEvent>> {
        self.events_rx.take()
    }

    #[must_use]
    pub fn height(&self) -> Height {
        self.blocks.height()
    }

    #[must_use]
    pub fn latest(&self) -> Block {
        self.blocks
            .latest()
            .expect("block store always holds at least genesis")
    }

    #[must_use]
    pub fn get_by_height(&self, height: Height) -> Option<Block> {
        self.blocks.get_by_height(height)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.blocks.flush()?;
        self.txs.flush()?;
        Ok(())
    }

    /// Most-recently-arrived mempool entries, capped at `limit`, for a
    /// `GetMempool` reply.
    #[must_use]
    pub fn pending_for_relay(&self, limit: usize) -> Vec<PendingTransaction> {
        self.txs.get_pending_sorted(limit)
    }

    /// SUPPLEMENT: sums an address's confirmed UTXOs plus pending credits,
    /// for a balance query consumers can poll without reaching into the
    /// store internals directly.
    pub fn collect_balance(&mut self, addr: &str) -> Result<Amount> {
        let (utxos, pending_outputs) = self.txs.collect_utxos_for_address(addr, &self.blocks)?;
        let mut total: Amount = 0;
        for u in &utxos {
            if let Some(tx) = self.txs.get_tx(&u.tx_id, &self.blocks) {
                if let Some(out) = tx.outputs.get(u.out_index as usize) {
                    total += out.amount;
                }
            }
        }
        total += pending_outputs.iter().map(|o| o.amount).sum::<Amount>();
        Ok(total)
    }

    // ---- validation -----------------------------------------------------

    /// Validates `b` against claimed previous block `p`, consulting
    /// `received` for transactions that arrived earlier in the same batch
    /// and `spent_in_batch` for inputs already consumed by this batch.
    fn validate_block(
        &mut self,
        b: &Block,
        p: &Block,
        now_ms: TimestampMs,
        received: &mut HashMap<Hash256, Transaction>,
        spent_in_batch: &mut HashSet<(Hash256, u32)>,
    ) -> Result<()> {
        if b.height != p.height + 1 {
            return Err(ChainError::InvalidBlock("height does not extend previous".into()));
        }
        if b.timestamp > now_ms + MAX_FUTURE_DRIFT_MS {
            return Err(ChainError::InvalidBlock("timestamp too far in the future".into()));
        }
        if b.timestamp - p.timestamp < min_distance_ms(b.height) {
            return Err(ChainError::InvalidBlock("timestamp too close to previous".into()));
        }

        if b.transactions.is_empty() {
            return Err(ChainError::InvalidBlock("block has no coinbase".into()));
        }
        let coinbase = &b.transactions[0];
        if !coinbase.is_coinbase() {
            return Err(ChainError::InvalidBlock("first transaction is not a coinbase".into()));
        }
        let expected_prev = shared::hex8_u32(b.height as u32);
        if coinbase.inputs[0].prev_tx != expected_prev {
            return Err(ChainError::InvalidBlock("coinbase does not reference own height".into()));
        }
        let expected_reward = base_reward(b.height) + FEE_PER_TX * (b.transactions.len() as Amount - 1);
        if coinbase.outputs.len() != 1 || coinbase.outputs[0].amount != expected_reward {
            return Err(ChainError::InvalidBlock("coinbase reward mismatch".into()));
        }

        for tx in b.transactions.iter().skip(1) {
            self.validate_non_coinbase_tx(tx, received, spent_in_batch)?;
        }

        let ids: Vec<Hash256> = b.transactions.iter().map(|t| t.id).collect();
        if merkle_root(&ids) != b.merkle {
            return Err(ChainError::InvalidBlock("merkle root mismatch".into()));
        }

        if b.prev != p.hash {
            return Err(ChainError::InvalidBlock("previous hash mismatch".into()));
        }

        let recomputed = pow::block_hash(b.height, b.timestamp, &b.merkle, &b.prev, b.nonce);
        if recomputed != b.hash || !recomputed.meets_difficulty(difficulty(b.height)) {
            return Err(ChainError::InsufficientDifficulty);
        }

        for tx in &b.transactions {
            received.insert(tx.id, tx.clone());
        }
        Ok(())
    }

    fn validate_non_coinbase_tx(
        &mut self,
        tx: &Transaction,
        received: &mut HashMap<Hash256, Transaction>,
        spent_in_batch: &mut HashSet<(Hash256, u32)>,
    ) -> Result<()> {
        if !tx.id_is_consistent() {
            return Err(ChainError::InvalidTransaction("id does not match recomputation".into()));
        }
        if self.txs.has_tx(&tx.id) || received.contains_key(&tx.id) {
            return Err(ChainError::InvalidTransaction("duplicate transaction".into()));
        }

        let mut input_total: Amount = 0;
        for input in &tx.inputs {
            let prev_id: Hash256 = input
                .prev_tx
                .parse()
                .map_err(|_| ChainError::InvalidTransaction("malformed previous tx id".into()))?;
            let key = (prev_id, input.prev_index);
            if spent_in_batch.contains(&key) {
                return Err(ChainError::InvalidTransaction("double spend within batch".into()));
            }

            let referenced = if let Some(prior) = received.get(&prev_id) {
                prior.outputs.get(input.prev_index as usize).cloned()
            } else {
                self.txs
                    .get_tx(&prev_id, &self.blocks)
                    .and_then(|t| t.outputs.get(input.prev_index as usize).cloned())
            };
            let referenced: TxOut =
                referenced.ok_or(ChainError::InvalidTransaction("referenced output not found".into()))?;

            let (sig, pubkey) = crypto::decode_signature_string(&input.signature)?;
            let derived = crypto::address_from_public_key(&pubkey);
            if derived != referenced.address {
                return Err(ChainError::InvalidAddress("pubkey does not match output address".into()));
            }
            if !crypto::verify(&tx.id, &sig, &pubkey) {
                return Err(ChainError::InvalidSignature);
            }

            spent_in_batch.insert(key);
            input_total += referenced.amount;
        }

        for out in &tx.outputs {
            if out.address.is_empty() || out.amount <= 0 {
                return Err(ChainError::InvalidTransaction("empty address or non-positive amount".into()));
            }
        }

        let output_total: Amount = tx.outputs.iter().map(|o| o.amount).sum();
        if input_total != output_total + FEE_PER_TX {
            return Err(ChainError::InvalidTransaction("inputs do not balance outputs plus fee".into()));
        }

        Ok(())
    }

    // ---- addBlocksFromPeer ------------------------------------------------

    pub fn add_blocks_from_peer(&mut self, blocks: Vec<Block>, peer_height: Height, now_ms: TimestampMs) -> Result<AddBlocksResult> {
        if blocks.is_empty() {
            return Ok(AddBlocksResult::Empty);
        }
        let l = self.height();

        if blocks[0].height > l + 1 {
            return Ok(AddBlocksResult::NeedMore { from_height: l + 1 });
        }

        if blocks.len() == 1 {
            return self.add_single_block(&blocks[0], l, now_ms);
        }

        for w in blocks.windows(2) {
            if w[1].height != w[0].height + 1 {
                return Ok(AddBlocksResult::RejectedInvalidMultipleBlocks);
            }
        }

        let latest = self.latest();
        if blocks[0].height == l + 1 && blocks[0].prev == latest.hash {
            return self.validate_and_append(&blocks, latest, now_ms);
        }

        let last = blocks.last().expect("non-empty checked above");
        if last.height <= l {
            return Ok(if peer_height > l {
                AddBlocksResult::NeedMoreShouldStore {
                    from_height: last.height + 1,
                }
            } else {
                AddBlocksResult::RejectedShorterChain
            });
        }

        self.add_overlapping_batch(&blocks, l, now_ms)
    }

    fn add_single_block(&mut self, b: &Block, l: Height, now_ms: TimestampMs) -> Result<AddBlocksResult> {
        let latest = self.latest();
        if b.height == l && b == &latest {
            return Ok(AddBlocksResult::NothingChanged);
        }
        if b.height == l + 1 {
            if b.prev != latest.hash {
                return Ok(AddBlocksResult::NeedMoreShouldStore {
                    from_height: l.saturating_sub(CONFLICT_RESOLUTION_STEPS),
                });
            }
            let mut received = HashMap::new();
            let mut spent = HashSet::new();
            return match self.validate_block(b, &latest, now_ms, &mut received, &mut spent) {
                Ok(()) => {
                    self.commit_new_block(b.clone())?;
                    Ok(AddBlocksResult::AddedSingleBlock)
                }
                Err(_) => Ok(AddBlocksResult::RejectedInvalidSingleBlock),
            };
        }
        Ok(AddBlocksResult::RejectedInvalidSingleBlock)
    }

    fn validate_and_append(&mut self, blocks: &[Block], latest: Block, now_ms: TimestampMs) -> Result<AddBlocksResult> {
        let mut rolling_prev = latest;
        let mut received = HashMap::new();
        let mut spent = HashSet::new();
        for b in blocks {
            if self
                .validate_block(b, &rolling_prev, now_ms, &mut received, &mut spent)
                .is_err()
            {
                return Ok(AddBlocksResult::RejectedInvalidMultipleBlocks);
            }
            rolling_prev = b.clone();
        }
        for b in blocks {
            self.commit_new_block(b.clone())?;
        }
        Ok(AddBlocksResult::AddedMultipleBlocks)
    }

    fn add_overlapping_batch(&mut self, blocks: &[Block], l: Height, now_ms: TimestampMs) -> Result<AddBlocksResult> {
        let genesis = crate::block::genesis_block();
        let latest = self.latest();

        let mut divergence: Option<usize> = None;
        for (i, b) in blocks.iter().enumerate() {
            if b.height > l {
                if b.prev != latest.hash {
                    return Ok(AddBlocksResult::NeedMoreShouldStore {
                        from_height: l.saturating_sub(CONFLICT_RESOLUTION_STEPS),
                    });
                }
                divergence = Some(i);
                break;
            }

            let local = self.get_by_height(b.height);
            match local {
                Some(ref local_block) if local_block == b => continue,
                _ => {
                    if b.height == 0 {
                        if b == &genesis {
                            divergence = Some(1);
                            continue;
                        }
                        return Ok(AddBlocksResult::RejectedInvalidMultipleBlocks);
                    }
                    return Ok(AddBlocksResult::NeedMoreShouldStore {
                        from_height: b.height.saturating_sub(CONFLICT_RESOLUTION_STEPS),
                    });
                }
            }
        }

        let start_idx = match divergence {
            Some(i) => i,
            None => return Ok(AddBlocksResult::NothingChanged),
        };

        let rolling_prev = if start_idx == 0 {
            genesis
        } else {
            blocks[start_idx - 1].clone()
        };

        let mut prev = rolling_prev;
        let mut received = HashMap::new();
        let mut spent = HashSet::new();
        for b in &blocks[start_idx..] {
            if self
                .validate_block(b, &prev, now_ms, &mut received, &mut spent)
                .is_err()
            {
                return Ok(AddBlocksResult::RejectedInvalidMultipleBlocks);
            }
            prev = b.clone();
        }

        self.replace_blocks(start_idx, blocks)?;
        Ok(AddBlocksResult::ReplacedMultipleBlocks)
    }

    fn commit_new_block(&mut self, b: Block) -> Result<()> {
        self.blocks.add_block(b.clone())?;
        self.txs.index_block(&b)?;
        self.events.publish(ChainEvent::LatestBlock(b));
        Ok(())
    }

    fn replace_blocks(&mut self, start_pos: usize, received: &[Block]) -> Result<()> {
        let mut removed = Vec::new();
        self.blocks.replace_blocks_from(start_pos, received, &mut removed)?;
        for old in &removed {
            self.txs.deindex_block(old, &self.blocks);
        }
        for b in &received[start_pos..] {
            self.txs.index_block(b)?;
        }
        self.events
            .publish(ChainEvent::LatestBlock(self.latest()));
        Ok(())
    }

    // ---- addPending --------------------------------------------------

    pub fn add_pending(&mut self, incoming: Vec<Transaction>, now_ms: TimestampMs) -> AddPendingResult {
        if incoming.is_empty() {
            return AddPendingResult::Empty;
        }

        let mut ignored = HashSet::new();
        for tx in &incoming {
            if !tx.id_is_consistent() {
                return AddPendingResult::HardRejected;
            }
            if self.txs.has_tx(&tx.id) || self.txs.mempool_has(&tx.id) {
                continue;
            }

            let mut unknown_parent = false;
            let mut input_total: Amount = 0;
            for input in &tx.inputs {
                let Ok(prev_id) = input.prev_tx.parse::<Hash256>() else {
                    return AddPendingResult::HardRejected;
                };
                let Some(referenced_tx) = self.txs.get_tx(&prev_id, &self.blocks) else {
                    unknown_parent = true;
                    break;
                };
                let Some(referenced) = referenced_tx.outputs.get(input.prev_index as usize).cloned() else {
                    return AddPendingResult::HardRejected;
                };

                let Ok((sig, pubkey)) = crypto::decode_signature_string(&input.signature) else {
                    return AddPendingResult::HardRejected;
                };
                if crypto::address_from_public_key(&pubkey) != referenced.address {
                    return AddPendingResult::HardRejected;
                }
                if !crypto::verify(&tx.id, &sig, &pubkey) {
                    return AddPendingResult::HardRejected;
                }
                input_total += referenced.amount;
            }

            if unknown_parent {
                ignored.insert(tx.id);
                continue;
            }

            for out in &tx.outputs {
                if out.address.is_empty() || out.amount <= 0 {
                    return AddPendingResult::HardRejected;
                }
            }
            let output_total: Amount = tx.outputs.iter().map(|o| o.amount).sum();
            if input_total != output_total + FEE_PER_TX {
                return AddPendingResult::HardRejected;
            }
        }

        let mut accepted = Vec::new();
        for tx in incoming {
            if ignored.contains(&tx.id) || self.txs.has_tx(&tx.id) || self.txs.mempool_has(&tx.id) {
                continue;
            }
            let pending = PendingTransaction {
                arrival_ms: now_ms,
                tx,
            };
            accepted.push(pending.clone());
            self.txs.add_pending(pending);
        }
        let _ = self.txs.flush();
        if !accepted.is_empty() {
            self.events.publish(ChainEvent::Mempool(accepted));
        }
        AddPendingResult::Added
    }

    // ---- send -----------------------------------------------------------

    pub fn send(
        &mut self,
        from: &Address,
        to: &Address,
        amount: Amount,
        priv_key: &SecretKey,
        now_ms: TimestampMs,
    ) -> Result<SendResult> {
        let secp = Secp256k1::new();
        let derived_pubkey = PublicKey::from_secret_key(&secp, priv_key);
        if &crypto::address_from_public_key(&derived_pubkey) != from {
            return Ok(SendResult::InvalidKey);
        }

        let (utxos, _pending_outputs) = self.txs.collect_utxos_for_address(from, &self.blocks)?;

        let mut inputs = Vec::new();
        let mut accumulated: Amount = 0;
        let needed = amount + FEE_PER_TX;

        for u in &utxos {
            if accumulated >= needed {
                break;
            }
            let Some(referenced_tx) = self.txs.get_tx(&u.tx_id, &self.blocks) else {
                continue;
            };
            let Some(out) = referenced_tx.outputs.get(u.out_index as usize) else {
                continue;
            };
            accumulated += out.amount;
            inputs.push(crate::transaction::TxIn {
                prev_tx: u.tx_id.to_hex(),
                prev_index: u.out_index,
                signature: String::new(),
            });
        }

        if inputs.len() > MAX_TX_INPUTS {
            return Ok(SendResult::TooManyInputs);
        }
        if accumulated < needed {
            return Ok(SendResult::Insufficient);
        }

        let mut outputs = Vec::new();
        let change = accumulated - needed;
        if change > 0 {
            outputs.push(TxOut {
                amount: change,
                address: from.clone(),
            });
        }
        outputs.push(TxOut {
            amount,
            address: to.clone(),
        });

        let id = Transaction::compute_id(&inputs, &outputs);
        let sig = crypto::sign(&id, priv_key)?;
        let sig_string = crypto::encode_signature_string(&sig, &derived_pubkey);
        for input in &mut inputs {
            input.signature = sig_string.clone();
        }

        let tx = Transaction {
            id,
            inputs,
            outputs,
        };
        self.txs.add_pending(PendingTransaction {
            arrival_ms: now_ms,
            tx: tx.clone(),
        });
        let _ = self.txs.flush();
        self.events
            .publish(ChainEvent::Mempool(vec![PendingTransaction {
                arrival_ms: now_ms,
                tx: tx.clone(),
            }]));

        Ok(SendResult::Sent(tx))
    }

    // ---- mining -----------------------------------------------------------

    /// Assembles the next block's coinbase-plus-mempool transaction list and
    /// header fields, ready for `mining::mine`. Read-only: does not touch
    /// the stores, so the chain lock only needs to be held long enough to
    /// build this, not for the whole nonce search.
    #[must_use]
    pub fn block_template(&self, miner_address: &str, now_ms: TimestampMs) -> BlockTemplate {
        let latest = self.latest();
        let height = latest.height + 1;
        let transactions = self
            .txs
            .collect_pending_for_block(height, miner_address, base_reward(height));
        let ids: Vec<Hash256> = transactions.iter().map(|t| t.id).collect();
        BlockTemplate {
            height,
            timestamp: now_ms,
            merkle: merkle_root(&ids),
            transactions,
            prev: latest.hash,
            difficulty: difficulty(height),
        }
    }

    /// Commits a block mined from `template`, provided the chain has not
    /// advanced past `template`'s parent while the nonce search ran.
    /// Returns `false` without committing if it has, so the caller can
    /// rebuild a fresh template and retry.
    pub fn commit_mined_block(&mut self, template: &BlockTemplate, nonce: u32, hash: Hash256) -> Result<bool> {
        if self.latest().hash != template.prev {
            return Ok(false);
        }
        let block = Block {
            height: template.height,
            timestamp: template.timestamp,
            transactions: template.transactions.clone(),
            merkle: template.merkle,
            prev: template.prev,
            hash,
            nonce,
        };
        self.commit_new_block(block)?;
        Ok(true)
    }
}

/// A block assembled from the current mempool, ready to be mined. Carries
/// its parent hash so the caller can detect a chain that advanced while
/// the nonce search was running.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub height: Height,
    pub timestamp: TimestampMs,
    pub transactions: Vec<Transaction>,
    pub merkle: Hash256,
    pub prev: Hash256,
    pub difficulty: u32,
}
