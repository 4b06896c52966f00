//! Bucketed on-disk block storage: 100 blocks per bucket file, plus a flat
//! `(height, hash)` index used to verify chain continuity on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shared::{ChainError, Hash256, Height, Result};

use crate::block::{genesis_block, Block};
use crate::params::difficulty;

const BUCKET_SIZE: u64 = 100;

fn bucket_of(height: Height) -> u64 {
    height / BUCKET_SIZE
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    #[serde(rename = "i")]
    height: Height,
    #[serde(rename = "h")]
    hash: Hash256,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    block_indices: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BucketDocument {
    start_index: Height,
    end_index: Height,
    blocks: Vec<Block>,
}

/// Persisted, bucketed chain of blocks plus an in-memory height/hash index.
pub struct BlockStore {
    dir: PathBuf,
    index: Vec<Hash256>,
    buckets: BTreeMap<u64, BucketDocument>,
    dirty_buckets: std::collections::BTreeSet<u64>,
}

impl BlockStore {
    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn bucket_path(&self, bucket: u64) -> PathBuf {
        self.dir.join(format!("blk{bucket:05}.json"))
    }

    /// Loads the store from `dir`, initializing it with the genesis block
    /// if no index document exists yet.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let index_path = dir.join("index.json");
        if !index_path.exists() {
            let mut store = Self {
                dir,
                index: Vec::new(),
                buckets: BTreeMap::new(),
                dirty_buckets: std::collections::BTreeSet::new(),
            };
            store.add_block(genesis_block())?;
            store.flush()?;
            return Ok(store);
        }

        let raw = std::fs::read_to_string(&index_path)?;
        let doc: IndexDocument = serde_json::from_str(&raw)?;

        let mut index = Vec::with_capacity(doc.block_indices.len());
        for (pos, entry) in doc.block_indices.into_iter().enumerate() {
            if entry.height != pos as Height {
                return Err(ChainError::Persistence(format!(
                    "index entry at position {pos} has height {}",
                    entry.height
                )));
            }
            if pos > 0 && !entry.hash.meets_difficulty(difficulty(entry.height)) {
                return Err(ChainError::Persistence(format!(
                    "block {pos} hash does not meet required difficulty"
                )));
            }
            index.push(entry.hash);
        }

        let mut store = Self {
            dir,
            index,
            buckets: BTreeMap::new(),
            dirty_buckets: std::collections::BTreeSet::new(),
        };

        let bucket_count = bucket_of(store.index.len().saturating_sub(1) as Height) + 1;
        for b in 0..bucket_count {
            store.load_bucket(b)?;
        }

        Ok(store)
    }

    fn load_bucket(&mut self, bucket: u64) -> Result<()> {
        if self.buckets.contains_key(&bucket) {
            return Ok(());
        }
        let path = self.bucket_path(bucket);
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)?;
        let doc: BucketDocument = serde_json::from_str(&raw)?;
        self.buckets.insert(bucket, doc);
        Ok(())
    }

    #[must_use]
    pub fn height(&self) -> Height {
        self.index.len().saturating_sub(1) as Height
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn latest(&self) -> Option<Block> {
        self.get_by_height(self.height())
    }

    #[must_use]
    pub fn get_by_height(&self, height: Height) -> Option<Block> {
        let bucket = self.buckets.get(&bucket_of(height))?;
        let offset = (height - bucket.start_index) as usize;
        bucket.blocks.get(offset).cloned()
    }

    #[must_use]
    pub fn get_by_hash(&self, hash: &Hash256) -> Option<Block> {
        self.index
            .iter()
            .position(|h| h == hash)
            .and_then(|pos| self.get_by_height(pos as Height))
    }

    /// Appends `b` as the new tip. Requires `b.height == latest.height + 1`.
    pub fn add_block(&mut self, b: Block) -> Result<()> {
        let expected = self.index.len() as Height;
        if b.height != expected {
            return Err(ChainError::InvalidBlock(format!(
                "expected height {expected}, got {}",
                b.height
            )));
        }

        let bucket_id = bucket_of(b.height);
        let bucket = self.buckets.entry(bucket_id).or_insert_with(|| BucketDocument {
            start_index: bucket_id * BUCKET_SIZE,
            end_index: bucket_id * BUCKET_SIZE,
            blocks: Vec::new(),
        });
        bucket.blocks.push(b.clone());
        bucket.end_index = b.height;

        self.index.push(b.hash);
        self.dirty_buckets.insert(bucket_id);
        Ok(())
    }

    /// Replaces blocks starting at `start_pos` with `received[start_pos..]`,
    /// capturing the superseded blocks into `removed`.
    pub fn replace_blocks_from(
        &mut self,
        start_pos: usize,
        received: &[Block],
        removed: &mut Vec<Block>,
    ) -> Result<()> {
        for block in &received[start_pos..] {
            let height = block.height;
            let current_len = self.index.len() as Height;

            if height < current_len {
                if let Some(existing) = self.get_by_height(height) {
                    removed.push(existing);
                }
                let bucket_id = bucket_of(height);
                let bucket = self.buckets.get_mut(&bucket_id).ok_or_else(|| {
                    ChainError::Persistence(format!("missing bucket for height {height}"))
                })?;
                let offset = (height - bucket.start_index) as usize;
                if offset >= bucket.blocks.len() {
                    return Err(ChainError::Persistence(format!(
                        "cannot replace non-existent slot at height {height}"
                    )));
                }
                bucket.blocks[offset] = block.clone();
                self.index[height as usize] = block.hash;
                self.dirty_buckets.insert(bucket_id);
            } else if height == current_len {
                self.add_block(block.clone())?;
            } else {
                return Err(ChainError::Persistence(format!(
                    "replace_blocks_from received out-of-order height {height}"
                )));
            }
        }
        Ok(())
    }

    /// Flushes every dirty bucket and the index document to disk.
    pub fn flush(&mut self) -> Result<()> {
        for bucket_id in std::mem::take(&mut self.dirty_buckets) {
            if let Some(doc) = self.buckets.get(&bucket_id) {
                let raw = serde_json::to_string_pretty(doc)?;
                std::fs::write(self.bucket_path(bucket_id), raw)?;
            }
        }

        let doc = IndexDocument {
            block_indices: self
                .index
                .iter()
                .enumerate()
                .map(|(i, h)| IndexEntry {
                    height: i as Height,
                    hash: *h,
                })
                .collect(),
        };
        let raw = serde_json::to_string_pretty(&doc)?;
        std::fs::write(self.index_path(), raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn next_block(prev: &Block) -> Block {
        let height = prev.height + 1;
        let merkle = Hash256::sha256(b"merkle");
        let tx = Transaction::new_coinbase(height, 100, "miner".to_string());
        let hash = crate::pow::block_hash(height, prev.timestamp + 60_000, &merkle, &prev.hash, 0);
        Block {
            height,
            timestamp: prev.timestamp + 60_000,
            transactions: vec![tx],
            merkle,
            prev: prev.hash,
            hash,
            nonce: 0,
        }
    }

    #[test]
    fn load_on_empty_dir_initializes_genesis() {
        let dir = tempdir();
        let store = BlockStore::load(dir.path()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.height(), 0);
    }

    #[test]
    fn add_block_requires_contiguous_height() {
        let dir = tempdir();
        let mut store = BlockStore::load(dir.path()).unwrap();
        let genesis = store.latest().unwrap();
        let b1 = next_block(&genesis);
        store.add_block(b1.clone()).unwrap();
        assert_eq!(store.height(), 1);

        let mut bad = next_block(&b1);
        bad.height = 5;
        assert!(store.add_block(bad).is_err());
    }

    #[test]
    fn flush_and_reload_round_trips() {
        let dir = tempdir();
        let mut store = BlockStore::load(dir.path()).unwrap();
        let genesis = store.latest().unwrap();
        let b1 = next_block(&genesis);
        store.add_block(b1.clone()).unwrap();
        store.flush().unwrap();

        let reloaded = BlockStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.height(), 1);
        assert_eq!(reloaded.get_by_height(1).unwrap().hash, b1.hash);
    }

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().expect("create temp dir")
    }
}
