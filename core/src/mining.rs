//! Proof-of-work search: bounded-batch nonce iteration on a background task,
//! rewriting only the nonce bytes of an already-assembled header.

use shared::{Hash256, Height, TimestampMs};
use tokio_util::sync::CancellationToken;

use crate::params::{MAX_NONCE, MINING_BATCH_SIZE};
use crate::pow;

/// Outcome of a full mining run against one header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    Found { nonce: u32, hash: Hash256 },
    /// Nonce space exhausted at `2^31 - 1` without finding a qualifying hash.
    Exhausted,
    /// Cancelled before a qualifying nonce was found.
    Cancelled,
}

/// Searches nonces `[start, start + MINING_BATCH_SIZE)` for one whose header
/// hash meets `difficulty`. Pure and synchronous — the caller is expected to
/// run it on a blocking thread.
#[must_use]
pub fn search_batch(
    height: Height,
    timestamp: TimestampMs,
    merkle: &Hash256,
    prev: &Hash256,
    start_nonce: u32,
    difficulty: u32,
) -> Option<(u32, Hash256)> {
    let end = start_nonce.saturating_add(MINING_BATCH_SIZE).min(MAX_NONCE);
    let mut nonce = start_nonce;
    loop {
        let hash = pow::block_hash(height, timestamp, merkle, prev, nonce);
        if hash.meets_difficulty(difficulty) {
            return Some((nonce, hash));
        }
        if nonce >= end {
            return None;
        }
        nonce += 1;
    }
}

/// Runs the full nonce search across batches on the blocking thread pool,
/// yielding between batches so cancellation and other async work can run.
pub async fn mine(
    height: Height,
    timestamp: TimestampMs,
    merkle: Hash256,
    prev: Hash256,
    difficulty: u32,
    cancel: &CancellationToken,
) -> MiningOutcome {
    let mut nonce = 0u32;
    loop {
        if cancel.is_cancelled() {
            return MiningOutcome::Cancelled;
        }

        let batch_start = nonce;
        let found = tokio::task::spawn_blocking(move || {
            search_batch(height, timestamp, &merkle, &prev, batch_start, difficulty)
        })
        .await
        .unwrap_or(None);

        if let Some((winning_nonce, hash)) = found {
            return MiningOutcome::Found {
                nonce: winning_nonce,
                hash,
            };
        }

        if batch_start >= MAX_NONCE {
            return MiningOutcome::Exhausted;
        }
        nonce = batch_start.saturating_add(MINING_BATCH_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Difficulty 0 means the very first nonce qualifies and the search
    /// terminates immediately.
    #[test]
    fn search_batch_finds_nonce_at_zero_difficulty() {
        let merkle = Hash256::sha256(b"m");
        let prev = Hash256::sha256(b"p");
        let (nonce, hash) = search_batch(1, 1000, &merkle, &prev, 0, 0).unwrap();
        assert_eq!(nonce, 0);
        assert_eq!(pow::block_hash(1, 1000, &merkle, &prev, 0), hash);
    }

    #[test]
    fn search_batch_returns_none_when_difficulty_unreachable_in_range() {
        let merkle = Hash256::sha256(b"m2");
        let prev = Hash256::sha256(b"p2");
        // 36 leading zero bits is implausible to hit within one batch of
        // 100,000 consecutive nonces from a fixed start.
        assert!(search_batch(1, 1000, &merkle, &prev, 0, 36).is_none());
    }
}
