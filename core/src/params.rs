//! Pure functions of chain height: difficulty, minimum block spacing, block
//! reward, and the fixed protocol constants.

use shared::{Amount, Height, TimestampMs};

/// Fee charged per non-coinbase transaction: 0.5 coin.
pub const FEE_PER_TX: Amount = 50_000_000;

/// Maximum inputs a `send`-constructed transaction may use.
pub const MAX_TX_INPUTS: usize = 32;

/// Maximum non-coinbase transactions per block.
pub const MAX_TX_IN_BLOCK: usize = 32;

/// Maximum blocks a single `GetBlocks` request may return.
pub const MAX_GET_BLOCKS: u32 = 32;

/// Maximum mempool transactions returned to a `GetMempool` request.
pub const MAX_PENDING_TO_SEND: usize = 32;

/// Number of blocks `addBlocksFromPeer` walks back at a time while hunting
/// for a fork's divergence point.
pub const CONFLICT_RESOLUTION_STEPS: u64 = 4;

/// Nonce search batch size per mining attempt.
pub const MINING_BATCH_SIZE: u32 = 100_000;

/// Mining gives up once the nonce counter reaches this value (2^31 - 1).
pub const MAX_NONCE: u32 = i32::MAX as u32;

/// Maximum allowed clock skew for a block's timestamp: 30 hours, in ms.
pub const MAX_FUTURE_DRIFT_MS: TimestampMs = 30 * 60 * 60 * 1000;

/// Minimum required leading zero bits in a block hash at `height`.
#[must_use]
pub fn difficulty(height: Height) -> u32 {
    match height {
        0 => 0,
        1..=49 => 20,
        50..=99 => 24,
        100..=999 => 28,
        1000..=9999 => 32,
        _ => 36,
    }
}

/// Minimum timestamp delta (ms) between a block and its predecessor.
#[must_use]
pub fn min_distance_ms(height: Height) -> TimestampMs {
    if height <= 100 {
        return 30_000;
    }
    let decayed = 600_000i64.saturating_sub(60_000 * (height / 10_000) as i64);
    decayed.max(60_000)
}

/// Block subsidy at `height`, halving every 10,000 blocks.
#[must_use]
pub fn base_reward(height: Height) -> Amount {
    let halvings = height / 10_000;
    if halvings >= 63 {
        return 0;
    }
    (64 * 100_000_000i64) >> halvings
}
