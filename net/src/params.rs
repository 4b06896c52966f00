//! Network-layer timing constants: lock discipline and peer liveness sweeps.

use std::time::Duration;

/// Longest a task waits for the aggregate chain lock before giving up on
/// the current request rather than risk stalling the whole node.
pub const CHAIN_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Re-exported so dispatcher code can build `GetBlocks` requests without an
/// extra import path back into the chain engine crate.
pub use emberchain_core::params::MAX_GET_BLOCKS;

/// Re-exported so dispatcher code can cap `GetMempool` responses without an
/// extra import path back into the chain engine crate.
pub use emberchain_core::params::MAX_PENDING_TO_SEND;

/// House-keeping sweep cadence, once warmed up.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before the first house-keeping sweep after node start.
pub const HOUSEKEEPING_WARMUP: Duration = Duration::from_secs(10);

/// A peer silent on the outbound side for longer than this is disconnected.
pub const OUTBOUND_SILENCE_TIMEOUT: Duration = Duration::from_secs(600);

/// How often an idle peer is sent a `Ping`.
pub const PING_INTERVAL: Duration = Duration::from_secs(120);
