//! Shared type aliases used across the store, chain engine, and network crates.

use serde::{Deserialize, Serialize};

/// An amount in the smallest unit (1/10^8 of a coin). Signed so intermediate
/// fee/change arithmetic can be checked against going negative.
pub type Amount = i64;

/// Milliseconds since the Unix epoch. Plain integer, not a calendar type —
/// every timing invariant in the chain engine is integer millisecond
/// arithmetic.
pub type TimestampMs = i64;

/// Block height; dense from 0 (genesis) upward.
pub type Height = u64;

/// Recipient/sender address, Base58Check-encoded.
pub type Address = String;

/// Node-wide configuration shared by the listener and the data stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen_port: u16,
    pub bind_address: String,
    pub data_dir: String,
    pub connect: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 8333,
            bind_address: "0.0.0.0".to_string(),
            data_dir: "./data".to_string(),
            connect: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_defaults() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.listen_port, 8333);
        assert!(cfg.connect.is_empty());
    }
}
