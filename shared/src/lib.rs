pub mod crypto;
pub mod error;
pub mod hash;
pub mod types;

pub use error::{ChainError, Result};
pub use hash::{hex16_u64, hex8_u32, Hash256};
pub use types::{Address, Amount, Height, NodeConfig, TimestampMs};

pub use secp256k1::{PublicKey, SecretKey};
