use thiserror::Error;

/// Errors surfaced by the chain engine, stores, and the opaque crypto
/// primitives consumed by them.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("insufficient proof of work")]
    InsufficientDifficulty,

    #[error("nonce space exhausted")]
    NonceExhausted,

    #[error("utxo not found")]
    UtxoNotFound,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("too many inputs")]
    TooManyInputs,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("cryptographic error: {0}")]
    Cryptographic(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("lock acquisition timed out")]
    LockTimeout,
}

/// Alias used across every crate in the workspace.
pub type Result<T> = std::result::Result<T, ChainError>;

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Io(err.to_string())
    }
}
