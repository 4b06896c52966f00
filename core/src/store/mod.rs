pub mod block_store;
pub mod tx_store;

pub use block_store::BlockStore;
pub use tx_store::TransactionStore;
