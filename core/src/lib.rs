pub mod block;
pub mod chain;
pub mod events;
pub mod merkle;
pub mod mining;
pub mod params;
pub mod pow;
pub mod store;
pub mod transaction;
pub mod utxo;

pub use block::{genesis_block, Block};
pub use chain::{AddBlocksResult, AddPendingResult, BlockTemplate, ChainEngine, SendResult};
pub use events::{ChainEvent, EventSink};
pub use mining::{mine, MiningOutcome};
pub use store::{BlockStore, TransactionStore};
pub use transaction::{PendingTransaction, Transaction, TxIn, TxOut};
pub use utxo::UnspentTxOut;

pub use shared::{ChainError, Hash256, Result};
