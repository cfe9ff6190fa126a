//! Core ledger components

pub mod block;
pub mod chain;
pub mod genesis;
pub mod transaction;
pub mod utxo;

pub use block::{Block, BlockHeader};
pub use chain::{Chain, ChainState};
pub use transaction::{Transaction, TxInput, TxOutput};
pub use utxo::{UtxoEntry, UtxoSet, UtxoViewpoint};
