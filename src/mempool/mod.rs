//! Pending transactions awaiting inclusion in a block

pub mod pool;

pub use pool::{PoolContext, PoolEntry, TxPool};
