//! Persistent storage for blocks, the UTXO set and the best-block pointer

pub mod database;

pub use database::Database;
