//! QTC ledger - the transactional core of a UTXO blockchain node
//!
//! This library implements:
//! - A persistent UTXO set with copy-on-read viewpoints committed atomically
//! - A chain state machine that connects and disconnects single blocks
//! - A transaction pool validated against the confirmed set and itself
//! - Block template assembly and seeded proof-of-work verification
//! - A transaction builder for external signers

pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod error;
pub mod mempool;
pub mod mining;
pub mod storage;
pub mod txbuilder;

pub use error::{QtcError, Result};
