//! Cryptographic primitives for the QTC ledger

pub mod hash;

pub use hash::{Hash256, Hashable};
