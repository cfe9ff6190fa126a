//! Consensus module for block validation and monetary policy

pub mod validation;
pub mod monetary;

pub use validation::{AcceptAllPrograms, BlockValidator, ProgramVerifier};
pub use monetary::MonetaryPolicy;
