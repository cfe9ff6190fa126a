//! Command line interface for the qtcd binary

pub mod commands;

pub use commands::run_cli;
