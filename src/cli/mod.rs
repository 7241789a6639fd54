//! CLI module
//!
//! Command-line interface for the transfer binary.

pub mod args;

pub use args::CliArgs;
