//! Subcommand implementations.

pub mod flash;
pub mod info;
