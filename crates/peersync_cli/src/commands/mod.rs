//! CLI command implementations.

pub mod config;
pub mod discover;
pub mod serve;
