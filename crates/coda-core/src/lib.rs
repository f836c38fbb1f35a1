//! Shared foundation for the coda workspace: provider configuration,
//! runtime constants, and the per-session metrics aggregator.

pub mod config;
pub mod runtime;
pub mod stats;
