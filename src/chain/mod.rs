//! Chain access for the mood contract
//!
//! This module provides the `ChainSource` capability the sync engine consumes (log
//! subscriptions resumable from a watermark, and current-value reads) together with a
//! JSON-RPC implementation for EVM nodes and the ABI helpers both need.

/// ABI word decoding and encoding
pub mod abi;
/// JSON-RPC client for EVM nodes
mod client;
/// The capability consumed by the sync engine
mod source;
/// Type definitions for logs, watermarks and read-backs
mod types;

#[cfg(test)]
pub mod fake;

pub use client::JsonRpcClient;
pub use source::{ChainSource, LogStream};
pub use types::*;
