//! Chain-to-store synchronization engine
//!
//! Subscriptions feed decoded events through per-key shard workers, which resolve
//! partial events against the contract and apply them through the store writer.

pub mod coordinator;
pub mod dead_letter;
pub mod decoder;
pub mod events;
pub mod resolver;
mod subscription;
pub mod watermark;

pub use coordinator::SyncCoordinator;
pub use dead_letter::DeadLetterQueue;
pub use resolver::{ResolveError, StateResolver};
pub use watermark::FileWatermarkRepository;
