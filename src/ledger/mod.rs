//! Durable mirror of token state
//!
//! Records, their storage, and the writer that is the single path through which
//! they change.

pub mod clock;
mod error;
pub mod projection;
pub mod record;
pub mod repository;
mod writer;

pub use error::StoreError;
pub use record::{LedgerRecord, Mood, Owner, Pagination, RecordKey, Snapshot};
pub use repository::{FileRecordRepository, MemoryRecordRepository};
pub use writer::{AnnotationUpdate, StoreWriter, ValueUpdate, WriteRequest};
