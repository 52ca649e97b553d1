use super::types::{ChainError, ChainValue, FieldSelector, RawLog, Watermark};
use futures_util::Stream;
use std::pin::Pin;

/// Stream of contract logs; an `Err` item means the transport failed and the
/// subscription must be re-established.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<RawLog, ChainError>> + Send>>;

/// Access to the contract that owns the mirrored state.
///
/// Implementations must honour `from`: a subscription opened with a watermark
/// delivers every matching log strictly after it, in chain order, before any
/// live log.
#[async_trait::async_trait]
pub trait ChainSource: Send + Sync {
	/// Subscribe to logs with signature hash `topic` emitted by `contract`.
	async fn subscribe(
		&self,
		contract: &str,
		topic: &str,
		from: Option<Watermark>,
	) -> Result<LogStream, ChainError>;

	/// Point read of the present on-chain value of `field` for token `key`.
	async fn read_current(
		&self,
		contract: &str,
		field: FieldSelector,
		key: &str,
	) -> Result<ChainValue, ChainError>;
}
