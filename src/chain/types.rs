//! Types for contract log subscriptions and current-value reads

use serde::{Deserialize, Serialize};
use std::fmt;

/// Resumable position in a contract's log stream.
///
/// Ordering follows chain order: block number first, then the log index inside the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
	pub block_number: u64,
	pub log_index: u64,
}

impl Watermark {
	pub fn new(block_number: u64, log_index: u64) -> Self {
		Self {
			block_number,
			log_index,
		}
	}
}

impl fmt::Display for Watermark {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.block_number, self.log_index)
	}
}

/// A contract log entry as delivered by the node.
///
/// Field names and hex-encoded quantities follow the JSON-RPC log object, so the same
/// struct deserializes `eth_getLogs` results and `eth_subscription` notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
	/// Emitting contract address.
	pub address: String,
	/// Topic 0 is the event signature hash; the rest are indexed arguments.
	pub topics: Vec<String>,
	/// ABI-encoded non-indexed arguments as a `0x` hex string.
	pub data: String,
	#[serde(rename = "blockNumber", with = "quantity")]
	pub block_number: u64,
	#[serde(rename = "logIndex", with = "quantity")]
	pub log_index: u64,
	#[serde(rename = "transactionHash", default)]
	pub transaction_hash: Option<String>,
	/// Set by the node when the log was dropped by a reorg.
	#[serde(default)]
	pub removed: bool,
}

impl RawLog {
	pub fn watermark(&self) -> Watermark {
		Watermark::new(self.block_number, self.log_index)
	}

	/// Event signature hash, lowercased.
	pub fn signature(&self) -> Option<String> {
		self.topics.first().map(|t| t.to_ascii_lowercase())
	}
}

/// Contract view functions the resolver can read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldSelector {
	/// `getMood(uint256)`
	Mood,
	/// `getMessage(uint256)`
	Message,
	/// `ownerOf(uint256)`
	Owner,
}

impl fmt::Display for FieldSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FieldSelector::Mood => write!(f, "mood"),
			FieldSelector::Message => write!(f, "message"),
			FieldSelector::Owner => write!(f, "owner"),
		}
	}
}

/// Decoded result of a current-value read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainValue {
	Mood(u8),
	Message(String),
	Owner(String),
}

/// Error types for node access
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
	#[error("JSON-RPC error {code}: {message}")]
	RpcError { code: i64, message: String },

	#[error("No data returned")]
	NoData,

	#[error("WebSocket error: {0}")]
	WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Subscription error: {0}")]
	SubscriptionError(String),

	#[error("Invalid response: {0}")]
	InvalidResponse(String),

	#[error("Stream closed: {0}")]
	Closed(String),
}

impl ChainError {
	/// Whether retrying the same request can succeed.
	///
	/// A response the client cannot interpret will not change on retry; everything
	/// else is transport or node-side trouble.
	pub fn is_transient(&self) -> bool {
		!matches!(self, ChainError::InvalidResponse(_))
	}
}

/// Serde adapter for JSON-RPC hex quantities (`"0x1b4"`).
pub(crate) mod quantity {
	use serde::{Deserialize, Deserializer, Serializer, de::Error};

	pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&format!("{:#x}", value))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
		let raw = String::deserialize(deserializer)?;
		parse(&raw).map_err(D::Error::custom)
	}

	pub fn parse(raw: &str) -> Result<u64, String> {
		let digits = raw
			.strip_prefix("0x")
			.or_else(|| raw.strip_prefix("0X"))
			.ok_or_else(|| format!("quantity {raw:?} is missing the 0x prefix"))?;
		u64::from_str_radix(digits, 16).map_err(|e| format!("invalid quantity {raw:?}: {e}"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn raw_log_deserializes_rpc_log_object() {
		let json = serde_json::json!({
			"address": "0xb54b20c431e73313e9d46ad84c55971943448cd3",
			"topics": ["0xABC"],
			"data": "0x",
			"blockNumber": "0x1b4",
			"logIndex": "0x2",
			"transactionHash": "0xdead",
			"blockHash": "0xbeef"
		});

		let log: RawLog = serde_json::from_value(json).unwrap();
		assert_eq!(log.watermark(), Watermark::new(436, 2));
		assert_eq!(log.signature().as_deref(), Some("0xabc"));
		assert!(!log.removed);

		let back = serde_json::to_value(&log).unwrap();
		assert_eq!(back["blockNumber"], "0x1b4");
	}

	#[test]
	fn watermarks_order_by_block_then_log_index() {
		assert!(Watermark::new(10, 5) < Watermark::new(11, 0));
		assert!(Watermark::new(10, 1) < Watermark::new(10, 2));
	}

	#[test]
	fn quantity_requires_prefix() {
		assert!(quantity::parse("1b4").is_err());
		assert_eq!(quantity::parse("0x0"), Ok(0));
	}
}
