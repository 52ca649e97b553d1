//! Command line and environment configuration.
//!
//! Every option can be given as a flag or through the matching `MOOD_SYNC_*`
//! environment variable. Topic and selector defaults are the keccak hashes of the
//! mood contract's event and view-function signatures.

use crate::chain::FieldSelector;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// `NFTMinted(uint256,address,uint8)`
pub const RECORD_CREATED_TOPIC: &str =
	"0x3615a9d2f2a7466eb2bc7686e8915475a784c01ef6ae62de250983bd2005830d";
/// `MoodChanged(uint256,address,uint8)`
pub const VALUE_CHANGED_TOPIC: &str =
	"0x509b422fec757cb4cc78f1ec7bdb28adfab5d75770f68e14c10953e8762dedb8";
/// `MessageUpdated(uint256,address,string)`
pub const ANNOTATION_CHANGED_TOPIC: &str =
	"0xed8e690b88888bb59ffb2fe8cf401bb996addd829fb8d0c79dbb3fa2c5083bcc";
/// `Transfer(address,address,uint256)`
pub const TRANSFER_TOPIC: &str =
	"0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Mood NFT deployment on Base Sepolia.
pub const DEFAULT_CONTRACT: &str = "0xb54b20C431e73313e9d46Ad84C55971943448Cd3";

/// `getMood(uint256)`
pub const GET_MOOD_SELECTOR: &str = "0xf4cf2466";
/// `getMessage(uint256)`
pub const GET_MESSAGE_SELECTOR: &str = "0x86f79edb";
/// `ownerOf(uint256)`
pub const OWNER_OF_SELECTOR: &str = "0x6352211e";

#[derive(Debug, Parser)]
#[command(name = "mood-ledger-sync", version, about = "Mirror mood NFT state from chain into a durable store")]
pub struct Cli {
	#[command(flatten)]
	pub chain: ChainArgs,

	/// Directory holding records, watermarks and dead letters
	#[arg(long, env = "MOOD_SYNC_DATA_DIR", default_value = "./data", global = true)]
	pub data_dir: PathBuf,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Subscribe to contract events and keep the store in sync until interrupted
	Run(RunArgs),
	/// Re-derive one record from current on-chain values
	Replay {
		#[arg(long)]
		key: String,
	},
	/// Print one record
	Show {
		#[arg(long)]
		key: String,
	},
	/// Print record summaries, most recently updated first
	List {
		#[arg(long, default_value_t = 50)]
		limit: usize,
		#[arg(long, default_value_t = 0)]
		skip: usize,
		/// Only records held by this address, most recently created first
		#[arg(long)]
		owner: Option<String>,
	},
	/// Print the change history of one record
	History {
		#[arg(long)]
		key: String,
	},
	/// Print parked dead letters
	DeadLetters,
}

#[derive(Debug, Clone, Args)]
pub struct ChainArgs {
	#[arg(long, env = "MOOD_SYNC_RPC_HTTP", default_value = "https://sepolia.base.org", global = true)]
	pub rpc_http_url: String,

	#[arg(long, env = "MOOD_SYNC_RPC_WS", default_value = "wss://base-sepolia-rpc.publicnode.com", global = true)]
	pub rpc_ws_url: String,

	#[arg(long, env = "MOOD_SYNC_CONTRACT", default_value = DEFAULT_CONTRACT, global = true)]
	pub contract: String,

	#[arg(long, env = "MOOD_SYNC_CREATED_TOPIC", default_value = RECORD_CREATED_TOPIC, global = true)]
	pub created_topic: String,

	#[arg(long, env = "MOOD_SYNC_VALUE_TOPIC", default_value = VALUE_CHANGED_TOPIC, global = true)]
	pub value_topic: String,

	#[arg(long, env = "MOOD_SYNC_ANNOTATION_TOPIC", default_value = ANNOTATION_CHANGED_TOPIC, global = true)]
	pub annotation_topic: String,

	/// ERC-721 Transfer topic; pass an empty string to ignore ownership transfers
	#[arg(long, env = "MOOD_SYNC_TRANSFER_TOPIC", default_value = TRANSFER_TOPIC, global = true)]
	pub transfer_topic: String,

	#[arg(long, env = "MOOD_SYNC_MOOD_SELECTOR", default_value = GET_MOOD_SELECTOR, global = true)]
	pub mood_selector: String,

	#[arg(long, env = "MOOD_SYNC_MESSAGE_SELECTOR", default_value = GET_MESSAGE_SELECTOR, global = true)]
	pub message_selector: String,

	#[arg(long, env = "MOOD_SYNC_OWNER_SELECTOR", default_value = OWNER_OF_SELECTOR, global = true)]
	pub owner_selector: String,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
	/// Number of per-key shard workers
	#[arg(long, env = "MOOD_SYNC_SHARDS", default_value_t = 8)]
	pub shards: usize,

	/// Attempts before a failing event is dead-lettered
	#[arg(long, env = "MOOD_SYNC_MAX_ATTEMPTS", default_value_t = 5)]
	pub max_attempts: u32,

	/// First retry delay in milliseconds
	#[arg(long, env = "MOOD_SYNC_RETRY_INITIAL_MS", default_value_t = 250)]
	pub retry_initial_ms: u64,

	/// Retry delay cap in milliseconds
	#[arg(long, env = "MOOD_SYNC_RETRY_MAX_MS", default_value_t = 10_000)]
	pub retry_max_ms: u64,

	/// Reconnect delay cap in milliseconds
	#[arg(long, env = "MOOD_SYNC_RECONNECT_MAX_MS", default_value_t = 30_000)]
	pub reconnect_max_ms: u64,

	/// How long an event waits for an earlier event of its key from another subscription
	#[arg(long, env = "MOOD_SYNC_REORDER_WAIT_MS", default_value_t = 30_000)]
	pub reorder_wait_ms: u64,
}

impl ChainArgs {
	pub fn contract(&self) -> String {
		normalize_hex(&self.contract)
	}

	pub fn topics(&self) -> EventTopics {
		EventTopics {
			record_created: normalize_hex(&self.created_topic),
			value_changed: normalize_hex(&self.value_topic),
			annotation_changed: normalize_hex(&self.annotation_topic),
			transfer: Some(normalize_hex(&self.transfer_topic)).filter(|t| t != "0x"),
		}
	}

	pub fn selectors(&self) -> ReadSelectors {
		ReadSelectors {
			mood: normalize_hex(&self.mood_selector),
			message: normalize_hex(&self.message_selector),
			owner: normalize_hex(&self.owner_selector),
		}
	}
}

impl RunArgs {
	pub fn write_retry(&self) -> RetryPolicy {
		RetryPolicy {
			initial_interval: Duration::from_millis(self.retry_initial_ms),
			max_interval: Duration::from_millis(self.retry_max_ms),
			multiplier: 2.0,
			max_attempts: self.max_attempts.max(1),
		}
	}

	pub fn reconnect(&self) -> RetryPolicy {
		RetryPolicy {
			initial_interval: Duration::from_millis(self.retry_initial_ms),
			max_interval: Duration::from_millis(self.reconnect_max_ms),
			multiplier: 2.0,
			max_attempts: u32::MAX,
		}
	}
}

/// Runtime settings of the sync engine.
#[derive(Debug, Clone)]
pub struct SyncSettings {
	pub contract: String,
	pub topics: EventTopics,
	pub shards: usize,
	/// Bound of each shard queue; a full queue pushes back on the subscriptions.
	pub queue_capacity: usize,
	pub write_retry: RetryPolicy,
	pub read_retry: RetryPolicy,
	pub reconnect: RetryPolicy,
	/// How long a shard holds back an event whose key is missing an earlier event
	/// before giving up on it.
	pub reorder_wait: Duration,
}

impl SyncSettings {
	pub fn new(chain: &ChainArgs, run: &RunArgs) -> Self {
		Self {
			contract: chain.contract(),
			topics: chain.topics(),
			shards: run.shards.max(1),
			queue_capacity: 256,
			write_retry: run.write_retry(),
			read_retry: run.write_retry(),
			reconnect: run.reconnect(),
			reorder_wait: Duration::from_millis(run.reorder_wait_ms),
		}
	}
}

impl Default for SyncSettings {
	fn default() -> Self {
		Self {
			contract: DEFAULT_CONTRACT.to_ascii_lowercase(),
			topics: EventTopics::default(),
			shards: 8,
			queue_capacity: 256,
			write_retry: RetryPolicy::default(),
			read_retry: RetryPolicy::default(),
			reconnect: RetryPolicy {
				max_interval: Duration::from_secs(30),
				max_attempts: u32::MAX,
				..RetryPolicy::default()
			},
			reorder_wait: Duration::from_secs(30),
		}
	}
}

fn normalize_hex(value: &str) -> String {
	let trimmed = value.trim().to_ascii_lowercase();
	if trimmed.starts_with("0x") {
		trimmed
	} else {
		format!("0x{trimmed}")
	}
}

/// Signature hashes of the events the coordinator subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTopics {
	pub record_created: String,
	pub value_changed: String,
	pub annotation_changed: String,
	pub transfer: Option<String>,
}

impl Default for EventTopics {
	fn default() -> Self {
		Self {
			record_created: RECORD_CREATED_TOPIC.to_string(),
			value_changed: VALUE_CHANGED_TOPIC.to_string(),
			annotation_changed: ANNOTATION_CHANGED_TOPIC.to_string(),
			transfer: Some(TRANSFER_TOPIC.to_string()),
		}
	}
}

impl EventTopics {
	/// `(subscription name, topic)` pairs, one subscription per event type.
	pub fn subscriptions(&self) -> Vec<(&'static str, String)> {
		let mut subscriptions = vec![
			("record_created", self.record_created.clone()),
			("value_changed", self.value_changed.clone()),
			("annotation_changed", self.annotation_changed.clone()),
		];
		if let Some(transfer) = &self.transfer {
			subscriptions.push(("ownership_transferred", transfer.clone()));
		}
		subscriptions
	}
}

/// Function selectors for current-value reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSelectors {
	pub mood: String,
	pub message: String,
	pub owner: String,
}

impl Default for ReadSelectors {
	fn default() -> Self {
		Self {
			mood: GET_MOOD_SELECTOR.to_string(),
			message: GET_MESSAGE_SELECTOR.to_string(),
			owner: OWNER_OF_SELECTOR.to_string(),
		}
	}
}

impl ReadSelectors {
	pub fn for_field(&self, field: FieldSelector) -> &str {
		match field {
			FieldSelector::Mood => &self.mood,
			FieldSelector::Message => &self.message,
			FieldSelector::Owner => &self.owner,
		}
	}
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
	pub initial_interval: Duration,
	pub max_interval: Duration,
	pub multiplier: f64,
	/// Total attempts including the first one.
	pub max_attempts: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			initial_interval: Duration::from_millis(250),
			max_interval: Duration::from_secs(10),
			multiplier: 2.0,
			max_attempts: 5,
		}
	}
}

impl RetryPolicy {
	/// Attempts are capped by `max_attempts`, not by elapsed time.
	pub fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.initial_interval)
			.with_max_interval(self.max_interval)
			.with_multiplier(self.multiplier)
			.with_max_elapsed_time(None)
			.build()
	}

	#[cfg(test)]
	pub fn immediate(max_attempts: u32) -> Self {
		Self {
			initial_interval: Duration::from_millis(1),
			max_interval: Duration::from_millis(2),
			multiplier: 1.0,
			max_attempts,
		}
	}
}
