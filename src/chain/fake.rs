//! Scripted in-process chain used by the sync tests.

use super::abi::{self, encode::*};
use super::source::{ChainSource, LogStream};
use super::types::*;
use futures_util::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub const CONTRACT: &str = "0xb54b20c431e73313e9d46ad84c55971943448cd3";
pub const CREATED_TOPIC: &str = "0x3615a9d2f2a7466eb2bc7686e8915475a784c01ef6ae62de250983bd2005830d";
pub const MOOD_TOPIC: &str = "0x509b422fec757cb4cc78f1ec7bdb28adfab5d75770f68e14c10953e8762dedb8";
pub const MESSAGE_TOPIC: &str = "0xed8e690b88888bb59ffb2fe8cf401bb996addd829fb8d0c79dbb3fa2c5083bcc";
pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Pad a short owner like `0xaa` to a full address.
pub fn address(short: &str) -> String {
	let digits = abi::strip_0x(short);
	format!("0x{:0>40}", digits.to_ascii_lowercase())
}

fn key_topic(key: &str) -> String {
	hex_word(&abi::decimal_to_word(key).unwrap())
}

pub fn created_log(block: u64, key: &str, owner: &str, mood: u8) -> RawLog {
	log(
		block,
		vec![
			CREATED_TOPIC.to_string(),
			key_topic(key),
			hex_word(&address_word(&address(owner))),
		],
		u8_word(mood).to_vec(),
	)
}

pub fn mood_log(block: u64, key: &str, owner: &str, mood: u8) -> RawLog {
	log(
		block,
		vec![
			MOOD_TOPIC.to_string(),
			key_topic(key),
			hex_word(&address_word(&address(owner))),
		],
		u8_word(mood).to_vec(),
	)
}

pub fn message_log(block: u64, key: &str, owner: &str, message: &str) -> RawLog {
	let mut data = usize_word(32).to_vec();
	data.extend(string_tail(message));
	log(
		block,
		vec![
			MESSAGE_TOPIC.to_string(),
			key_topic(key),
			hex_word(&address_word(&address(owner))),
		],
		data,
	)
}

pub fn transfer_log(block: u64, key: &str, from: &str, to: &str) -> RawLog {
	log(
		block,
		vec![
			TRANSFER_TOPIC.to_string(),
			hex_word(&address_word(&address(from))),
			hex_word(&address_word(&address(to))),
			key_topic(key),
		],
		Vec::new(),
	)
}

fn log(block: u64, topics: Vec<String>, data: Vec<u8>) -> RawLog {
	RawLog {
		address: CONTRACT.to_string(),
		topics,
		data: format!("0x{}", hex::encode(data)),
		block_number: block,
		log_index: 0,
		transaction_hash: None,
		removed: false,
	}
}

#[derive(Debug, Clone, Default)]
pub struct TokenState {
	pub owner: String,
	pub mood: u8,
	pub message: String,
}

/// In-memory chain: an append-only log plus current token state.
///
/// A session delivers matching logs strictly after its `from` watermark (or from the
/// start of the log), then waits for new ones. A per-topic disconnect script makes
/// the next session fail after delivering a given number of logs.
pub struct FakeChain {
	logs: Arc<Mutex<Vec<RawLog>>>,
	appended: watch::Sender<usize>,
	tokens: Mutex<HashMap<String, TokenState>>,
	read_failures: Mutex<HashMap<(String, FieldSelector), u32>>,
	disconnects: Mutex<HashMap<String, VecDeque<usize>>>,
	subscribe_failures: Mutex<u32>,
	subscriptions: Mutex<Vec<(String, Option<Watermark>)>>,
	delivered: Arc<Mutex<Vec<(usize, Watermark)>>>,
	reads: Mutex<Vec<(String, FieldSelector)>>,
}

impl FakeChain {
	pub fn new() -> Self {
		let (appended, _) = watch::channel(0);
		Self {
			logs: Arc::new(Mutex::new(Vec::new())),
			appended,
			tokens: Mutex::new(HashMap::new()),
			read_failures: Mutex::new(HashMap::new()),
			disconnects: Mutex::new(HashMap::new()),
			subscribe_failures: Mutex::new(0),
			subscriptions: Mutex::new(Vec::new()),
			delivered: Arc::new(Mutex::new(Vec::new())),
			reads: Mutex::new(Vec::new()),
		}
	}

	/// Append a log; its log index is assigned from its position in the block.
	pub fn emit(&self, mut log: RawLog) -> Watermark {
		let mut logs = self.logs.lock().unwrap();
		log.log_index = logs
			.iter()
			.filter(|l| l.block_number == log.block_number)
			.count() as u64;
		let watermark = log.watermark();
		logs.push(log);
		let len = logs.len();
		drop(logs);
		self.appended.send_replace(len);
		watermark
	}

	pub fn set_token(&self, key: &str, owner: &str, mood: u8, message: &str) {
		self.tokens.lock().unwrap().insert(
			key.to_string(),
			TokenState {
				owner: address(owner),
				mood,
				message: message.to_string(),
			},
		);
	}

	/// Make the next `times` reads of `field` for `key` fail with a transport error.
	pub fn fail_reads(&self, key: &str, field: FieldSelector, times: u32) {
		self.read_failures
			.lock()
			.unwrap()
			.insert((key.to_string(), field), times);
	}

	/// Make the next session on `topic` error out after `after` deliveries.
	pub fn disconnect_after(&self, topic: &str, after: usize) {
		self.disconnects
			.lock()
			.unwrap()
			.entry(topic.to_string())
			.or_default()
			.push_back(after);
	}

	pub fn fail_subscribes(&self, times: u32) {
		*self.subscribe_failures.lock().unwrap() = times;
	}

	pub fn subscriptions(&self) -> Vec<(String, Option<Watermark>)> {
		self.subscriptions.lock().unwrap().clone()
	}

	/// `(session number, watermark)` of every log handed to a subscriber.
	pub fn delivered(&self) -> Vec<(usize, Watermark)> {
		self.delivered.lock().unwrap().clone()
	}

	pub fn reads(&self) -> Vec<(String, FieldSelector)> {
		self.reads.lock().unwrap().clone()
	}
}

struct Session {
	topic: String,
	cursor: Option<Watermark>,
	remaining: Option<usize>,
	number: usize,
	appended: watch::Receiver<usize>,
	done: bool,
}

#[async_trait::async_trait]
impl ChainSource for FakeChain {
	async fn subscribe(
		&self,
		_contract: &str,
		topic: &str,
		from: Option<Watermark>,
	) -> Result<LogStream, ChainError> {
		{
			let mut failures = self.subscribe_failures.lock().unwrap();
			if *failures > 0 {
				*failures -= 1;
				return Err(ChainError::Closed("node unavailable".to_string()));
			}
		}

		let number = {
			let mut subscriptions = self.subscriptions.lock().unwrap();
			subscriptions.push((topic.to_string(), from));
			subscriptions.len()
		};
		let remaining = self
			.disconnects
			.lock()
			.unwrap()
			.get_mut(topic)
			.and_then(VecDeque::pop_front);

		let session = Session {
			topic: topic.to_string(),
			cursor: from,
			remaining,
			number,
			appended: self.appended.subscribe(),
			done: false,
		};
		let logs = self.logs.clone();
		let delivered = self.delivered.clone();

		let stream = stream::unfold(session, move |mut session| {
			let logs = logs.clone();
			let delivered = delivered.clone();
			async move {
				if session.done {
					return None;
				}
				loop {
					if session.remaining == Some(0) {
						session.done = true;
						return Some((
							Err(ChainError::Closed("scripted disconnect".to_string())),
							session,
						));
					}
					let next = logs
						.lock()
						.unwrap()
						.iter()
						.filter(|l| l.signature().as_deref() == Some(session.topic.as_str()))
						.find(|l| session.cursor.is_none_or(|c| l.watermark() > c))
						.cloned();
					if let Some(log) = next {
						session.cursor = Some(log.watermark());
						if let Some(remaining) = session.remaining.as_mut() {
							*remaining -= 1;
						}
						delivered
							.lock()
							.unwrap()
							.push((session.number, log.watermark()));
						return Some((Ok(log), session));
					}
					if session.appended.changed().await.is_err() {
						return None;
					}
				}
			}
		});

		Ok(Box::pin(stream))
	}

	async fn read_current(
		&self,
		_contract: &str,
		field: FieldSelector,
		key: &str,
	) -> Result<ChainValue, ChainError> {
		self.reads.lock().unwrap().push((key.to_string(), field));
		{
			let mut failures = self.read_failures.lock().unwrap();
			if let Some(left) = failures.get_mut(&(key.to_string(), field)) {
				if *left > 0 {
					*left -= 1;
					return Err(ChainError::Closed("read timed out".to_string()));
				}
			}
		}
		let tokens = self.tokens.lock().unwrap();
		let token = tokens.get(key).ok_or(ChainError::RpcError {
			code: 3,
			message: "execution reverted: nonexistent token".to_string(),
		})?;
		Ok(match field {
			FieldSelector::Mood => ChainValue::Mood(token.mood),
			FieldSelector::Message => ChainValue::Message(token.message.clone()),
			FieldSelector::Owner => ChainValue::Owner(token.owner.clone()),
		})
	}
}
