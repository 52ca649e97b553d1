//! JSON-RPC client for an EVM node.
//!
//! Point reads and historical log queries go over HTTP; live logs arrive over a
//! WebSocket `eth_subscribe("logs")` subscription. A subscription opened from a
//! watermark first replays the gap with `eth_getLogs`, then switches to the live feed.

use super::abi;
use super::source::{ChainSource, LogStream};
use super::types::*;
use crate::config::ReadSelectors;
use futures_util::{SinkExt, StreamExt, stream};
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// EVM JSON-RPC client
pub struct JsonRpcClient {
	/// The underlying HTTP client for JSON-RPC calls.
	http_client: Client,
	/// HTTP endpoint of the node.
	http_url: String,
	/// WebSocket endpoint of the node, used for live log subscriptions.
	ws_url: String,
	/// Function selectors for current-value reads.
	selectors: ReadSelectors,
	next_id: AtomicU64,
}

impl JsonRpcClient {
	/// Create a new node client.
	///
	/// # Arguments
	/// * `http_url` - The HTTP endpoint for JSON-RPC calls.
	/// * `ws_url` - The WebSocket endpoint for subscriptions.
	/// * `selectors` - Selectors of the contract's view functions.
	pub fn new(
		http_url: String,
		ws_url: String,
		selectors: ReadSelectors,
	) -> Result<Self, ChainError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

		Ok(Self {
			http_client,
			http_url,
			ws_url,
			selectors,
			next_id: AtomicU64::new(1),
		})
	}

	/// Execute a JSON-RPC call and return its `result` member.
	pub async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": self.next_id.fetch_add(1, Ordering::Relaxed),
			"method": method,
			"params": params,
		});

		let response = self
			.http_client
			.post(&self.http_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?
			.error_for_status()?;

		let response_json: Value = response.json().await?;
		rpc_result(response_json)
	}

	/// Current head block number.
	pub async fn block_number(&self) -> Result<u64, ChainError> {
		let result = self.call("eth_blockNumber", json!([])).await?;
		let raw = result
			.as_str()
			.ok_or_else(|| ChainError::InvalidResponse(format!("block number {result}")))?;
		quantity::parse(raw).map_err(ChainError::InvalidResponse)
	}

	/// Historical logs for one event signature in an inclusive block range.
	pub async fn get_logs(
		&self,
		contract: &str,
		topic: &str,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, ChainError> {
		let filter = json!({
			"address": contract,
			"topics": [topic],
			"fromBlock": format!("{:#x}", from_block),
			"toBlock": format!("{:#x}", to_block),
		});
		let result = self.call("eth_getLogs", json!([filter])).await?;
		let mut logs: Vec<RawLog> = serde_json::from_value(result)?;
		logs.sort_by_key(RawLog::watermark);
		Ok(logs)
	}

	/// `eth_call` against the latest block, returning the raw return data.
	pub async fn eth_call(&self, contract: &str, data: &str) -> Result<Vec<u8>, ChainError> {
		let result = self
			.call(
				"eth_call",
				json!([{ "to": contract, "data": data }, "latest"]),
			)
			.await?;
		let raw = result.as_str().ok_or(ChainError::NoData)?;
		abi::decode_hex(raw).map_err(|e| ChainError::InvalidResponse(e.to_string()))
	}

	/// Open a live `logs` subscription over WebSocket.
	///
	/// # Errors
	/// Returns `ChainError` if the connection or the `eth_subscribe` handshake fails.
	pub async fn subscribe_logs(&self, contract: &str, topic: &str) -> Result<LogStream, ChainError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		let (ws_stream, response) = connect_async(self.ws_url.as_str()).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let subscribe_message = json!({
			"jsonrpc": "2.0",
			"id": self.next_id.fetch_add(1, Ordering::Relaxed),
			"method": "eth_subscribe",
			"params": ["logs", { "address": contract, "topics": [topic] }],
		});
		ws_sender
			.send(Message::Text(subscribe_message.to_string()))
			.await?;

		// Wait for the subscription id
		let subscription_id = loop {
			match ws_receiver.next().await {
				Some(msg) => match msg? {
					Message::Text(text) => {
						let parsed: Value = serde_json::from_str(&text)?;
						let id = rpc_result(parsed)?;
						break id
							.as_str()
							.ok_or_else(|| {
								ChainError::SubscriptionError(format!(
									"unexpected subscription id {id}"
								))
							})?
							.to_string();
					}
					Message::Ping(_) | Message::Pong(_) => continue,
					_ => {
						return Err(ChainError::SubscriptionError(
							"Unexpected message type during handshake".to_string(),
						));
					}
				},
				None => {
					return Err(ChainError::Closed(
						"connection closed during handshake".to_string(),
					));
				}
			}
		};

		info!("Subscribed to logs for topic {} ({})", topic, subscription_id);

		// The sender half must stay alive for as long as the stream is read.
		let stream = ws_receiver.filter_map(move |msg| {
			let _keep_open = &ws_sender;
			let result = parse_notification(msg, &subscription_id);
			async move { result }
		});

		Ok(Box::pin(stream))
	}
}

fn rpc_result(mut response: Value) -> Result<Value, ChainError> {
	if let Some(error) = response.get("error") {
		return Err(ChainError::RpcError {
			code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
			message: error
				.get("message")
				.and_then(Value::as_str)
				.unwrap_or("unknown error")
				.to_string(),
		});
	}
	match response.get_mut("result") {
		Some(result) => Ok(result.take()),
		None => Err(ChainError::NoData),
	}
}

fn parse_notification(
	msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
	subscription_id: &str,
) -> Option<Result<RawLog, ChainError>> {
	match msg {
		Ok(Message::Text(text)) => {
			let parsed: Value = match serde_json::from_str(&text) {
				Ok(parsed) => parsed,
				Err(e) => return Some(Err(ChainError::JsonError(e))),
			};
			if parsed.get("method").and_then(Value::as_str) != Some("eth_subscription") {
				debug!("Ignoring message: {}", text);
				return None;
			}
			let params = parsed.get("params")?;
			if params.get("subscription").and_then(Value::as_str) != Some(subscription_id) {
				return None;
			}
			match params.get("result").cloned() {
				Some(result) => Some(serde_json::from_value(result).map_err(ChainError::JsonError)),
				None => Some(Err(ChainError::NoData)),
			}
		}
		Ok(Message::Close(frame)) => Some(Err(ChainError::Closed(format!("{:?}", frame)))),
		Ok(_) => None,
		Err(e) => Some(Err(ChainError::WebSocketError(e))),
	}
}

#[async_trait::async_trait]
impl ChainSource for JsonRpcClient {
	async fn subscribe(
		&self,
		contract: &str,
		topic: &str,
		from: Option<Watermark>,
	) -> Result<LogStream, ChainError> {
		// Open the live feed first so nothing emitted while the backlog is
		// fetched falls between the two.
		let live = self.subscribe_logs(contract, topic).await?;

		let backlog = match from {
			Some(watermark) => {
				let head = self.block_number().await?;
				let logs = self
					.get_logs(contract, topic, watermark.block_number, head)
					.await?;
				let logs: Vec<RawLog> = logs
					.into_iter()
					.filter(|log| log.watermark() > watermark)
					.collect();
				info!(
					"Redelivering {} logs for topic {} after {}",
					logs.len(),
					topic,
					watermark
				);
				logs
			}
			None => Vec::new(),
		};

		let floor = backlog.last().map(RawLog::watermark).or(from);
		let live = live.filter(move |item| {
			let keep = match (item, floor) {
				(Ok(log), Some(floor)) => log.watermark() > floor,
				_ => true,
			};
			async move { keep }
		});

		let stream = stream::iter(backlog.into_iter().map(Ok))
			.chain(live)
			.filter(|item| {
				let keep = match item {
					Ok(log) if log.removed => {
						warn!("Skipping removed log at {}", log.watermark());
						false
					}
					_ => true,
				};
				async move { keep }
			});

		Ok(Box::pin(stream))
	}

	async fn read_current(
		&self,
		contract: &str,
		field: FieldSelector,
		key: &str,
	) -> Result<ChainValue, ChainError> {
		let argument =
			abi::decimal_to_word(key).map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
		let calldata = abi::encode_call(self.selectors.for_field(field), &argument);
		let data = self.eth_call(contract, &calldata).await?;
		decode_return(field, &data)
	}
}

/// Decode the return data of a view call.
pub fn decode_return(field: FieldSelector, data: &[u8]) -> Result<ChainValue, ChainError> {
	let invalid = |e: abi::AbiError| ChainError::InvalidResponse(format!("{field}: {e}"));
	match field {
		FieldSelector::Mood => abi::word_at(data, 0)
			.and_then(|w| abi::word_to_u8(&w))
			.map(ChainValue::Mood)
			.map_err(invalid),
		FieldSelector::Message => abi::decode_string(data, 0)
			.map(ChainValue::Message)
			.map_err(invalid),
		FieldSelector::Owner => abi::word_at(data, 0)
			.and_then(|w| abi::word_to_address(&w))
			.map(ChainValue::Owner)
			.map_err(invalid),
	}
}
