//! One long-lived log subscription per event signature.
//!
//! Lifecycle: `Disconnected -> Connecting -> Subscribed`, back to `Disconnected` on a
//! transport error, then `Connecting` again after a backoff delay. The delay keeps
//! growing across sessions that die before delivering anything. Before
//! resubscribing the task waits for its in-flight events to settle so the
//! acknowledged watermark it resumes from is exact.

use super::coordinator::ShardRouter;
use super::decoder::{DecodeError, EventDecoder};
use super::events::Delivery;
use super::watermark::WatermarkTracker;
use crate::chain::{ChainError, ChainSource, LogStream, RawLog};
use crate::config::RetryPolicy;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
	Disconnected,
	Connecting,
	Subscribed,
}

enum PumpExit {
	Shutdown,
	Disconnected { delivered: bool },
}

pub(crate) struct Subscription {
	pub(crate) index: usize,
	pub(crate) name: &'static str,
	pub(crate) topic: String,
	pub(crate) contract: String,
	pub(crate) chain: Arc<dyn ChainSource>,
	pub(crate) decoder: Arc<EventDecoder>,
	pub(crate) tracker: Arc<WatermarkTracker>,
	pub(crate) router: ShardRouter,
	pub(crate) reconnect: RetryPolicy,
	pub(crate) state: watch::Sender<SubscriptionState>,
}

impl Subscription {
	/// Open the log stream from the acknowledged watermark.
	pub(crate) async fn connect(&self) -> Result<LogStream, ChainError> {
		self.state.send_replace(SubscriptionState::Connecting);
		let from = self.tracker.committed().await;
		match self.chain.subscribe(&self.contract, &self.topic, from).await {
			Ok(stream) => {
				self.state.send_replace(SubscriptionState::Subscribed);
				match from {
					Some(watermark) => info!(
						"Subscribed to {} ({}) resuming after {}",
						self.name, self.topic, watermark
					),
					None => info!("Subscribed to {} ({})", self.name, self.topic),
				}
				Ok(stream)
			}
			Err(e) => {
				self.state.send_replace(SubscriptionState::Disconnected);
				Err(e)
			}
		}
	}

	/// Pump the stream until shutdown, reconnecting on transport errors.
	pub(crate) async fn run(self, mut stream: LogStream, mut shutdown: watch::Receiver<bool>) {
		let mut backoff = self.reconnect.backoff();
		loop {
			match self.pump(&mut stream, &mut shutdown).await {
				PumpExit::Shutdown => break,
				PumpExit::Disconnected { delivered: true } => backoff.reset(),
				PumpExit::Disconnected { delivered: false } => {}
			}
			self.state.send_replace(SubscriptionState::Disconnected);

			tokio::select! {
				biased;
				_ = wait_for_shutdown(&mut shutdown) => break,
				_ = self.tracker.settled() => {}
			}

			match self.reconnect_with_backoff(&mut backoff, &mut shutdown).await {
				Some(next) => stream = next,
				None => break,
			}
		}

		self.state.send_replace(SubscriptionState::Disconnected);
		info!("Subscription {} stopped", self.name);
	}

	async fn pump(&self, stream: &mut LogStream, shutdown: &mut watch::Receiver<bool>) -> PumpExit {
		let mut delivered = false;
		loop {
			tokio::select! {
				biased;
				_ = wait_for_shutdown(shutdown) => return PumpExit::Shutdown,
				item = stream.next() => match item {
					Some(Ok(log)) => {
						delivered = true;
						if !self.dispatch(log).await {
							return PumpExit::Shutdown;
						}
					}
					Some(Err(e)) => {
						warn!("Subscription {} lost its stream: {}", self.name, e);
						return PumpExit::Disconnected { delivered };
					}
					None => {
						warn!("Subscription {} stream ended", self.name);
						return PumpExit::Disconnected { delivered };
					}
				}
			}
		}
	}

	/// Sleep the next backoff delay before every attempt. The caller owns `backoff`
	/// and resets it only after a session delivered logs.
	async fn reconnect_with_backoff(
		&self,
		backoff: &mut ExponentialBackoff,
		shutdown: &mut watch::Receiver<bool>,
	) -> Option<LogStream> {
		let mut attempt: u32 = 0;
		loop {
			attempt += 1;
			let delay = backoff
				.next_backoff()
				.unwrap_or(self.reconnect.max_interval);
			debug!("Reconnecting {} in {:?} (attempt {})", self.name, delay, attempt);
			tokio::select! {
				biased;
				_ = wait_for_shutdown(shutdown) => return None,
				_ = tokio::time::sleep(delay) => {}
			}

			match self.connect().await {
				Ok(stream) => return Some(stream),
				Err(e) => {
					warn!("Reconnecting {} failed (attempt {}): {}", self.name, attempt, e);
					if attempt >= self.reconnect.max_attempts {
						return None;
					}
				}
			}
		}
	}

	/// Hand one log to its shard. Returns false once the workers are gone.
	async fn dispatch(&self, log: RawLog) -> bool {
		if log.removed {
			debug!("Ignoring log removed by reorg at {}", log.watermark());
			return true;
		}
		let watermark = log.watermark();
		if !self.tracker.begin(watermark).await {
			return true;
		}

		match self.decoder.decode(&log) {
			Ok(event) => {
				debug!(
					subscription = self.name,
					%watermark,
					key = %event.key(),
					"Dispatching {}",
					event.kind()
				);
				let delivery = Delivery {
					subscription: self.index,
					watermark,
					raw: log,
					event,
				};
				if self.router.route(delivery).await.is_err() {
					self.tracker.complete(watermark).await;
					return false;
				}
			}
			Err(e @ DecodeError::Ignored { .. }) => {
				debug!(subscription = self.name, %watermark, "{}", e);
				self.tracker.complete(watermark).await;
			}
			Err(e) => {
				warn!(subscription = self.name, %watermark, "Dropping undecodable log: {}", e);
				self.tracker.complete(watermark).await;
			}
		}
		true
	}
}

/// Resolves once shutdown is signalled or the signalling side is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
	let _ = shutdown.wait_for(|stop| *stop).await;
}
