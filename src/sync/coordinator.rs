//! Sync coordinator: wires subscriptions, shard workers, resolver and writer.
//!
//! Each configured event signature gets its own subscription task. Decoded events
//! are routed by a stable hash of their record key onto one of N bounded shard
//! queues; a shard worker handles its queue strictly in order, so every key is
//! owned by exactly one sequential worker while different keys progress in
//! parallel. Workers resolve, write, retry transient failures and dead-letter what
//! cannot be applied, then acknowledge the position with the subscription's
//! watermark tracker.
//!
//! Subscriptions run independently, so a key's update can reach its shard before
//! the mint or transfer that precedes it on chain. A worker holds such an update,
//! unacknowledged, and retries it in watermark order once an earlier event for the
//! key is applied. An update still blocked after `reorder_wait` is rejected if it is
//! a plain owner mismatch and dead-lettered otherwise.

use super::dead_letter::{DeadLetter, DeadLetterQueue};
use super::decoder::EventDecoder;
use super::events::{Delivery, DomainEvent};
use super::resolver::{ResolveError, StateResolver};
use super::subscription::{Subscription, SubscriptionState};
use super::watermark::{WatermarkRepository, WatermarkTracker};
use crate::chain::{ChainError, ChainSource, Watermark};
use crate::config::{RetryPolicy, SyncSettings};
use crate::ledger::{LedgerRecord, RecordKey, StoreError, StoreWriter};
use backoff::future::retry;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("failed to subscribe to {subscription}: {source}")]
	Subscribe {
		subscription: &'static str,
		source: ChainError,
	},

	#[error("Store error: {0}")]
	Store(#[from] StoreError),
}

/// Routes deliveries to shard queues by record key.
#[derive(Clone)]
pub(crate) struct ShardRouter {
	senders: Arc<Vec<mpsc::Sender<Delivery>>>,
}

impl ShardRouter {
	pub(crate) fn shard_for(key: &RecordKey, shards: usize) -> usize {
		let mut hasher = DefaultHasher::new();
		key.hash(&mut hasher);
		(hasher.finish() % shards as u64) as usize
	}

	/// Enqueue a delivery, waiting for room. Fails only when the shard has stopped.
	pub(crate) async fn route(&self, delivery: Delivery) -> Result<(), Delivery> {
		let shard = Self::shard_for(delivery.event.key(), self.senders.len());
		self.senders[shard]
			.send(delivery)
			.await
			.map_err(|rejected| rejected.0)
	}
}

#[derive(Debug, thiserror::Error)]
enum Failure {
	#[error(transparent)]
	Resolve(#[from] ResolveError),
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl Failure {
	fn is_transient(&self) -> bool {
		match self {
			Failure::Resolve(e) => e.is_transient(),
			Failure::Store(e) => e.is_transient(),
		}
	}

	/// Failures that an earlier event for the same key, still on its way through
	/// another subscription, would turn into a success: an update before its mint,
	/// or a new owner's update before the transfer.
	fn awaits_earlier_event(&self, event: &DomainEvent) -> bool {
		match self {
			Failure::Store(StoreError::Unauthorized { .. }) => true,
			Failure::Store(StoreError::NotFound(_)) => {
				!matches!(event, DomainEvent::RecordCreated { .. })
			}
			_ => false,
		}
	}

	fn kind(&self) -> &'static str {
		match self {
			Failure::Resolve(_) => "resolve",
			Failure::Store(e) => e.kind(),
		}
	}
}

/// Result of one pass through resolve and write.
enum Outcome {
	Applied,
	Settled,
	Blocked(Failure),
}

/// What became of a delivery handed to the worker.
#[derive(Debug, PartialEq, Eq)]
enum Step {
	Applied,
	Settled,
	Held,
}

/// A delivery waiting for an earlier event of its key.
struct Held {
	delivery: Delivery,
	since: Instant,
	attempts: u32,
}

struct ShardWorker {
	shard: usize,
	queue: mpsc::Receiver<Delivery>,
	resolver: Arc<StateResolver>,
	writer: Arc<StoreWriter>,
	trackers: Arc<Vec<Arc<WatermarkTracker>>>,
	dead_letters: Arc<DeadLetterQueue>,
	retry: RetryPolicy,
	reorder_wait: Duration,
	/// Held deliveries per key, ordered by watermark.
	held: HashMap<RecordKey, Vec<Held>>,
	/// Highest watermark applied per key; bounded by the number of tokens.
	applied: HashMap<RecordKey, Watermark>,
}

impl ShardWorker {
	async fn run(mut self) {
		loop {
			let deadline = self.next_deadline();
			tokio::select! {
				item = self.queue.recv() => match item {
					Some(delivery) => self.handle(delivery).await,
					None => break,
				},
				_ = sleep_until(deadline) => self.expire().await,
			}
		}

		let keys: Vec<RecordKey> = self.held.keys().cloned().collect();
		for key in keys {
			while let Some(held) = self.take_first(&key) {
				self.attempt(held, false).await;
			}
		}
		debug!("Shard {} drained", self.shard);
	}

	/// Apply a fresh delivery in watermark order with whatever is held for its key.
	async fn handle(&mut self, delivery: Delivery) {
		let key = delivery.event.key().clone();
		let held = Held {
			delivery,
			since: Instant::now(),
			attempts: 0,
		};
		let behind_held = self
			.held
			.get(&key)
			.and_then(|queue| queue.first())
			.is_some_and(|first| held.delivery.watermark > first.delivery.watermark);
		if behind_held {
			debug!(%key, watermark = %held.delivery.watermark, "Queued behind a held event");
			self.hold(held);
			return;
		}
		if self.attempt(held, true).await == Step::Applied {
			self.release(&key).await;
		}
	}

	/// Retry held deliveries of `key` until one is still blocked.
	async fn release(&mut self, key: &RecordKey) {
		while let Some(held) = self.take_first(key) {
			if self.attempt(held, true).await == Step::Held {
				break;
			}
		}
	}

	/// Give one last try to every held head whose wait ran out.
	async fn expire(&mut self) {
		let now = Instant::now();
		let due: Vec<RecordKey> = self
			.held
			.iter()
			.filter(|(_, queue)| {
				queue
					.first()
					.is_some_and(|first| first.since + self.reorder_wait <= now)
			})
			.map(|(key, _)| key.clone())
			.collect();
		for key in due {
			if let Some(held) = self.take_first(&key) {
				self.attempt(held, false).await;
				self.release(&key).await;
			}
		}
	}

	/// Process a delivery once. When it is blocked on an earlier event it is held if
	/// `patient`, otherwise given up on.
	async fn attempt(&mut self, mut held: Held, patient: bool) -> Step {
		held.attempts += 1;
		match self.process(&held.delivery).await {
			Outcome::Applied => {
				let key = held.delivery.event.key().clone();
				let watermark = held.delivery.watermark;
				self.applied
					.entry(key)
					.and_modify(|w| *w = (*w).max(watermark))
					.or_insert(watermark);
				self.complete(&held.delivery).await;
				Step::Applied
			}
			Outcome::Settled => {
				self.complete(&held.delivery).await;
				Step::Settled
			}
			Outcome::Blocked(failure) if patient && !self.applied_after(&held.delivery) => {
				debug!(
					key = %held.delivery.event.key(),
					watermark = %held.delivery.watermark,
					kind = failure.kind(),
					"Holding {} until an earlier event for the key is applied",
					held.delivery.event.kind()
				);
				self.hold(held);
				Step::Held
			}
			Outcome::Blocked(failure) => {
				self.give_up(&held, failure).await;
				self.complete(&held.delivery).await;
				Step::Settled
			}
		}
	}

	/// An owner mismatch with nothing later applied for the key is a real rejection.
	/// Anything else means an event was lost to ordering and must stay recoverable.
	async fn give_up(&self, held: &Held, failure: Failure) {
		let delivery = &held.delivery;
		let key = delivery.event.key();
		match failure {
			Failure::Store(e @ StoreError::Unauthorized { .. }) if !self.applied_after(delivery) => {
				error!(
					%key,
					watermark = %delivery.watermark,
					kind = e.kind(),
					"Rejected {}: {}",
					delivery.event.kind(),
					e
				)
			}
			failure => {
				self.dead_letter(delivery, held.attempts, failure.to_string())
					.await
			}
		}
	}

	async fn process(&self, delivery: &Delivery) -> Outcome {
		let attempts = AtomicU32::new(0);
		let attempts_ref = &attempts;
		let max_attempts = self.retry.max_attempts;
		let resolver = &self.resolver;
		let writer = &self.writer;

		let result = retry(self.retry.backoff(), || async move {
			let attempt = attempts_ref.fetch_add(1, Ordering::Relaxed) + 1;
			apply(resolver, writer, delivery).await.map_err(|failure| {
				if failure.is_transient() && attempt < max_attempts {
					warn!(
						shard = self.shard,
						key = %delivery.event.key(),
						attempt,
						kind = failure.kind(),
						"Write failed, retrying: {}",
						failure
					);
					backoff::Error::transient(failure)
				} else {
					backoff::Error::permanent(failure)
				}
			})
		})
		.await;

		let key = delivery.event.key();
		let failure = match result {
			Ok(record) => {
				debug!(
					shard = self.shard,
					%key,
					history = record.history.len(),
					"Applied {}",
					delivery.event.kind()
				);
				return Outcome::Applied;
			}
			Err(failure) if failure.awaits_earlier_event(&delivery.event) => {
				return Outcome::Blocked(failure);
			}
			Err(failure) => failure,
		};

		match failure {
			Failure::Store(e @ StoreError::NoOp(_)) => {
				debug!(%key, watermark = %delivery.watermark, kind = e.kind(), "{} already applied", delivery.event.kind())
			}
			Failure::Store(
				e @ (StoreError::AlreadyExists(_) | StoreError::NotFound(_) | StoreError::Validation(_)),
			) => {
				info!(%key, watermark = %delivery.watermark, kind = e.kind(), "Skipped {}: {}", delivery.event.kind(), e)
			}
			failure => {
				let attempts = match &failure {
					Failure::Resolve(ResolveError::Exhausted { attempts, .. }) => *attempts,
					_ => attempts.load(Ordering::Relaxed),
				};
				self.dead_letter(delivery, attempts, failure.to_string())
					.await;
			}
		}
		Outcome::Settled
	}

	async fn dead_letter(&self, delivery: &Delivery, attempts: u32, last_error: String) {
		let letter = DeadLetter {
			subscription: self.trackers[delivery.subscription]
				.subscription()
				.to_string(),
			watermark: delivery.watermark,
			raw: delivery.raw.clone(),
			event: Some(delivery.event.clone()),
			attempts,
			last_error,
			dead_lettered_at: chrono::Utc::now(),
		};
		if let Err(e) = self.dead_letters.push(letter).await {
			error!(key = %delivery.event.key(), "Failed to record dead letter: {}", e);
		}
	}

	async fn complete(&self, delivery: &Delivery) {
		self.trackers[delivery.subscription]
			.complete(delivery.watermark)
			.await;
	}

	fn applied_after(&self, delivery: &Delivery) -> bool {
		self.applied
			.get(delivery.event.key())
			.is_some_and(|applied| *applied > delivery.watermark)
	}

	fn hold(&mut self, held: Held) {
		let queue = self
			.held
			.entry(held.delivery.event.key().clone())
			.or_default();
		let at = queue.partition_point(|h| h.delivery.watermark < held.delivery.watermark);
		queue.insert(at, held);
	}

	fn take_first(&mut self, key: &RecordKey) -> Option<Held> {
		let queue = self.held.get_mut(key)?;
		let first = if queue.is_empty() {
			None
		} else {
			Some(queue.remove(0))
		};
		if queue.is_empty() {
			self.held.remove(key);
		}
		first
	}

	fn next_deadline(&self) -> Option<Instant> {
		self.held
			.values()
			.filter_map(|queue| queue.first())
			.map(|first| first.since + self.reorder_wait)
			.min()
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

async fn apply(
	resolver: &StateResolver,
	writer: &StoreWriter,
	delivery: &Delivery,
) -> Result<LedgerRecord, Failure> {
	let request = resolver.resolve(&delivery.event).await?;
	Ok(writer.apply(request).await?)
}

pub struct SyncCoordinator;

impl SyncCoordinator {
	/// Start every subscription and shard worker.
	///
	/// Fails if the store cannot be read or any subscription cannot be opened; once
	/// running, transport errors only trigger reconnects.
	pub async fn start(
		chain: Arc<dyn ChainSource>,
		writer: Arc<StoreWriter>,
		watermarks: Arc<dyn WatermarkRepository>,
		dead_letters: Arc<DeadLetterQueue>,
		settings: SyncSettings,
	) -> Result<SyncHandle, SyncError> {
		let decoder = Arc::new(EventDecoder::new(&settings.topics));
		let resolver = Arc::new(StateResolver::new(
			chain.clone(),
			writer.clone(),
			settings.contract.clone(),
			settings.read_retry,
		));

		let subscriptions = settings.topics.subscriptions();
		let mut trackers = Vec::with_capacity(subscriptions.len());
		for (name, _) in &subscriptions {
			trackers.push(Arc::new(
				WatermarkTracker::load(*name, watermarks.clone()).await?,
			));
		}
		let trackers = Arc::new(trackers);

		let shards = settings.shards.max(1);
		let mut senders = Vec::with_capacity(shards);
		let mut workers = Vec::with_capacity(shards);
		for shard in 0..shards {
			let (sender, queue) = mpsc::channel(settings.queue_capacity.max(1));
			senders.push(sender);
			let worker = ShardWorker {
				shard,
				queue,
				resolver: resolver.clone(),
				writer: writer.clone(),
				trackers: trackers.clone(),
				dead_letters: dead_letters.clone(),
				retry: settings.write_retry,
				reorder_wait: settings.reorder_wait,
				held: HashMap::new(),
				applied: HashMap::new(),
			};
			workers.push(tokio::spawn(worker.run()));
		}
		let router = ShardRouter {
			senders: Arc::new(senders),
		};

		let (shutdown, shutdown_rx) = watch::channel(false);
		let mut pending = Vec::with_capacity(subscriptions.len());
		let mut states = Vec::with_capacity(subscriptions.len());
		for (index, (name, topic)) in subscriptions.into_iter().enumerate() {
			let (state, state_rx) = watch::channel(SubscriptionState::Disconnected);
			let subscription = Subscription {
				index,
				name,
				topic,
				contract: settings.contract.clone(),
				chain: chain.clone(),
				decoder: decoder.clone(),
				tracker: trackers[index].clone(),
				router: router.clone(),
				reconnect: settings.reconnect,
				state,
			};
			let stream = subscription
				.connect()
				.await
				.map_err(|source| SyncError::Subscribe {
					subscription: name,
					source,
				})?;
			pending.push((subscription, stream));
			states.push((name, state_rx));
		}

		let tasks = pending
			.into_iter()
			.map(|(subscription, stream)| tokio::spawn(subscription.run(stream, shutdown_rx.clone())))
			.collect();

		info!(
			"Sync started with {} subscriptions and {} shards",
			states.len(),
			shards
		);
		Ok(SyncHandle {
			shutdown,
			subscriptions: tasks,
			workers,
			states,
			trackers,
			dead_letters,
		})
	}
}

/// Control handle of a running coordinator.
pub struct SyncHandle {
	shutdown: watch::Sender<bool>,
	subscriptions: Vec<JoinHandle<()>>,
	workers: Vec<JoinHandle<()>>,
	states: Vec<(&'static str, watch::Receiver<SubscriptionState>)>,
	trackers: Arc<Vec<Arc<WatermarkTracker>>>,
	dead_letters: Arc<DeadLetterQueue>,
}

impl SyncHandle {
	pub fn states(&self) -> Vec<(&'static str, SubscriptionState)> {
		self.states
			.iter()
			.map(|(name, rx)| (*name, *rx.borrow()))
			.collect()
	}

	pub fn state_changes(&self, subscription: &str) -> Option<watch::Receiver<SubscriptionState>> {
		self.states
			.iter()
			.find(|(name, _)| *name == subscription)
			.map(|(_, rx)| rx.clone())
	}

	pub async fn committed(&self, subscription: &str) -> Option<Watermark> {
		match self
			.trackers
			.iter()
			.find(|tracker| tracker.subscription() == subscription)
		{
			Some(tracker) => tracker.committed().await,
			None => None,
		}
	}

	pub async fn dead_letters(&self) -> Vec<DeadLetter> {
		self.dead_letters.entries().await
	}

	/// Stop reading, drain every shard queue, and wait for the workers.
	pub async fn shutdown(self) {
		info!("Shutting down sync");
		self.shutdown.send_replace(true);
		for task in self.subscriptions {
			if let Err(e) = task.await {
				error!("Subscription task failed: {}", e);
			}
		}
		// The subscription tasks held the last shard senders
		for worker in self.workers {
			if let Err(e) = worker.await {
				error!("Shard worker failed: {}", e);
			}
		}
		info!("Sync stopped");
	}
}
