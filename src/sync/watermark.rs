//! Acknowledged positions per subscription.
//!
//! A subscription dispatches logs in chain order but shard workers complete them in
//! any order. The tracker only advances the acknowledged watermark across a
//! contiguous prefix of completed positions, so resuming from it never skips a log
//! that was still being worked on.

use crate::chain::Watermark;
use crate::ledger::StoreError;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

/// Repository for acknowledged watermarks
#[async_trait::async_trait]
pub trait WatermarkRepository: Send + Sync {
	async fn save(&self, subscription: &str, watermark: Watermark) -> Result<(), StoreError>;
	async fn load(&self, subscription: &str) -> Result<Option<Watermark>, StoreError>;
}

/// File-based implementation of WatermarkRepository
pub struct FileWatermarkRepository {
	dir: PathBuf,
}

impl FileWatermarkRepository {
	pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
		let dir = data_dir.as_ref().join("watermarks");
		tokio::fs::create_dir_all(&dir).await?;
		Ok(Self { dir })
	}

	fn filename(&self, subscription: &str) -> PathBuf {
		self.dir.join(format!("{}.json", subscription))
	}
}

#[async_trait::async_trait]
impl WatermarkRepository for FileWatermarkRepository {
	async fn save(&self, subscription: &str, watermark: Watermark) -> Result<(), StoreError> {
		let metadata = serde_json::json!({
			"subscription": subscription,
			"block_number": watermark.block_number,
			"log_index": watermark.log_index,
			"timestamp": chrono::Utc::now().to_rfc3339(),
		});

		let filename = self.filename(subscription);
		let tmp_filename = filename.with_extension("json.tmp");
		tokio::fs::write(&tmp_filename, serde_json::to_vec_pretty(&metadata)?).await?;
		tokio::fs::rename(&tmp_filename, &filename).await?;
		Ok(())
	}

	async fn load(&self, subscription: &str) -> Result<Option<Watermark>, StoreError> {
		let content = match tokio::fs::read_to_string(self.filename(subscription)).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let watermark: Watermark = serde_json::from_str(&content)?;
		info!("Loaded watermark {} for {}", watermark, subscription);
		Ok(Some(watermark))
	}
}

/// In-memory implementation of WatermarkRepository
#[derive(Default)]
pub struct MemoryWatermarkRepository {
	watermarks: RwLock<HashMap<String, Watermark>>,
}

impl MemoryWatermarkRepository {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl WatermarkRepository for MemoryWatermarkRepository {
	async fn save(&self, subscription: &str, watermark: Watermark) -> Result<(), StoreError> {
		self.watermarks
			.write()
			.await
			.insert(subscription.to_string(), watermark);
		Ok(())
	}

	async fn load(&self, subscription: &str) -> Result<Option<Watermark>, StoreError> {
		Ok(self.watermarks.read().await.get(subscription).copied())
	}
}

#[derive(Debug, Default)]
struct TrackerState {
	in_flight: BTreeSet<Watermark>,
	finished: BTreeSet<Watermark>,
	committed: Option<Watermark>,
}

impl TrackerState {
	/// Move `committed` over every finished position below the oldest one in flight.
	fn advance(&mut self) -> bool {
		let floor = self.in_flight.first().copied();
		let mut advanced = false;
		while let Some(&next) = self.finished.first() {
			if floor.is_some_and(|f| next > f) {
				break;
			}
			self.finished.pop_first();
			if self.committed.is_none_or(|c| next > c) {
				self.committed = Some(next);
				advanced = true;
			}
		}
		advanced
	}
}

/// Tracks dispatched and completed positions for one subscription.
pub struct WatermarkTracker {
	subscription: String,
	state: Mutex<TrackerState>,
	in_flight: watch::Sender<usize>,
	repo: Arc<dyn WatermarkRepository>,
}

impl WatermarkTracker {
	/// Restore the tracker from the last persisted watermark.
	pub async fn load(
		subscription: impl Into<String>,
		repo: Arc<dyn WatermarkRepository>,
	) -> Result<Self, StoreError> {
		let subscription = subscription.into();
		let committed = repo.load(&subscription).await?;
		let (in_flight, _) = watch::channel(0);
		Ok(Self {
			subscription,
			state: Mutex::new(TrackerState {
				committed,
				..TrackerState::default()
			}),
			in_flight,
			repo,
		})
	}

	pub fn subscription(&self) -> &str {
		&self.subscription
	}

	pub async fn committed(&self) -> Option<Watermark> {
		self.state.lock().await.committed
	}

	/// Register a dispatched position. Returns false when the position is already
	/// in flight or already done, in which case it must not be dispatched again.
	pub async fn begin(&self, watermark: Watermark) -> bool {
		let mut state = self.state.lock().await;
		if state.committed.is_some_and(|c| watermark <= c)
			|| state.finished.contains(&watermark)
			|| !state.in_flight.insert(watermark)
		{
			debug!(
				subscription = %self.subscription,
				%watermark,
				"Skipping duplicate delivery"
			);
			return false;
		}
		self.in_flight.send_replace(state.in_flight.len());
		true
	}

	/// Mark a position done (applied, rejected, dropped or dead-lettered).
	pub async fn complete(&self, watermark: Watermark) {
		let mut state = self.state.lock().await;
		if !state.in_flight.remove(&watermark) {
			return;
		}
		state.finished.insert(watermark);
		if state.advance() {
			if let Some(committed) = state.committed {
				// Persisting under the lock keeps saves in watermark order
				if let Err(e) = self.repo.save(&self.subscription, committed).await {
					warn!(
						subscription = %self.subscription,
						"Failed to persist watermark {}: {}",
						committed,
						e
					);
				}
			}
		}
		self.in_flight.send_replace(state.in_flight.len());
	}

	/// Wait until nothing dispatched by this subscription is still in flight.
	pub async fn settled(&self) {
		let mut rx = self.in_flight.subscribe();
		let _ = rx.wait_for(|count| *count == 0).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn w(block: u64, index: u64) -> Watermark {
		Watermark::new(block, index)
	}

	async fn tracker(repo: Arc<dyn WatermarkRepository>) -> WatermarkTracker {
		WatermarkTracker::load("value_changed", repo).await.unwrap()
	}

	#[tokio::test]
	async fn commits_only_a_contiguous_prefix() {
		let repo = Arc::new(MemoryWatermarkRepository::new());
		let tracker = tracker(repo.clone()).await;
		for position in [w(1, 0), w(1, 1), w(2, 0)] {
			assert!(tracker.begin(position).await);
		}

		tracker.complete(w(1, 1)).await;
		assert_eq!(tracker.committed().await, None);

		tracker.complete(w(1, 0)).await;
		assert_eq!(tracker.committed().await, Some(w(1, 1)));
		assert_eq!(repo.load("value_changed").await.unwrap(), Some(w(1, 1)));

		tracker.complete(w(2, 0)).await;
		assert_eq!(tracker.committed().await, Some(w(2, 0)));
	}

	#[tokio::test]
	async fn duplicates_are_refused() {
		let tracker = tracker(Arc::new(MemoryWatermarkRepository::new())).await;
		assert!(tracker.begin(w(5, 0)).await);
		assert!(!tracker.begin(w(5, 0)).await);

		tracker.complete(w(5, 0)).await;
		assert!(!tracker.begin(w(5, 0)).await);
		assert!(!tracker.begin(w(4, 9)).await);
		assert!(tracker.begin(w(5, 1)).await);
	}

	#[tokio::test]
	async fn settled_waits_for_in_flight_work() {
		let tracker = Arc::new(tracker(Arc::new(MemoryWatermarkRepository::new())).await);
		tracker.settled().await;

		tracker.begin(w(1, 0)).await;
		let waiter = tokio::spawn({
			let tracker = tracker.clone();
			async move { tracker.settled().await }
		});
		tokio::task::yield_now().await;
		assert!(!waiter.is_finished());

		tracker.complete(w(1, 0)).await;
		waiter.await.unwrap();
	}

	#[tokio::test]
	async fn file_repository_restores_committed_position() {
		let dir = tempfile::tempdir().unwrap();
		let repo = Arc::new(FileWatermarkRepository::open(dir.path()).await.unwrap());
		let first = tracker(repo.clone()).await;
		first.begin(w(7, 3)).await;
		first.complete(w(7, 3)).await;

		let reopened = Arc::new(FileWatermarkRepository::open(dir.path()).await.unwrap());
		let restored = tracker(reopened).await;
		assert_eq!(restored.committed().await, Some(w(7, 3)));
		assert!(!restored.begin(w(7, 3)).await);
	}
}
