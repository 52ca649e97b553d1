//! Store writer: the only component that mutates durable records.
//!
//! Every mutation for a key runs under that key's async mutex, so load, check and
//! save are linearized per key while distinct keys proceed in parallel. Ownership is
//! re-validated against the stored owner at write time, and writes that would not
//! change the stored `{value, annotation}` pair come back as `NoOp` without touching
//! history.

use super::clock::{Clock, SystemClock};
use super::error::StoreError;
use super::record::{
	HistoryEntry, LedgerRecord, Mood, Owner, Page, Pagination, RecordKey, RecordSummary,
	Snapshot, validate_annotation,
};
use super::repository::RecordRepository;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// New value from a `ValueChanged` event, merged with the read-back annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueUpdate {
	pub key: RecordKey,
	pub owner: Owner,
	pub value: Mood,
	/// Annotation to write alongside; `None` keeps the stored one.
	pub annotation: Option<String>,
	/// Store state the update was resolved against.
	pub expected: Option<Snapshot>,
}

/// New annotation from an `AnnotationChanged` event, merged with the read-back value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationUpdate {
	pub key: RecordKey,
	pub owner: Owner,
	pub annotation: String,
	/// Value to write alongside; `None` keeps the stored one.
	pub value: Option<Mood>,
	pub expected: Option<Snapshot>,
}

/// A fully resolved mutation, ready for the writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteRequest {
	Create {
		key: RecordKey,
		owner: Owner,
		value: Mood,
	},
	UpdateValue(ValueUpdate),
	UpdateAnnotation(AnnotationUpdate),
	Transfer {
		key: RecordKey,
		from: Owner,
		to: Owner,
	},
}

impl WriteRequest {
	pub fn key(&self) -> &RecordKey {
		match self {
			WriteRequest::Create { key, .. } | WriteRequest::Transfer { key, .. } => key,
			WriteRequest::UpdateValue(update) => &update.key,
			WriteRequest::UpdateAnnotation(update) => &update.key,
		}
	}
}

type KeyLocks = Mutex<HashMap<RecordKey, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one key. The key's lock leaves the map once nobody else holds
/// or waits on it.
struct KeyGuard<'a> {
	guard: Option<OwnedMutexGuard<()>>,
	key: RecordKey,
	locks: &'a KeyLocks,
}

impl Drop for KeyGuard<'_> {
	fn drop(&mut self) {
		drop(self.guard.take());
		let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
		if locks
			.get(&self.key)
			.is_some_and(|lock| Arc::strong_count(lock) == 1)
		{
			locks.remove(&self.key);
		}
	}
}

pub struct StoreWriter {
	repo: Arc<dyn RecordRepository>,
	clock: Arc<dyn Clock>,
	locks: KeyLocks,
}

impl StoreWriter {
	pub fn new(repo: Arc<dyn RecordRepository>) -> Self {
		Self::with_clock(repo, Arc::new(SystemClock))
	}

	pub fn with_clock(repo: Arc<dyn RecordRepository>, clock: Arc<dyn Clock>) -> Self {
		Self {
			repo,
			clock,
			locks: Mutex::new(HashMap::new()),
		}
	}

	async fn lock_key(&self, key: &RecordKey) -> KeyGuard<'_> {
		let lock = self
			.locks
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.entry(key.clone())
			.or_default()
			.clone();
		KeyGuard {
			guard: Some(lock.lock_owned().await),
			key: key.clone(),
			locks: &self.locks,
		}
	}

	pub async fn create(
		&self,
		key: RecordKey,
		owner: Owner,
		value: Mood,
	) -> Result<LedgerRecord, StoreError> {
		let _guard = self.lock_key(&key).await;
		if self.repo.load(&key).await?.is_some() {
			return Err(StoreError::AlreadyExists(key));
		}

		let record = LedgerRecord::new(key, owner, value, self.clock.now());
		self.repo.save(&record).await?;
		info!(
			key = %record.key,
			owner = %record.owner,
			mood = record.value.name(),
			"Created record"
		);
		Ok(record)
	}

	pub async fn update_value(&self, update: ValueUpdate) -> Result<LedgerRecord, StoreError> {
		if let Some(annotation) = &update.annotation {
			validate_annotation(annotation)?;
		}
		let ValueUpdate {
			key,
			owner,
			value,
			annotation,
			expected,
		} = update;
		self.mutate(key, owner, expected, |stored| Snapshot {
			value,
			annotation: annotation.unwrap_or_else(|| stored.annotation.clone()),
		})
		.await
	}

	pub async fn update_annotation(
		&self,
		update: AnnotationUpdate,
	) -> Result<LedgerRecord, StoreError> {
		validate_annotation(&update.annotation)?;
		let AnnotationUpdate {
			key,
			owner,
			annotation,
			value,
			expected,
		} = update;
		self.mutate(key, owner, expected, |stored| Snapshot {
			value: value.unwrap_or(stored.value),
			annotation,
		})
		.await
	}

	/// Shared path of both update operations.
	///
	/// Check order: existence, ownership, idempotency, then the resolve-time snapshot.
	async fn mutate(
		&self,
		key: RecordKey,
		owner: Owner,
		expected: Option<Snapshot>,
		merge: impl FnOnce(&LedgerRecord) -> Snapshot,
	) -> Result<LedgerRecord, StoreError> {
		let _guard = self.lock_key(&key).await;
		let mut record = self
			.repo
			.load(&key)
			.await?
			.ok_or_else(|| StoreError::NotFound(key.clone()))?;

		if record.owner != owner {
			return Err(StoreError::Unauthorized {
				key,
				stored: record.owner,
				presented: owner,
			});
		}

		let next = merge(&record);
		if next == record.snapshot() {
			return Err(StoreError::NoOp(key));
		}
		if expected.is_some_and(|snapshot| snapshot != record.snapshot()) {
			return Err(StoreError::Conflict { key });
		}

		let at = record.transition(next, self.clock.now());
		self.repo.save(&record).await?;
		info!(
			key = %record.key,
			mood = record.value.name(),
			history = record.history.len(),
			%at,
			"Updated record"
		);
		Ok(record)
	}

	/// Move a record to a new owner; history and `updated_at` are left alone.
	pub async fn transfer(
		&self,
		key: RecordKey,
		from: Owner,
		to: Owner,
	) -> Result<LedgerRecord, StoreError> {
		let _guard = self.lock_key(&key).await;
		let mut record = self
			.repo
			.load(&key)
			.await?
			.ok_or_else(|| StoreError::NotFound(key.clone()))?;

		if record.owner == to {
			return Err(StoreError::NoOp(key));
		}
		if record.owner != from {
			return Err(StoreError::Unauthorized {
				key,
				stored: record.owner,
				presented: from,
			});
		}

		record.owner = to;
		self.repo.save(&record).await?;
		info!(key = %record.key, %from, to = %record.owner, "Transferred record");
		Ok(record)
	}

	pub async fn apply(&self, request: WriteRequest) -> Result<LedgerRecord, StoreError> {
		debug!(key = %request.key(), "Applying {:?}", request);
		match request {
			WriteRequest::Create { key, owner, value } => self.create(key, owner, value).await,
			WriteRequest::UpdateValue(update) => self.update_value(update).await,
			WriteRequest::UpdateAnnotation(update) => self.update_annotation(update).await,
			WriteRequest::Transfer { key, from, to } => self.transfer(key, from, to).await,
		}
	}

	pub async fn get(&self, key: &RecordKey) -> Result<Option<LedgerRecord>, StoreError> {
		self.repo.load(key).await
	}

	pub async fn get_history(&self, key: &RecordKey) -> Result<Vec<HistoryEntry>, StoreError> {
		self.repo
			.load(key)
			.await?
			.map(|record| record.history)
			.ok_or_else(|| StoreError::NotFound(key.clone()))
	}

	/// Summaries ordered by `updated_at`, newest first.
	pub async fn list(&self, pagination: Pagination) -> Result<Page<RecordSummary>, StoreError> {
		let mut records = self.repo.load_all().await?;
		records.sort_by(|a, b| {
			b.updated_at
				.cmp(&a.updated_at)
				.then_with(|| a.key.cmp(&b.key))
		});
		Ok(paginate(records, pagination))
	}

	/// One owner's records, most recently created first.
	pub async fn list_by_owner(
		&self,
		owner: &Owner,
		pagination: Pagination,
	) -> Result<Page<RecordSummary>, StoreError> {
		let mut records: Vec<_> = self
			.repo
			.load_all()
			.await?
			.into_iter()
			.filter(|record| &record.owner == owner)
			.collect();
		records.sort_by(|a, b| {
			b.created_at
				.cmp(&a.created_at)
				.then_with(|| a.key.cmp(&b.key))
		});
		Ok(paginate(records, pagination))
	}
}

fn paginate(records: Vec<LedgerRecord>, pagination: Pagination) -> Page<RecordSummary> {
	Page {
		total: records.len(),
		items: records
			.iter()
			.skip(pagination.skip)
			.take(pagination.limit)
			.map(LedgerRecord::summary)
			.collect(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::clock::ManualClock;
	use crate::ledger::repository::MemoryRecordRepository;
	use chrono::{DateTime, Duration, TimeZone, Utc};

	fn t(minute: u32) -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap()
	}

	fn key(k: &str) -> RecordKey {
		RecordKey::new(k).unwrap()
	}

	fn owner(o: &str) -> Owner {
		Owner::parse(o).unwrap()
	}

	fn mood(m: u8) -> Mood {
		Mood::new(m).unwrap()
	}

	fn writer() -> (StoreWriter, Arc<ManualClock>) {
		let clock = Arc::new(ManualClock::new(t(0)));
		let writer = StoreWriter::with_clock(Arc::new(MemoryRecordRepository::new()), clock.clone());
		(writer, clock)
	}

	fn value_update(k: &str, o: &str, m: u8) -> ValueUpdate {
		ValueUpdate {
			key: key(k),
			owner: owner(o),
			value: mood(m),
			annotation: None,
			expected: None,
		}
	}

	fn annotation_update(k: &str, o: &str, a: &str) -> AnnotationUpdate {
		AnnotationUpdate {
			key: key(k),
			owner: owner(o),
			annotation: a.to_string(),
			value: None,
			expected: None,
		}
	}

	#[tokio::test]
	async fn create_then_update_appends_pre_mutation_state() {
		let (writer, clock) = writer();
		let created = writer.create(key("7"), owner("0xAA"), mood(0)).await.unwrap();
		assert_eq!(
			created.history,
			vec![HistoryEntry {
				value: mood(0),
				annotation: String::new(),
				timestamp: t(0),
			}]
		);

		clock.set(t(1));
		let updated = writer.update_value(value_update("7", "0xAA", 5)).await.unwrap();

		assert_eq!(updated.value, mood(5));
		assert_eq!(updated.updated_at, t(1));
		assert_eq!(updated.created_at, t(0));
		assert_eq!(
			updated.history,
			vec![
				HistoryEntry {
					value: mood(0),
					annotation: String::new(),
					timestamp: t(0),
				},
				HistoryEntry {
					value: mood(0),
					annotation: String::new(),
					timestamp: t(1),
				},
			]
		);
	}

	#[tokio::test]
	async fn duplicate_create_leaves_original_untouched() {
		let (writer, clock) = writer();
		let original = writer.create(key("7"), owner("0xaa"), mood(0)).await.unwrap();

		clock.set(t(5));
		let err = writer
			.create(key("7"), owner("0xbb"), mood(4))
			.await
			.unwrap_err();

		assert!(matches!(err, StoreError::AlreadyExists(_)));
		assert_eq!(writer.get(&key("7")).await.unwrap(), Some(original));
	}

	#[tokio::test]
	async fn history_grows_only_on_genuine_change() {
		let (writer, clock) = writer();
		writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();

		let mut genuine = 0;
		for (minute, m) in [(1, 2), (2, 2), (3, 4), (4, 4), (5, 0)] {
			clock.set(t(minute));
			match writer.update_value(value_update("1", "0xaa", m)).await {
				Ok(_) => genuine += 1,
				Err(StoreError::NoOp(_)) => {}
				Err(e) => panic!("unexpected error {e}"),
			}
		}
		for a in ["hi", "hi", "there"] {
			match writer.update_annotation(annotation_update("1", "0xaa", a)).await {
				Ok(_) => genuine += 1,
				Err(StoreError::NoOp(_)) => {}
				Err(e) => panic!("unexpected error {e}"),
			}
		}

		assert_eq!(genuine, 5);
		assert_eq!(writer.get_history(&key("1")).await.unwrap().len(), 1 + genuine);
	}

	#[tokio::test]
	async fn redelivered_update_is_noop() {
		let (writer, clock) = writer();
		writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();
		clock.set(t(1));
		let first = writer.update_value(value_update("1", "0xaa", 3)).await.unwrap();

		clock.set(t(2));
		let second = writer.update_value(value_update("1", "0xaa", 3)).await;

		assert!(matches!(second, Err(StoreError::NoOp(_))));
		let stored = writer.get(&key("1")).await.unwrap().unwrap();
		assert_eq!(stored, first);
		assert_eq!(stored.updated_at, t(1));
	}

	#[tokio::test]
	async fn non_owner_cannot_mutate() {
		let (writer, _) = writer();
		let original = writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();

		let by_value = writer.update_value(value_update("1", "0xbb", 3)).await;
		let by_annotation = writer
			.update_annotation(annotation_update("1", "0xbb", "mine now"))
			.await;

		assert!(matches!(by_value, Err(StoreError::Unauthorized { .. })));
		assert!(matches!(by_annotation, Err(StoreError::Unauthorized { .. })));
		assert_eq!(writer.get(&key("1")).await.unwrap(), Some(original));
	}

	#[tokio::test]
	async fn owner_comparison_ignores_case() {
		let (writer, _) = writer();
		writer.create(key("1"), owner("0xAbC"), mood(0)).await.unwrap();
		assert!(writer.update_value(value_update("1", "0xABC", 1)).await.is_ok());
	}

	#[tokio::test]
	async fn update_of_missing_key_creates_nothing() {
		let (writer, _) = writer();
		let err = writer
			.update_value(value_update("9", "0xaa", 1))
			.await
			.unwrap_err();

		assert!(matches!(err, StoreError::NotFound(_)));
		assert_eq!(writer.get(&key("9")).await.unwrap(), None);
		assert!(writer.list(Pagination::default()).await.unwrap().items.is_empty());
	}

	#[tokio::test]
	async fn timestamps_never_go_backwards() {
		let (writer, clock) = writer();
		clock.set(t(10));
		writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();

		clock.set(t(5));
		writer.update_value(value_update("1", "0xaa", 1)).await.unwrap();
		clock.set(t(20));
		writer.update_value(value_update("1", "0xaa", 2)).await.unwrap();
		clock.set(t(15));
		let record = writer.update_value(value_update("1", "0xaa", 3)).await.unwrap();

		let stamps: Vec<_> = record.history.iter().map(|h| h.timestamp).collect();
		assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
		assert_eq!(record.updated_at, *stamps.last().unwrap());
		assert_eq!(record.updated_at, t(20));
	}

	#[tokio::test]
	async fn merged_update_writes_both_fields() {
		let (writer, _) = writer();
		writer.create(key("3"), owner("0xbb"), mood(2)).await.unwrap();

		let record = writer
			.update_annotation(AnnotationUpdate {
				value: Some(mood(6)),
				..annotation_update("3", "0xbb", "hi")
			})
			.await
			.unwrap();

		assert_eq!(record.value, mood(6));
		assert_eq!(record.annotation, "hi");
		assert_eq!(record.history.len(), 2);
	}

	#[tokio::test]
	async fn stale_snapshot_is_a_conflict() {
		let (writer, _) = writer();
		let created = writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();
		let resolved_against = created.snapshot();
		writer
			.update_annotation(annotation_update("1", "0xaa", "racing write"))
			.await
			.unwrap();

		let err = writer
			.update_value(ValueUpdate {
				annotation: Some(String::new()),
				expected: Some(resolved_against),
				..value_update("1", "0xaa", 7)
			})
			.await
			.unwrap_err();

		assert!(matches!(err, StoreError::Conflict { .. }));
		assert!(err.is_transient());
		assert_eq!(writer.get_history(&key("1")).await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn oversized_annotation_is_rejected() {
		let (writer, _) = writer();
		writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();

		let err = writer
			.update_annotation(annotation_update("1", "0xaa", &"x".repeat(201)))
			.await
			.unwrap_err();

		assert!(matches!(err, StoreError::Validation(_)));
		assert!(!err.is_transient());
	}

	#[tokio::test]
	async fn transfer_moves_owner_without_history() {
		let (writer, clock) = writer();
		writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();
		clock.advance(Duration::minutes(3));

		let moved = writer
			.transfer(key("1"), owner("0xaa"), owner("0xbb"))
			.await
			.unwrap();
		assert_eq!(moved.owner, owner("0xbb"));
		assert_eq!(moved.history.len(), 1);
		assert_eq!(moved.updated_at, t(0));

		let again = writer.transfer(key("1"), owner("0xaa"), owner("0xbb")).await;
		assert!(matches!(again, Err(StoreError::NoOp(_))));

		let stolen = writer.transfer(key("1"), owner("0xcc"), owner("0xdd")).await;
		assert!(matches!(stolen, Err(StoreError::Unauthorized { .. })));

		let old_owner = writer.update_value(value_update("1", "0xaa", 2)).await;
		assert!(matches!(old_owner, Err(StoreError::Unauthorized { .. })));
	}

	#[tokio::test]
	async fn listings_are_ordered_and_paged() {
		let (writer, clock) = writer();
		for (minute, k, o) in [(0, "1", "0xaa"), (1, "2", "0xbb"), (2, "3", "0xaa")] {
			clock.set(t(minute));
			writer.create(key(k), owner(o), mood(0)).await.unwrap();
		}
		clock.set(t(3));
		writer.update_value(value_update("1", "0xaa", 1)).await.unwrap();

		let page = writer.list(Pagination::default()).await.unwrap();
		let keys: Vec<_> = page.items.iter().map(|s| s.key.as_str()).collect();
		assert_eq!(keys, ["1", "3", "2"]);

		let second = writer.list(Pagination { limit: 1, skip: 1 }).await.unwrap();
		assert_eq!(second.total, 3);
		assert_eq!(second.items[0].key, key("3"));

		let mine = writer
			.list_by_owner(&owner("0xAA"), Pagination::default())
			.await
			.unwrap();
		let keys: Vec<_> = mine.items.iter().map(|s| s.key.as_str()).collect();
		assert_eq!(keys, ["3", "1"]);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_writes_to_one_key_are_linearized() {
		let (writer, _) = writer();
		let writer = Arc::new(writer);
		writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();

		let tasks: Vec<_> = (0..20u8)
			.map(|i| {
				let writer = writer.clone();
				tokio::spawn(async move {
					writer
						.update_annotation(annotation_update("1", "0xaa", &format!("note {i}")))
						.await
				})
			})
			.collect();
		let mut applied = 0;
		for task in tasks {
			if task.await.unwrap().is_ok() {
				applied += 1;
			}
		}

		assert_eq!(applied, 20);
		assert_eq!(writer.get_history(&key("1")).await.unwrap().len(), 21);
		assert!(writer.locks.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn key_locks_are_dropped_once_released() {
		let (writer, _) = writer();
		writer.create(key("1"), owner("0xaa"), mood(0)).await.unwrap();
		writer.create(key("2"), owner("0xaa"), mood(0)).await.unwrap();
		writer.update_value(value_update("1", "0xaa", 3)).await.unwrap();

		assert!(writer.locks.lock().unwrap().is_empty());

		let held = writer.lock_key(&key("1")).await;
		assert_eq!(writer.locks.lock().unwrap().len(), 1);
		drop(held);
		assert!(writer.locks.lock().unwrap().is_empty());
	}
}
