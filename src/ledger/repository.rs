use super::error::StoreError;
use super::record::{LedgerRecord, RecordKey};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Durable storage for ledger records.
///
/// Implementations only move whole records. Authorization, idempotency and
/// per-key serialization are the writer's job.
#[async_trait::async_trait]
pub trait RecordRepository: Send + Sync {
	async fn load(&self, key: &RecordKey) -> Result<Option<LedgerRecord>, StoreError>;
	/// Replace the stored record in a single atomic step.
	async fn save(&self, record: &LedgerRecord) -> Result<(), StoreError>;
	async fn load_all(&self) -> Result<Vec<LedgerRecord>, StoreError>;
}

/// File-based implementation of RecordRepository, one JSON document per key
pub struct FileRecordRepository {
	records_dir: PathBuf,
}

impl FileRecordRepository {
	pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
		let records_dir = data_dir.as_ref().join("records");
		tokio::fs::create_dir_all(&records_dir).await?;
		info!("Opened record store at {:?}", records_dir);
		Ok(Self { records_dir })
	}

	fn record_filename(&self, key: &RecordKey) -> PathBuf {
		self.records_dir.join(format!("{}.json", key))
	}
}

#[async_trait::async_trait]
impl RecordRepository for FileRecordRepository {
	async fn load(&self, key: &RecordKey) -> Result<Option<LedgerRecord>, StoreError> {
		let filename = self.record_filename(key);
		let content = match tokio::fs::read(&filename).await {
			Ok(content) => content,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		Ok(Some(serde_json::from_slice(&content)?))
	}

	async fn save(&self, record: &LedgerRecord) -> Result<(), StoreError> {
		let filename = self.record_filename(&record.key);
		let tmp_filename = filename.with_extension("json.tmp");

		// Readers only ever see the old or the new document
		let bytes = serde_json::to_vec_pretty(record)?;
		tokio::fs::write(&tmp_filename, &bytes).await?;
		tokio::fs::rename(&tmp_filename, &filename).await?;

		debug!(
			"Saved record {} ({} history entries) to {:?}",
			record.key,
			record.history.len(),
			filename
		);
		Ok(())
	}

	async fn load_all(&self) -> Result<Vec<LedgerRecord>, StoreError> {
		let mut records = Vec::new();
		let mut entries = tokio::fs::read_dir(&self.records_dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			if path.extension().and_then(|s| s.to_str()) != Some("json") {
				continue;
			}
			let content = tokio::fs::read(&path).await?;
			match serde_json::from_slice::<LedgerRecord>(&content) {
				Ok(record) => records.push(record),
				Err(e) => warn!("Skipping unreadable record file {:?}: {}", path, e),
			}
		}
		Ok(records)
	}
}

/// In-memory implementation of RecordRepository
#[derive(Default)]
pub struct MemoryRecordRepository {
	records: RwLock<HashMap<RecordKey, LedgerRecord>>,
}

impl MemoryRecordRepository {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl RecordRepository for MemoryRecordRepository {
	async fn load(&self, key: &RecordKey) -> Result<Option<LedgerRecord>, StoreError> {
		Ok(self.records.read().await.get(key).cloned())
	}

	async fn save(&self, record: &LedgerRecord) -> Result<(), StoreError> {
		self.records
			.write()
			.await
			.insert(record.key.clone(), record.clone());
		Ok(())
	}

	async fn load_all(&self) -> Result<Vec<LedgerRecord>, StoreError> {
		Ok(self.records.read().await.values().cloned().collect())
	}
}
