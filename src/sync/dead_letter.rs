//! Parking lot for events that exhausted their retries.

use super::events::DomainEvent;
use crate::chain::{RawLog, Watermark};
use crate::ledger::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

/// A failed event with enough context to inspect and replay it by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
	pub subscription: String,
	pub watermark: Watermark,
	pub raw: RawLog,
	pub event: Option<DomainEvent>,
	pub attempts: u32,
	pub last_error: String,
	pub dead_lettered_at: DateTime<Utc>,
}

/// Append-only dead-letter log: a JSON-lines file plus an in-memory mirror.
pub struct DeadLetterQueue {
	path: Option<PathBuf>,
	entries: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterQueue {
	pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
		tokio::fs::create_dir_all(data_dir.as_ref()).await?;
		let path = data_dir.as_ref().join("dead_letters.jsonl");
		let entries = read_entries(&path).await?;
		Ok(Self {
			path: Some(path),
			entries: Mutex::new(entries),
		})
	}

	pub fn in_memory() -> Self {
		Self {
			path: None,
			entries: Mutex::new(Vec::new()),
		}
	}

	pub async fn push(&self, letter: DeadLetter) -> Result<(), StoreError> {
		error!(
			subscription = %letter.subscription,
			watermark = %letter.watermark,
			attempts = letter.attempts,
			event = ?letter.event,
			"Dead-lettered event: {}",
			letter.last_error
		);

		let mut entries = self.entries.lock().await;
		if let Some(path) = &self.path {
			let mut line = serde_json::to_vec(&letter)?;
			line.push(b'\n');
			let mut file = tokio::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)
				.await?;
			file.write_all(&line).await?;
			file.flush().await?;
		}
		entries.push(letter);
		Ok(())
	}

	pub async fn entries(&self) -> Vec<DeadLetter> {
		self.entries.lock().await.clone()
	}
}

/// Read every dead letter stored under `data_dir` without opening the queue for writes.
pub async fn read_dead_letters(data_dir: impl AsRef<Path>) -> Result<Vec<DeadLetter>, StoreError> {
	read_entries(&data_dir.as_ref().join("dead_letters.jsonl")).await
}

async fn read_entries(path: &Path) -> Result<Vec<DeadLetter>, StoreError> {
	let content = match tokio::fs::read_to_string(path).await {
		Ok(content) => content,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(e.into()),
	};
	content
		.lines()
		.filter(|line| !line.trim().is_empty())
		.map(|line| serde_json::from_str(line).map_err(StoreError::from))
		.collect()
}
