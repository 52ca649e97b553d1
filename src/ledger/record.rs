//! The durable record mirroring one on-chain token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of an annotation, in characters.
pub const MAX_ANNOTATION_CHARS: usize = 200;

/// Display names of the enumerated mood codes, indexed by code.
pub const MOOD_NAMES: [&str; 12] = [
	"Happy",
	"Sad",
	"Anger",
	"Fear",
	"Surprise",
	"Boredom",
	"Shame",
	"Determination",
	"Excitement",
	"Kawaii",
	"Sleepy",
	"Mischievous",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
	#[error("record key must be a decimal token id, got {0:?}")]
	InvalidKey(String),

	#[error("owner must not be empty")]
	EmptyOwner,

	#[error("mood {0} is outside 0..={max}", max = MOOD_NAMES.len() - 1)]
	MoodOutOfRange(u8),

	#[error("annotation is {len} characters, limit is {max}")]
	AnnotationTooLong { len: usize, max: usize },
}

/// Token id in canonical decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
	pub fn new(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
		let raw = raw.as_ref().trim();
		if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
			return Err(ValidationError::InvalidKey(raw.to_string()));
		}
		let canonical = raw.trim_start_matches('0');
		Ok(Self(if canonical.is_empty() {
			"0".to_string()
		} else {
			canonical.to_string()
		}))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl TryFrom<String> for RecordKey {
	type Error = ValidationError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl From<RecordKey> for String {
	fn from(key: RecordKey) -> Self {
		key.0
	}
}

impl fmt::Display for RecordKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Controlling principal, compared in canonical lowercase form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Owner(String);

impl Owner {
	pub fn parse(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
		let canonical = raw.as_ref().trim().to_ascii_lowercase();
		if canonical.is_empty() {
			return Err(ValidationError::EmptyOwner);
		}
		Ok(Self(canonical))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// The zero address, used by ERC-721 as the `from` side of a mint.
	pub fn is_zero(&self) -> bool {
		self.0
			.strip_prefix("0x")
			.is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b == b'0'))
	}
}

impl TryFrom<String> for Owner {
	type Error = ValidationError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::parse(value)
	}
}

impl From<Owner> for String {
	fn from(owner: Owner) -> Self {
		owner.0
	}
}

impl fmt::Display for Owner {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Mood code within the fixed enumerated range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Mood(u8);

impl Mood {
	pub fn new(code: u8) -> Result<Self, ValidationError> {
		if usize::from(code) < MOOD_NAMES.len() {
			Ok(Self(code))
		} else {
			Err(ValidationError::MoodOutOfRange(code))
		}
	}

	pub fn code(self) -> u8 {
		self.0
	}

	pub fn name(self) -> &'static str {
		MOOD_NAMES[usize::from(self.0)]
	}
}

impl TryFrom<u8> for Mood {
	type Error = ValidationError;

	fn try_from(value: u8) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl From<Mood> for u8 {
	fn from(mood: Mood) -> Self {
		mood.0
	}
}

pub fn validate_annotation(annotation: &str) -> Result<(), ValidationError> {
	let len = annotation.chars().count();
	if len > MAX_ANNOTATION_CHARS {
		return Err(ValidationError::AnnotationTooLong {
			len,
			max: MAX_ANNOTATION_CHARS,
		});
	}
	Ok(())
}

/// The mutable pair of fields a mutation can change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
	pub value: Mood,
	pub annotation: String,
}

/// One element of a record's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
	pub value: Mood,
	pub annotation: String,
	pub timestamp: DateTime<Utc>,
}

/// Off-chain mirror of one token.
///
/// `history` is append-only: creation seeds it with the initial state and every
/// genuine mutation appends the state it replaced, stamped with the time written
/// to `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
	pub key: RecordKey,
	pub owner: Owner,
	pub value: Mood,
	pub annotation: String,
	pub history: Vec<HistoryEntry>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl LedgerRecord {
	pub fn new(key: RecordKey, owner: Owner, value: Mood, now: DateTime<Utc>) -> Self {
		Self {
			key,
			owner,
			value,
			annotation: String::new(),
			history: vec![HistoryEntry {
				value,
				annotation: String::new(),
				timestamp: now,
			}],
			created_at: now,
			updated_at: now,
		}
	}

	pub fn snapshot(&self) -> Snapshot {
		Snapshot {
			value: self.value,
			annotation: self.annotation.clone(),
		}
	}

	/// Append the current state to history, then replace it.
	///
	/// `now` is clamped to `updated_at` so the trail stays non-decreasing when the
	/// wall clock steps backwards. Returns the timestamp actually used.
	pub(crate) fn transition(&mut self, next: Snapshot, now: DateTime<Utc>) -> DateTime<Utc> {
		let at = now.max(self.updated_at);
		self.history.push(HistoryEntry {
			value: self.value,
			annotation: std::mem::take(&mut self.annotation),
			timestamp: at,
		});
		self.value = next.value;
		self.annotation = next.annotation;
		self.updated_at = at;
		at
	}

	pub fn summary(&self) -> RecordSummary {
		RecordSummary {
			key: self.key.clone(),
			owner: self.owner.clone(),
			value: self.value,
			mood_name: self.value.name(),
			annotation: self.annotation.clone(),
			history_len: self.history.len(),
			created_at: self.created_at,
			updated_at: self.updated_at,
		}
	}
}

/// Listing row without the history trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
	pub key: RecordKey,
	pub owner: Owner,
	pub value: Mood,
	pub mood_name: &'static str,
	pub annotation: String,
	pub history_len: usize,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
	pub limit: usize,
	pub skip: usize,
}

impl Default for Pagination {
	fn default() -> Self {
		Self { limit: 50, skip: 0 }
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
	pub total: usize,
	pub items: Vec<T>,
}
