//! Read-only views of a record for query surfaces.

use super::record::{HistoryEntry, LedgerRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A record as presented to readers, with the mood name spelled out.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
	pub key: String,
	pub owner: String,
	pub mood: u8,
	pub mood_name: &'static str,
	pub annotation: String,
	pub history: Vec<HistoryView>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryView {
	pub mood: u8,
	pub mood_name: &'static str,
	pub annotation: String,
	pub timestamp: DateTime<Utc>,
}

impl From<&HistoryEntry> for HistoryView {
	fn from(entry: &HistoryEntry) -> Self {
		Self {
			mood: entry.value.code(),
			mood_name: entry.value.name(),
			annotation: entry.annotation.clone(),
			timestamp: entry.timestamp,
		}
	}
}

impl From<&LedgerRecord> for RecordView {
	fn from(record: &LedgerRecord) -> Self {
		Self {
			key: record.key.to_string(),
			owner: record.owner.to_string(),
			mood: record.value.code(),
			mood_name: record.value.name(),
			annotation: record.annotation.clone(),
			history: record.history.iter().map(HistoryView::from).collect(),
			created_at: record.created_at,
			updated_at: record.updated_at,
		}
	}
}

/// ERC-721 metadata document for a token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenMetadata {
	pub name: String,
	pub description: String,
	pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
	pub trait_type: &'static str,
	pub value: serde_json::Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub display_type: Option<&'static str>,
}

impl Attribute {
	fn new(trait_type: &'static str, value: impl Into<serde_json::Value>) -> Self {
		Self {
			trait_type,
			value: value.into(),
			display_type: None,
		}
	}
}

impl From<&LedgerRecord> for TokenMetadata {
	fn from(record: &LedgerRecord) -> Self {
		let mood = record.value.name();
		let message = if record.annotation.is_empty() {
			"No message"
		} else {
			record.annotation.as_str()
		};
		Self {
			name: format!("Mood NFT #{}", record.key),
			description: format!("An adaptive mood NFT expressing: {mood}. \"{message}\""),
			attributes: vec![
				Attribute::new("Mood", mood),
				Attribute::new("Message", message),
				Attribute {
					display_type: Some("date"),
					..Attribute::new("Last Updated", record.updated_at.timestamp())
				},
				Attribute::new("Total Changes", record.history.len()),
			],
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::record::{Mood, Owner, RecordKey, Snapshot};
	use chrono::TimeZone;
	use serde_json::json;

	fn record() -> LedgerRecord {
		let t0 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
		LedgerRecord::new(
			RecordKey::new("12").unwrap(),
			Owner::parse("0xaa").unwrap(),
			Mood::new(9).unwrap(),
			t0,
		)
	}

	#[test]
	fn metadata_describes_mood_and_placeholder_message() {
		let record = record();
		let metadata = serde_json::to_value(TokenMetadata::from(&record)).unwrap();

		assert_eq!(
			metadata,
			json!({
				"name": "Mood NFT #12",
				"description": "An adaptive mood NFT expressing: Kawaii. \"No message\"",
				"attributes": [
					{ "trait_type": "Mood", "value": "Kawaii" },
					{ "trait_type": "Message", "value": "No message" },
					{ "trait_type": "Last Updated", "value": record.updated_at.timestamp(), "display_type": "date" },
					{ "trait_type": "Total Changes", "value": 1 },
				]
			})
		);
	}

	#[test]
	fn view_spells_out_history() {
		let mut record = record();
		record.transition(
			Snapshot {
				value: Mood::new(1).unwrap(),
				annotation: "meh".to_string(),
			},
			record.updated_at,
		);

		let view = RecordView::from(&record);
		assert_eq!(view.mood_name, "Sad");
		assert_eq!(view.history.len(), 2);
		assert_eq!(view.history[1].mood_name, "Kawaii");
		assert_eq!(TokenMetadata::from(&record).attributes[3].value, json!(2));
	}
}
