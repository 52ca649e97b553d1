//! Domain events decoded from contract logs.
//!
//! `RecordCreated` and `OwnershipTransferred` carry everything a write needs.
//! `ValueChanged` and `AnnotationChanged` only carry the field that changed, and are
//! completed by the resolver before they reach the store.

use crate::chain::{RawLog, Watermark};
use crate::ledger::{Mood, Owner, RecordKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
	/// A token was minted
	RecordCreated {
		key: RecordKey,
		owner: Owner,
		value: Mood,
	},
	/// The owner set a new mood
	ValueChanged {
		key: RecordKey,
		owner: Owner,
		new_value: Mood,
	},
	/// The owner set a new message
	AnnotationChanged {
		key: RecordKey,
		owner: Owner,
		new_annotation: String,
	},
	/// The token changed hands
	OwnershipTransferred {
		key: RecordKey,
		from: Owner,
		to: Owner,
	},
}

impl DomainEvent {
	pub fn key(&self) -> &RecordKey {
		match self {
			DomainEvent::RecordCreated { key, .. }
			| DomainEvent::ValueChanged { key, .. }
			| DomainEvent::AnnotationChanged { key, .. }
			| DomainEvent::OwnershipTransferred { key, .. } => key,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			DomainEvent::RecordCreated { .. } => "record_created",
			DomainEvent::ValueChanged { .. } => "value_changed",
			DomainEvent::AnnotationChanged { .. } => "annotation_changed",
			DomainEvent::OwnershipTransferred { .. } => "ownership_transferred",
		}
	}
}

/// A decoded event on its way from a subscription to a shard worker.
#[derive(Debug, Clone)]
pub struct Delivery {
	/// Index of the originating subscription, used to acknowledge its watermark.
	pub subscription: usize,
	pub watermark: Watermark,
	pub raw: RawLog,
	pub event: DomainEvent,
}
