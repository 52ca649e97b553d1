//! Completes partial events with live contract reads.
//!
//! `ValueChanged` and `AnnotationChanged` each carry one field; the other one is read
//! back from the contract so the writer always receives the full `{value, annotation}`
//! pair. The resolver also captures the store snapshot the request was built against,
//! which the writer checks again under the key lock.

use super::events::DomainEvent;
use crate::chain::{ChainError, ChainSource, ChainValue, FieldSelector};
use crate::config::RetryPolicy;
use crate::ledger::record::{Mood, RecordKey, ValidationError};
use crate::ledger::{AnnotationUpdate, StoreError, StoreWriter, ValueUpdate, WriteRequest};
use backoff::future::retry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
	#[error("reading {field} of record {key} failed after {attempts} attempts: {last_error}")]
	Exhausted {
		key: RecordKey,
		field: FieldSelector,
		attempts: u32,
		last_error: ChainError,
	},

	#[error("reading {field} of record {key} returned {value:?}")]
	UnexpectedValue {
		key: RecordKey,
		field: FieldSelector,
		value: ChainValue,
	},

	#[error("record {key} read back an invalid {field}: {source}")]
	Invalid {
		key: RecordKey,
		field: FieldSelector,
		source: ValidationError,
	},

	#[error("Store error: {0}")]
	Store(#[from] StoreError),
}

impl ResolveError {
	/// Only local store trouble is worth another resolve; chain reads already
	/// carry their own retry budget.
	pub fn is_transient(&self) -> bool {
		matches!(self, ResolveError::Store(e) if e.is_transient())
	}
}

pub struct StateResolver {
	chain: Arc<dyn ChainSource>,
	writer: Arc<StoreWriter>,
	contract: String,
	retry: RetryPolicy,
}

impl StateResolver {
	pub fn new(
		chain: Arc<dyn ChainSource>,
		writer: Arc<StoreWriter>,
		contract: String,
		retry: RetryPolicy,
	) -> Self {
		Self {
			chain,
			writer,
			contract,
			retry,
		}
	}

	pub async fn resolve(&self, event: &DomainEvent) -> Result<WriteRequest, ResolveError> {
		match event {
			DomainEvent::RecordCreated { key, owner, value } => Ok(WriteRequest::Create {
				key: key.clone(),
				owner: owner.clone(),
				value: *value,
			}),
			DomainEvent::ValueChanged {
				key,
				owner,
				new_value,
			} => {
				let expected = self.snapshot(key).await?;
				let annotation = self.read_annotation(key).await?;
				Ok(WriteRequest::UpdateValue(ValueUpdate {
					key: key.clone(),
					owner: owner.clone(),
					value: *new_value,
					annotation: Some(annotation),
					expected,
				}))
			}
			DomainEvent::AnnotationChanged {
				key,
				owner,
				new_annotation,
			} => {
				let expected = self.snapshot(key).await?;
				let value = self.read_value(key).await?;
				Ok(WriteRequest::UpdateAnnotation(AnnotationUpdate {
					key: key.clone(),
					owner: owner.clone(),
					annotation: new_annotation.clone(),
					value: Some(value),
					expected,
				}))
			}
			DomainEvent::OwnershipTransferred { key, from, to } => Ok(WriteRequest::Transfer {
				key: key.clone(),
				from: from.clone(),
				to: to.clone(),
			}),
		}
	}

	async fn snapshot(
		&self,
		key: &RecordKey,
	) -> Result<Option<crate::ledger::Snapshot>, ResolveError> {
		Ok(self.writer.get(key).await?.map(|record| record.snapshot()))
	}

	pub async fn read_value(&self, key: &RecordKey) -> Result<Mood, ResolveError> {
		match self.read(key, FieldSelector::Mood).await? {
			ChainValue::Mood(code) => Mood::new(code).map_err(|source| ResolveError::Invalid {
				key: key.clone(),
				field: FieldSelector::Mood,
				source,
			}),
			value => Err(ResolveError::UnexpectedValue {
				key: key.clone(),
				field: FieldSelector::Mood,
				value,
			}),
		}
	}

	pub async fn read_annotation(&self, key: &RecordKey) -> Result<String, ResolveError> {
		match self.read(key, FieldSelector::Message).await? {
			ChainValue::Message(message) => Ok(message),
			value => Err(ResolveError::UnexpectedValue {
				key: key.clone(),
				field: FieldSelector::Message,
				value,
			}),
		}
	}

	pub async fn read_owner(&self, key: &RecordKey) -> Result<String, ResolveError> {
		match self.read(key, FieldSelector::Owner).await? {
			ChainValue::Owner(owner) => Ok(owner),
			value => Err(ResolveError::UnexpectedValue {
				key: key.clone(),
				field: FieldSelector::Owner,
				value,
			}),
		}
	}

	/// Read one field, retrying transport failures with exponential backoff.
	async fn read(&self, key: &RecordKey, field: FieldSelector) -> Result<ChainValue, ResolveError> {
		let attempts = AtomicU32::new(0);
		let max_attempts = self.retry.max_attempts;
		let chain = &self.chain;
		let contract = self.contract.as_str();
		let attempts_ref = &attempts;

		let result = retry(self.retry.backoff(), || async move {
			let attempt = attempts_ref.fetch_add(1, Ordering::Relaxed) + 1;
			chain
				.read_current(contract, field, key.as_str())
				.await
				.map_err(|e| {
					if e.is_transient() && attempt < max_attempts {
						warn!(%key, %field, attempt, "Read-back failed, retrying: {}", e);
						backoff::Error::transient(e)
					} else {
						backoff::Error::permanent(e)
					}
				})
		})
		.await;

		match result {
			Ok(value) => {
				debug!(%key, %field, "Read back {:?}", value);
				Ok(value)
			}
			Err(last_error) => Err(ResolveError::Exhausted {
				key: key.clone(),
				field,
				attempts: attempts.load(Ordering::Relaxed),
				last_error,
			}),
		}
	}
}
