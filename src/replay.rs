//! Manual repair of a single record from current on-chain values.

use crate::ledger::projection::RecordView;
use crate::ledger::record::ValidationError;
use crate::ledger::{Owner, RecordKey, StoreError, StoreWriter, ValueUpdate};
use crate::sync::{ResolveError, StateResolver};
use serde::Serialize;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
	#[error(transparent)]
	Resolve(#[from] ResolveError),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("chain returned an invalid owner: {0}")]
	Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
	Created,
	OwnerTransferred { from: Owner, to: Owner },
	Updated,
	InSync,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
	pub key: RecordKey,
	pub actions: Vec<RepairAction>,
	pub record: RecordView,
}

/// Bring one record in line with the contract's owner, mood and message.
///
/// Every change goes through the writer, so a repair appends history exactly like
/// a live event would and repairing an in-sync record changes nothing.
pub async fn repair_record(
	resolver: &StateResolver,
	writer: &StoreWriter,
	key: &RecordKey,
) -> Result<RepairReport, ReplayError> {
	let owner = Owner::parse(resolver.read_owner(key).await?)?;
	let value = resolver.read_value(key).await?;
	let annotation = resolver.read_annotation(key).await?;
	info!(%key, %owner, mood = value.name(), "Read current on-chain state");

	let mut actions = Vec::new();
	let stored = match writer.create(key.clone(), owner.clone(), value).await {
		Ok(record) => {
			actions.push(RepairAction::Created);
			record
		}
		Err(StoreError::AlreadyExists(_)) => writer
			.get(key)
			.await?
			.ok_or_else(|| StoreError::NotFound(key.clone()))?,
		Err(e) => return Err(e.into()),
	};

	if stored.owner != owner {
		writer
			.transfer(key.clone(), stored.owner.clone(), owner.clone())
			.await?;
		actions.push(RepairAction::OwnerTransferred {
			from: stored.owner,
			to: owner.clone(),
		});
	}

	let update = ValueUpdate {
		key: key.clone(),
		owner,
		value,
		annotation: Some(annotation),
		expected: None,
	};
	let record = match writer.update_value(update).await {
		Ok(record) => {
			actions.push(RepairAction::Updated);
			record
		}
		Err(StoreError::NoOp(_)) => writer
			.get(key)
			.await?
			.ok_or_else(|| StoreError::NotFound(key.clone()))?,
		Err(e) => return Err(e.into()),
	};

	if actions.is_empty() {
		actions.push(RepairAction::InSync);
	}
	info!(%key, ?actions, "Repaired record");
	Ok(RepairReport {
		key: key.clone(),
		actions,
		record: RecordView::from(&record),
	})
}
