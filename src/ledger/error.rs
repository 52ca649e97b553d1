use super::record::{Owner, RecordKey, ValidationError};

/// Outcomes of a store mutation other than success.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("record {0} already exists")]
	AlreadyExists(RecordKey),

	#[error("record {0} not found")]
	NotFound(RecordKey),

	#[error("record {key} is owned by {stored}, write presented {presented}")]
	Unauthorized {
		key: RecordKey,
		stored: Owner,
		presented: Owner,
	},

	#[error("record {0} already holds the requested state")]
	NoOp(RecordKey),

	#[error("Validation error: {0}")]
	Validation(#[from] ValidationError),

	#[error("record {key} changed since the write was resolved")]
	Conflict { key: RecordKey },

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl StoreError {
	/// Storage trouble and lost races can succeed on a later attempt; every other
	/// outcome is a verdict on the write itself.
	pub fn is_transient(&self) -> bool {
		matches!(self, StoreError::Io(_) | StoreError::Conflict { .. })
	}

	/// Short label used in log fields.
	pub fn kind(&self) -> &'static str {
		match self {
			StoreError::AlreadyExists(_) => "already_exists",
			StoreError::NotFound(_) => "not_found",
			StoreError::Unauthorized { .. } => "unauthorized",
			StoreError::NoOp(_) => "noop",
			StoreError::Validation(_) => "validation",
			StoreError::Conflict { .. } => "conflict",
			StoreError::Io(_) => "io",
			StoreError::Serialization(_) => "serialization",
		}
	}
}
