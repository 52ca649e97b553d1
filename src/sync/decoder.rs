//! Raw contract logs to typed domain events.
//!
//! Decoding is pure. Each event is described by its parameter list in declaration
//! order; indexed parameters are the leading ones and come from `topics[1..]`, the
//! rest are ABI-encoded in `data`. This covers both the all-in-data layout and the
//! indexed `tokenId`/`owner` layout without separate code paths.

use super::events::DomainEvent;
use crate::chain::RawLog;
use crate::chain::abi::{self, AbiError, Word};
use crate::config::EventTopics;
use crate::ledger::record::{Mood, Owner, RecordKey, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("log has no topics")]
	MissingTopic,

	#[error("unrecognized event signature {0}")]
	Unrecognized(String),

	#[error("malformed {event} log: {reason}")]
	Malformed { event: &'static str, reason: String },

	#[error("ignored {event} log: {reason}")]
	Ignored { event: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Param {
	Uint256,
	Address,
	Uint8,
	String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
	RecordCreated,
	ValueChanged,
	AnnotationChanged,
	OwnershipTransferred,
}

impl EventKind {
	fn name(self) -> &'static str {
		match self {
			EventKind::RecordCreated => "NFTMinted",
			EventKind::ValueChanged => "MoodChanged",
			EventKind::AnnotationChanged => "MessageUpdated",
			EventKind::OwnershipTransferred => "Transfer",
		}
	}

	fn params(self) -> &'static [Param] {
		match self {
			EventKind::RecordCreated | EventKind::ValueChanged => {
				&[Param::Uint256, Param::Address, Param::Uint8]
			}
			EventKind::AnnotationChanged => &[Param::Uint256, Param::Address, Param::String],
			EventKind::OwnershipTransferred => &[Param::Address, Param::Address, Param::Uint256],
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
	Uint256(String),
	Address(String),
	Uint8(u8),
	String(String),
}

/// Maps event signature hashes to domain events.
#[derive(Debug, Clone)]
pub struct EventDecoder {
	signatures: Vec<(String, EventKind)>,
}

impl EventDecoder {
	pub fn new(topics: &EventTopics) -> Self {
		let mut signatures = vec![
			(topics.record_created.to_ascii_lowercase(), EventKind::RecordCreated),
			(topics.value_changed.to_ascii_lowercase(), EventKind::ValueChanged),
			(topics.annotation_changed.to_ascii_lowercase(), EventKind::AnnotationChanged),
		];
		if let Some(transfer) = &topics.transfer {
			signatures.push((transfer.to_ascii_lowercase(), EventKind::OwnershipTransferred));
		}
		Self { signatures }
	}

	pub fn decode(&self, log: &RawLog) -> Result<DomainEvent, DecodeError> {
		let signature = log.signature().ok_or(DecodeError::MissingTopic)?;
		let kind = self
			.signatures
			.iter()
			.find(|(topic, _)| *topic == signature)
			.map(|(_, kind)| *kind)
			.ok_or(DecodeError::Unrecognized(signature))?;

		let malformed = |reason: String| DecodeError::Malformed {
			event: kind.name(),
			reason,
		};
		let args = decode_args(log, kind.params()).map_err(|e| malformed(e.to_string()))?;
		build_event(kind, args).map_err(|e| match e {
			Built::Invalid(e) => malformed(e.to_string()),
			Built::Ignored(reason) => DecodeError::Ignored {
				event: kind.name(),
				reason: reason.to_string(),
			},
			Built::Shape => malformed("unexpected argument layout".to_string()),
		})
	}
}

#[derive(Debug, thiserror::Error)]
enum ArgError {
	#[error("{indexed} indexed arguments but the event has {params} parameters")]
	TooManyTopics { indexed: usize, params: usize },

	#[error("indexed string arguments are hashed and cannot be recovered")]
	IndexedString,

	#[error(transparent)]
	Abi(#[from] AbiError),
}

fn decode_args(log: &RawLog, params: &[Param]) -> Result<Vec<Arg>, ArgError> {
	let indexed = log.topics.len() - 1;
	if indexed > params.len() {
		return Err(ArgError::TooManyTopics {
			indexed,
			params: params.len(),
		});
	}
	let data = abi::decode_hex(&log.data)?;

	params
		.iter()
		.enumerate()
		.map(|(position, param)| {
			if position < indexed {
				let word = abi::topic_word(&log.topics[position + 1])?;
				static_arg(*param, &word)
			} else {
				let head = position - indexed;
				match param {
					Param::String => Ok(Arg::String(abi::decode_string(&data, head)?)),
					_ => static_arg(*param, &abi::word_at(&data, head)?),
				}
			}
		})
		.collect()
}

fn static_arg(param: Param, word: &Word) -> Result<Arg, ArgError> {
	Ok(match param {
		Param::Uint256 => Arg::Uint256(abi::word_to_decimal(word)),
		Param::Address => Arg::Address(abi::word_to_address(word)?),
		Param::Uint8 => Arg::Uint8(abi::word_to_u8(word)?),
		Param::String => return Err(ArgError::IndexedString),
	})
}

enum Built {
	Invalid(ValidationError),
	Ignored(&'static str),
	Shape,
}

impl From<ValidationError> for Built {
	fn from(e: ValidationError) -> Self {
		Built::Invalid(e)
	}
}

fn build_event(kind: EventKind, args: Vec<Arg>) -> Result<DomainEvent, Built> {
	Ok(match (kind, args.as_slice()) {
		(EventKind::RecordCreated, [Arg::Uint256(key), Arg::Address(owner), Arg::Uint8(value)]) => {
			DomainEvent::RecordCreated {
				key: RecordKey::new(key)?,
				owner: Owner::parse(owner)?,
				value: Mood::new(*value)?,
			}
		}
		(EventKind::ValueChanged, [Arg::Uint256(key), Arg::Address(owner), Arg::Uint8(value)]) => {
			DomainEvent::ValueChanged {
				key: RecordKey::new(key)?,
				owner: Owner::parse(owner)?,
				new_value: Mood::new(*value)?,
			}
		}
		(EventKind::AnnotationChanged, [Arg::Uint256(key), Arg::Address(owner), Arg::String(annotation)]) => {
			crate::ledger::record::validate_annotation(annotation)?;
			DomainEvent::AnnotationChanged {
				key: RecordKey::new(key)?,
				owner: Owner::parse(owner)?,
				new_annotation: annotation.clone(),
			}
		}
		(EventKind::OwnershipTransferred, [Arg::Address(from), Arg::Address(to), Arg::Uint256(key)]) => {
			let from = Owner::parse(from)?;
			if from.is_zero() {
				return Err(Built::Ignored("mint is handled through NFTMinted"));
			}
			DomainEvent::OwnershipTransferred {
				key: RecordKey::new(key)?,
				from,
				to: Owner::parse(to)?,
			}
		}
		_ => return Err(Built::Shape),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chain::abi::encode::*;
	use crate::chain::fake::{self, address};

	fn decoder() -> EventDecoder {
		EventDecoder::new(&EventTopics::default())
	}

	fn key(k: &str) -> RecordKey {
		RecordKey::new(k).unwrap()
	}

	fn owner(o: &str) -> Owner {
		Owner::parse(address(o)).unwrap()
	}

	#[test]
	fn decodes_created_with_indexed_key_and_owner() {
		let event = decoder().decode(&fake::created_log(1, "3", "0xBB", 2)).unwrap();
		assert_eq!(
			event,
			DomainEvent::RecordCreated {
				key: key("3"),
				owner: owner("0xbb"),
				value: Mood::new(2).unwrap(),
			}
		);
	}

	#[test]
	fn decodes_identically_when_nothing_is_indexed() {
		let indexed = fake::mood_log(1, "3", "0xbb", 7);
		let mut flat = indexed.clone();
		flat.topics.truncate(1);
		let mut data = Vec::new();
		data.extend(abi::decimal_to_word("3").unwrap());
		data.extend(address_word(&address("0xbb")));
		data.extend(u8_word(7));
		flat.data = format!("0x{}", hex::encode(data));

		assert_eq!(decoder().decode(&flat).unwrap(), decoder().decode(&indexed).unwrap());
	}

	#[test]
	fn decodes_annotation_string_from_data() {
		let event = decoder()
			.decode(&fake::message_log(4, "3", "0xbb", "hi"))
			.unwrap();
		assert_eq!(
			event,
			DomainEvent::AnnotationChanged {
				key: key("3"),
				owner: owner("0xbb"),
				new_annotation: "hi".to_string(),
			}
		);
	}

	#[test]
	fn decodes_transfer_and_ignores_mint_half() {
		let event = decoder()
			.decode(&fake::transfer_log(5, "3", "0xbb", "0xcc"))
			.unwrap();
		assert_eq!(
			event,
			DomainEvent::OwnershipTransferred {
				key: key("3"),
				from: owner("0xbb"),
				to: owner("0xcc"),
			}
		);

		let mint = decoder().decode(&fake::transfer_log(5, "3", "0x0", "0xcc"));
		assert!(matches!(mint, Err(DecodeError::Ignored { .. })));
	}

	#[test]
	fn transfer_is_unrecognized_when_disabled() {
		let topics = EventTopics {
			transfer: None,
			..EventTopics::default()
		};
		let result = EventDecoder::new(&topics).decode(&fake::transfer_log(5, "3", "0xbb", "0xcc"));
		assert!(matches!(result, Err(DecodeError::Unrecognized(_))));
	}

	#[test]
	fn rejects_unknown_and_malformed_logs() {
		let mut unknown = fake::mood_log(1, "1", "0xaa", 1);
		unknown.topics[0] = format!("0x{}", "ab".repeat(32));
		assert!(matches!(
			decoder().decode(&unknown),
			Err(DecodeError::Unrecognized(_))
		));

		let mut empty = unknown.clone();
		empty.topics.clear();
		assert!(matches!(decoder().decode(&empty), Err(DecodeError::MissingTopic)));

		let mut truncated = fake::mood_log(1, "1", "0xaa", 1);
		truncated.data = "0x00".to_string();
		assert!(matches!(
			decoder().decode(&truncated),
			Err(DecodeError::Malformed { event: "MoodChanged", .. })
		));

		let out_of_range = fake::mood_log(1, "1", "0xaa", 12);
		assert!(matches!(
			decoder().decode(&out_of_range),
			Err(DecodeError::Malformed { .. })
		));
	}
}
