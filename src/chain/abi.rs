//! Minimal Solidity ABI helpers for the handful of types the mood contract uses:
//! `uint256`, `uint8`, `address` and `string`.

/// Size of one ABI word in bytes.
pub const WORD: usize = 32;

pub type Word = [u8; WORD];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
	#[error("invalid hex: {0}")]
	InvalidHex(String),

	#[error("payload too short: need {needed} bytes, have {actual}")]
	OutOfBounds { needed: usize, actual: usize },

	#[error("value does not fit in {0}")]
	Overflow(&'static str),

	#[error("dirty padding in {0} word")]
	DirtyPadding(&'static str),

	#[error("invalid decimal {0:?}")]
	InvalidDecimal(String),

	#[error("string is not valid UTF-8")]
	InvalidUtf8,
}

pub fn strip_0x(s: &str) -> &str {
	s.strip_prefix("0x")
		.or_else(|| s.strip_prefix("0X"))
		.unwrap_or(s)
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>, AbiError> {
	hex::decode(strip_0x(s)).map_err(|e| AbiError::InvalidHex(e.to_string()))
}

/// Decode a topic (always exactly one word).
pub fn topic_word(topic: &str) -> Result<Word, AbiError> {
	let bytes = decode_hex(topic)?;
	bytes
		.as_slice()
		.try_into()
		.map_err(|_| AbiError::OutOfBounds {
			needed: WORD,
			actual: bytes.len(),
		})
}

/// The `index`-th head word of an ABI payload.
pub fn word_at(data: &[u8], index: usize) -> Result<Word, AbiError> {
	let start = index * WORD;
	slice(data, start, WORD).map(|s| {
		let mut word = [0u8; WORD];
		word.copy_from_slice(s);
		word
	})
}

fn slice(data: &[u8], start: usize, len: usize) -> Result<&[u8], AbiError> {
	let end = start.checked_add(len).ok_or(AbiError::Overflow("usize"))?;
	data.get(start..end).ok_or(AbiError::OutOfBounds {
		needed: end,
		actual: data.len(),
	})
}

pub fn word_to_u8(word: &Word) -> Result<u8, AbiError> {
	if word[..WORD - 1].iter().any(|b| *b != 0) {
		return Err(AbiError::Overflow("uint8"));
	}
	Ok(word[WORD - 1])
}

pub fn word_to_usize(word: &Word) -> Result<usize, AbiError> {
	if word[..WORD - 8].iter().any(|b| *b != 0) {
		return Err(AbiError::Overflow("usize"));
	}
	let mut tail = [0u8; 8];
	tail.copy_from_slice(&word[WORD - 8..]);
	usize::try_from(u64::from_be_bytes(tail)).map_err(|_| AbiError::Overflow("usize"))
}

/// Lowercase `0x`-prefixed 20-byte address.
pub fn word_to_address(word: &Word) -> Result<String, AbiError> {
	if word[..12].iter().any(|b| *b != 0) {
		return Err(AbiError::DirtyPadding("address"));
	}
	Ok(format!("0x{}", hex::encode(&word[12..])))
}

/// Render a big-endian `uint256` as a decimal string.
pub fn word_to_decimal(word: &Word) -> String {
	let mut digits = Vec::new();
	let mut value = *word;
	while value.iter().any(|b| *b != 0) {
		let mut remainder = 0u32;
		for byte in value.iter_mut() {
			let acc = (remainder << 8) | u32::from(*byte);
			*byte = (acc / 10) as u8;
			remainder = acc % 10;
		}
		digits.push(b'0' + remainder as u8);
	}
	if digits.is_empty() {
		return "0".to_string();
	}
	digits.reverse();
	String::from_utf8(digits).unwrap_or_default()
}

/// Parse a decimal string into a big-endian `uint256` word.
pub fn decimal_to_word(decimal: &str) -> Result<Word, AbiError> {
	if decimal.is_empty() || !decimal.bytes().all(|b| b.is_ascii_digit()) {
		return Err(AbiError::InvalidDecimal(decimal.to_string()));
	}
	let mut word = [0u8; WORD];
	for digit in decimal.bytes().map(|b| u32::from(b - b'0')) {
		let mut carry = digit;
		for byte in word.iter_mut().rev() {
			let acc = u32::from(*byte) * 10 + carry;
			*byte = (acc & 0xff) as u8;
			carry = acc >> 8;
		}
		if carry != 0 {
			return Err(AbiError::Overflow("uint256"));
		}
	}
	Ok(word)
}

/// Decode a dynamic `string` whose head word sits at `head_index`.
pub fn decode_string(data: &[u8], head_index: usize) -> Result<String, AbiError> {
	let offset = word_to_usize(&word_at(data, head_index)?)?;
	let len = word_to_usize(&word_at(&data[offset.min(data.len())..], 0)?)?;
	let bytes = slice(data, offset + WORD, len)?;
	String::from_utf8(bytes.to_vec()).map_err(|_| AbiError::InvalidUtf8)
}

/// `0x`-prefixed calldata for a single-argument `f(uint256)` view call.
pub fn encode_call(selector: &str, argument: &Word) -> String {
	format!("0x{}{}", strip_0x(selector), hex::encode(argument))
}
