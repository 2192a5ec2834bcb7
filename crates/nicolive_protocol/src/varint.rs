#![forbid(unsafe_code)]

use bytes::BufMut;
use thiserror::Error;

/// Longest encoding of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VarintError {
	/// The buffer ended while the continuation bit was still set.
	#[error("varint truncated after {have} bytes")]
	Truncated {
		have: usize,
	},

	/// More than `MAX_VARINT_LEN` bytes, or the value does not fit in 64 bits.
	#[error("varint overflows 64 bits")]
	Overflow,
}

/// Decode a little-endian base-128 varint from the start of `src`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_varint(src: &[u8]) -> Result<(u64, usize), VarintError> {
	let mut value: u64 = 0;

	for (i, &byte) in src.iter().enumerate() {
		if i >= MAX_VARINT_LEN {
			return Err(VarintError::Overflow);
		}

		let bits = u64::from(byte & 0x7f);
		// The tenth byte may only contribute the single remaining bit.
		if i == MAX_VARINT_LEN - 1 && bits > 1 {
			return Err(VarintError::Overflow);
		}
		value |= bits << (7 * i);

		if byte & 0x80 == 0 {
			return Ok((value, i + 1));
		}
	}

	if src.len() >= MAX_VARINT_LEN {
		return Err(VarintError::Overflow);
	}
	Err(VarintError::Truncated { have: src.len() })
}

/// Append `value` as a varint.
pub fn encode_varint(mut value: u64, buf: &mut impl BufMut) {
	while value >= 0x80 {
		buf.put_u8((value as u8 & 0x7f) | 0x80);
		value >>= 7;
	}
	buf.put_u8(value as u8);
}

/// Number of bytes `encode_varint` writes for `value`.
#[inline]
pub fn encoded_varint_len(value: u64) -> usize {
	let bits = 64 - (value | 1).leading_zeros() as usize;
	bits.div_ceil(7)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_300() {
		assert_eq!(decode_varint(&[0xAC, 0x02]), Ok((300, 2)));
	}

	#[test]
	fn decodes_single_byte_and_ignores_trailing_bytes() {
		assert_eq!(decode_varint(&[0x05, 0xff, 0xff]), Ok((5, 1)));
		assert_eq!(decode_varint(&[0x00]), Ok((0, 1)));
	}

	#[test]
	fn lone_continuation_byte_is_truncated() {
		assert_eq!(decode_varint(&[0x80]), Err(VarintError::Truncated { have: 1 }));
		assert_eq!(decode_varint(&[]), Err(VarintError::Truncated { have: 0 }));
	}

	#[test]
	fn eleven_byte_varint_overflows() {
		let src = [0xffu8; 11];
		assert_eq!(decode_varint(&src), Err(VarintError::Overflow));
	}

	#[test]
	fn encodes_max_value_in_ten_bytes() {
		let mut buf = Vec::new();
		encode_varint(u64::MAX, &mut buf);
		assert_eq!(buf.len(), MAX_VARINT_LEN);
		assert_eq!(encoded_varint_len(u64::MAX), MAX_VARINT_LEN);
		assert_eq!(decode_varint(&buf), Ok((u64::MAX, MAX_VARINT_LEN)));
	}

	#[test]
	fn encoded_len_matches_encoder() {
		for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, 200_000, 1 << 35] {
			let mut buf = Vec::new();
			encode_varint(v, &mut buf);
			assert_eq!(buf.len(), encoded_varint_len(v), "value {v}");
		}
	}
}
