#![forbid(unsafe_code)]

use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use prost::Message;
use tracing::{debug, warn};

use crate::varint::{VarintError, decode_varint};

/// Ceiling for a single declared frame length.
pub const DEFAULT_MAX_FRAME_LEN: usize = 100 * 1024;

/// Ceiling for the truncated tail kept between chunks.
pub const DEFAULT_MAX_CARRY_OVER: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderLimits {
	pub max_frame_len: usize,
	pub max_carry_over: usize,
}

impl Default for DecoderLimits {
	fn default() -> Self {
		Self {
			max_frame_len: DEFAULT_MAX_FRAME_LEN,
			max_carry_over: DEFAULT_MAX_CARRY_OVER,
		}
	}
}

/// Counters for everything the decoder dropped instead of returning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
	pub decoded: u64,
	/// Complete frames whose payload failed schema decode.
	pub undecodable_frames: u64,
	/// Times a declared length (or malformed varint) forced the buffer to be abandoned.
	pub oversized_frames: u64,
	/// Times the carry-over exceeded its bound and was discarded.
	pub carry_over_overflows: u64,
	pub discarded_bytes: u64,
}

/// Incremental decoder for a stream of varint length-delimited protobuf frames.
///
/// Feed raw chunks with [`ChunkedStreamDecoder::feed`]; the returned iterator
/// decodes lazily and leaves any truncated tail in the decoder for the next chunk.
#[derive(Debug)]
pub struct ChunkedStreamDecoder<M> {
	buf: BytesMut,
	limits: DecoderLimits,
	stats: DecoderStats,
	_schema: PhantomData<fn() -> M>,
}

impl<M: Message + Default> Default for ChunkedStreamDecoder<M> {
	fn default() -> Self {
		Self::new()
	}
}

impl<M: Message + Default> ChunkedStreamDecoder<M> {
	pub fn new() -> Self {
		Self::with_limits(DecoderLimits::default())
	}

	pub fn with_limits(limits: DecoderLimits) -> Self {
		Self {
			buf: BytesMut::new(),
			limits,
			stats: DecoderStats::default(),
			_schema: PhantomData,
		}
	}

	pub fn stats(&self) -> DecoderStats {
		self.stats
	}

	/// Bytes currently held between chunks.
	pub fn pending_len(&self) -> usize {
		self.buf.len()
	}

	/// Append `chunk` and iterate over the frames it completes.
	pub fn feed(&mut self, chunk: &[u8]) -> DecodedFrames<'_, M> {
		self.buf.extend_from_slice(chunk);
		DecodedFrames { decoder: self }
	}

	/// Feed a chunk and collect every frame it completes.
	pub fn feed_collect(&mut self, chunk: &[u8]) -> Vec<M> {
		self.feed(chunk).collect()
	}

	fn abandon(&mut self) {
		self.stats.discarded_bytes += self.buf.len() as u64;
		self.buf.clear();
	}

	/// Enforce the carry-over bound once the decoder is waiting for more bytes.
	fn retain_tail(&mut self) {
		let pending = self.buf.len();
		if pending > self.limits.max_carry_over {
			warn!(
				pending,
				max = self.limits.max_carry_over,
				"chunked stream carry-over too large; discarding"
			);
			self.stats.carry_over_overflows += 1;
			self.abandon();
		}
	}

	fn next_frame(&mut self) -> Option<M> {
		loop {
			if self.buf.is_empty() {
				return None;
			}

			let (len, prefix) = match decode_varint(&self.buf) {
				Ok((len, prefix)) => (len, prefix),
				Err(VarintError::Truncated { .. }) => {
					self.retain_tail();
					return None;
				}
				Err(VarintError::Overflow) => {
					warn!(pending = self.buf.len(), "malformed frame length; abandoning buffer");
					self.stats.oversized_frames += 1;
					self.abandon();
					return None;
				}
			};

			if len > self.limits.max_frame_len as u64 {
				warn!(
					len,
					max = self.limits.max_frame_len,
					"declared frame length exceeds ceiling; abandoning buffer"
				);
				self.stats.oversized_frames += 1;
				self.abandon();
				return None;
			}

			let len = len as usize;
			if self.buf.len() - prefix < len {
				self.retain_tail();
				return None;
			}

			self.buf.advance(prefix);
			let frame = self.buf.split_to(len);
			match M::decode(frame.freeze()) {
				Ok(msg) => {
					self.stats.decoded += 1;
					return Some(msg);
				}
				Err(e) => {
					debug!(error = %e, len, "skipping undecodable frame");
					self.stats.undecodable_frames += 1;
				}
			}
		}
	}
}

/// Lazy iterator returned by [`ChunkedStreamDecoder::feed`].
pub struct DecodedFrames<'a, M> {
	decoder: &'a mut ChunkedStreamDecoder<M>,
}

impl<M: Message + Default> Iterator for DecodedFrames<'_, M> {
	type Item = M;

	fn next(&mut self) -> Option<M> {
		self.decoder.next_frame()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct TestMsg {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint32, tag = "2")]
		n: u32,
	}

	fn frame(s: &str, n: u32) -> Vec<u8> {
		TestMsg { s: s.to_string(), n }.encode_length_delimited_to_vec()
	}

	#[test]
	fn decodes_several_frames_from_one_chunk() {
		let mut bytes = frame("a", 1);
		bytes.extend(frame("b", 2));
		bytes.extend(frame("c", 3));

		let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
		let out = dec.feed_collect(&bytes);
		assert_eq!(out.iter().map(|m| m.n).collect::<Vec<_>>(), vec![1, 2, 3]);
		assert_eq!(dec.pending_len(), 0);
		assert_eq!(dec.stats().decoded, 3);
	}

	#[test]
	fn truncated_tail_is_carried_over() {
		let bytes = frame("hello", 7);
		let mut dec = ChunkedStreamDecoder::<TestMsg>::new();

		assert!(dec.feed_collect(&bytes[..1]).is_empty());
		assert_eq!(dec.pending_len(), 1);
		assert!(dec.feed_collect(&bytes[1..4]).is_empty());
		assert_eq!(dec.pending_len(), 4);

		let out = dec.feed_collect(&bytes[4..]);
		assert_eq!(out, vec![TestMsg { s: "hello".into(), n: 7 }]);
		assert_eq!(dec.pending_len(), 0);
	}

	#[test]
	fn iterator_is_lazy() {
		let mut bytes = frame("a", 1);
		bytes.extend(frame("b", 2));

		let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
		let first = dec.feed(&bytes).next().expect("first frame");
		assert_eq!(first.n, 1);
		// The second frame is still buffered and comes out on the next feed.
		assert_eq!(dec.feed_collect(&[]).len(), 1);
	}

	#[test]
	fn undecodable_frame_is_skipped_alone() {
		let mut bytes = frame("a", 1);
		// Length 2, payload is an invalid tag (field 0).
		bytes.extend([0x02, 0x00, 0x00]);
		bytes.extend(frame("c", 3));

		let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
		let out = dec.feed_collect(&bytes);
		assert_eq!(out.iter().map(|m| m.n).collect::<Vec<_>>(), vec![1, 3]);
		assert_eq!(dec.stats().undecodable_frames, 1);
	}

	#[test]
	fn oversized_carry_over_is_discarded() {
		let limits = DecoderLimits {
			max_frame_len: 1024,
			max_carry_over: 16,
		};
		let big = frame(&"x".repeat(100), 1);

		let mut dec = ChunkedStreamDecoder::<TestMsg>::with_limits(limits);
		assert!(dec.feed_collect(&big[..40]).is_empty());
		assert_eq!(dec.pending_len(), 0);
		assert_eq!(dec.stats().carry_over_overflows, 1);
		assert_eq!(dec.stats().discarded_bytes, 40);
	}
}
