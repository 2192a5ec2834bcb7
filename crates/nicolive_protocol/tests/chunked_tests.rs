use nicolive_protocol::pb::{ChunkedEntry, ReadyForNext, chunked_entry};
use nicolive_protocol::{ChunkedStreamDecoder, DecoderLimits, encode_varint};
use proptest::prelude::*;
use prost::Message;

/// Minimal prost message for integration testing
#[derive(Clone, PartialEq, ::prost::Message)]
struct TestMsg {
	#[prost(string, tag = "1")]
	s: String,
	#[prost(uint32, tag = "2")]
	n: u32,
}

fn stream_of(msgs: &[TestMsg]) -> Vec<u8> {
	let mut out = Vec::new();
	for m in msgs {
		m.encode_length_delimited(&mut out).expect("encode");
	}
	out
}

fn sample(count: u32) -> Vec<TestMsg> {
	(0..count)
		.map(|n| TestMsg {
			s: "comment ".repeat((n % 7) as usize),
			n,
		})
		.collect()
}

#[test]
fn oversized_declared_length_abandons_buffer() {
	let mut bytes = Vec::new();
	encode_varint(200_000, &mut bytes);
	bytes.extend(std::iter::repeat_n(0u8, 64));

	let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
	assert!(dec.feed_collect(&bytes).is_empty());
	assert_eq!(dec.pending_len(), 0);
	assert_eq!(dec.stats().oversized_frames, 1);

	// The decoder keeps working on the next well-formed chunk.
	let good = stream_of(&sample(2));
	assert_eq!(dec.feed_collect(&good).len(), 2);
}

#[test]
fn eleven_byte_length_is_treated_as_oversized() {
	let bytes = [0xffu8; 11];
	let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
	assert!(dec.feed_collect(&bytes).is_empty());
	assert_eq!(dec.stats().oversized_frames, 1);
	assert_eq!(dec.pending_len(), 0);
}

#[test]
fn frames_before_an_oversized_length_are_still_returned() {
	let mut bytes = stream_of(&sample(3));
	encode_varint(500_000, &mut bytes);
	bytes.extend([1, 2, 3]);

	let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
	let out = dec.feed_collect(&bytes);
	assert_eq!(out.len(), 3);
	assert_eq!(dec.pending_len(), 0);
}

#[test]
fn carry_over_within_bound_survives_many_chunks() {
	let msg = TestMsg {
		s: "x".repeat(5_000),
		n: 9,
	};
	let bytes = stream_of(std::slice::from_ref(&msg));

	let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
	let mut out = Vec::new();
	for chunk in bytes.chunks(333) {
		out.extend(dec.feed(chunk));
	}
	assert_eq!(out, vec![msg]);
}

#[test]
fn tail_larger_than_carry_bound_is_dropped() {
	let limits = DecoderLimits {
		max_carry_over: 1024,
		..DecoderLimits::default()
	};
	let msg = TestMsg {
		s: "y".repeat(4_000),
		n: 1,
	};
	let bytes = stream_of(&[msg]);

	let mut dec = ChunkedStreamDecoder::<TestMsg>::with_limits(limits);
	assert!(dec.feed_collect(&bytes[..2_000]).is_empty());
	assert_eq!(dec.stats().carry_over_overflows, 1);
	assert_eq!(dec.pending_len(), 0);
}

#[test]
fn decodes_view_entries() {
	let entry = ChunkedEntry {
		entry: Some(chunked_entry::Entry::Next(ReadyForNext { at: 1_700_000_060 })),
	};
	let bytes = entry.encode_length_delimited_to_vec();

	let mut dec = ChunkedStreamDecoder::<ChunkedEntry>::new();
	let out = dec.feed_collect(&bytes);
	assert_eq!(out, vec![entry]);
}

proptest! {
	#[test]
	fn any_split_point_reassembles_the_stream(split in 0usize..4096, count in 1u32..12) {
		let msgs = sample(count);
		let bytes = stream_of(&msgs);
		let split = split % (bytes.len() + 1);

		let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
		let mut out = dec.feed_collect(&bytes[..split]);
		out.extend(dec.feed(&bytes[split..]));

		prop_assert_eq!(out, msgs);
		prop_assert_eq!(dec.pending_len(), 0);
	}

	#[test]
	fn arbitrary_chunk_sizes_preserve_order(sizes in proptest::collection::vec(1usize..64, 1..200)) {
		let msgs = sample(20);
		let bytes = stream_of(&msgs);

		let mut dec = ChunkedStreamDecoder::<TestMsg>::new();
		let mut out = Vec::new();
		let mut pos = 0;
		let mut i = 0;
		while pos < bytes.len() {
			let size = sizes[i % sizes.len()];
			let end = (pos + size).min(bytes.len());
			out.extend(dec.feed(&bytes[pos..end]));
			pos = end;
			i += 1;
		}

		prop_assert_eq!(out, msgs);
	}
}
