#![forbid(unsafe_code)]

//! Wire pieces of the segmented comment stream: varint framing, a bounded
//! incremental frame decoder, and the protobuf message schema.

pub mod chunked;
pub mod pb;
pub mod varint;

pub use chunked::{ChunkedStreamDecoder, DecodedFrames, DecoderLimits, DecoderStats};
pub use varint::{VarintError, decode_varint, encode_varint, encoded_varint_len};
