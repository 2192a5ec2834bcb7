#![forbid(unsafe_code)]

//! Message schema of the segmented comment stream.
//!
//! A view URI yields length-delimited [`ChunkedEntry`] frames; each segment URI
//! yields length-delimited [`ChunkedMessage`] frames; backward pages are a single
//! [`PackedSegment`].

use prost_types::Timestamp;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkedEntry {
	#[prost(oneof = "chunked_entry::Entry", tags = "1, 2, 3, 4")]
	pub entry: Option<chunked_entry::Entry>,
}

pub mod chunked_entry {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Entry {
		#[prost(message, tag = "1")]
		Segment(super::MessageSegment),
		#[prost(message, tag = "2")]
		Backward(super::BackwardSegment),
		#[prost(message, tag = "3")]
		Previous(super::MessageSegment),
		#[prost(message, tag = "4")]
		Next(super::ReadyForNext),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageSegment {
	#[prost(message, optional, tag = "1")]
	pub from: Option<Timestamp>,
	#[prost(message, optional, tag = "2")]
	pub until: Option<Timestamp>,
	#[prost(string, tag = "3")]
	pub uri: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BackwardSegment {
	#[prost(message, optional, tag = "1")]
	pub until: Option<Timestamp>,
	#[prost(message, optional, tag = "2")]
	pub segment: Option<packed_segment::Next>,
	#[prost(message, optional, tag = "3")]
	pub snapshot: Option<packed_segment::StateSnapshot>,
}

/// Cursor for the next view request, in unix seconds.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadyForNext {
	#[prost(int64, tag = "1")]
	pub at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PackedSegment {
	#[prost(message, repeated, tag = "1")]
	pub messages: Vec<ChunkedMessage>,
	#[prost(message, optional, tag = "2")]
	pub next: Option<packed_segment::Next>,
	#[prost(message, optional, tag = "3")]
	pub snapshot: Option<packed_segment::StateSnapshot>,
}

pub mod packed_segment {
	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct Next {
		#[prost(string, tag = "1")]
		pub uri: String,
	}

	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct StateSnapshot {
		#[prost(string, tag = "1")]
		pub uri: String,
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkedMessage {
	#[prost(message, optional, tag = "1")]
	pub meta: Option<chunked_message::Meta>,
	#[prost(oneof = "chunked_message::Payload", tags = "2, 4, 5")]
	pub payload: Option<chunked_message::Payload>,
}

pub mod chunked_message {
	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct Meta {
		#[prost(string, tag = "1")]
		pub id: String,
		#[prost(message, optional, tag = "2")]
		pub at: Option<::prost_types::Timestamp>,
	}

	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum Signal {
		/// Everything buffered server-side up to now has been sent.
		Flushed = 0,
	}

	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Payload {
		#[prost(message, tag = "2")]
		Message(super::NicoliveMessage),
		#[prost(message, tag = "4")]
		State(super::NicoliveState),
		#[prost(enumeration = "Signal", tag = "5")]
		Signal(i32),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NicoliveMessage {
	#[prost(oneof = "nicolive_message::Data", tags = "1, 7, 8, 9, 20")]
	pub data: Option<nicolive_message::Data>,
}

pub mod nicolive_message {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Data {
		#[prost(message, tag = "1")]
		Chat(super::Chat),
		#[prost(message, tag = "7")]
		SimpleNotification(super::SimpleNotification),
		#[prost(message, tag = "8")]
		Gift(super::Gift),
		#[prost(message, tag = "9")]
		Nicoad(super::Nicoad),
		#[prost(message, tag = "20")]
		OverflowedChat(super::Chat),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Chat {
	#[prost(string, tag = "1")]
	pub content: String,
	#[prost(string, optional, tag = "2")]
	pub name: Option<String>,
	#[prost(int32, tag = "3")]
	pub vpos: i32,
	#[prost(enumeration = "chat::AccountStatus", tag = "4")]
	pub account_status: i32,
	#[prost(int64, optional, tag = "5")]
	pub raw_user_id: Option<i64>,
	#[prost(string, optional, tag = "6")]
	pub hashed_user_id: Option<String>,
	#[prost(int32, tag = "8")]
	pub no: i32,
}

pub mod chat {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum AccountStatus {
		Standard = 0,
		Premium = 1,
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimpleNotification {
	#[prost(oneof = "simple_notification::Message", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
	pub message: Option<simple_notification::Message>,
}

pub mod simple_notification {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Message {
		#[prost(string, tag = "1")]
		Ichiba(String),
		#[prost(string, tag = "2")]
		Quote(String),
		#[prost(string, tag = "3")]
		Emotion(String),
		#[prost(string, tag = "4")]
		Cruise(String),
		#[prost(string, tag = "5")]
		ProgramExtended(String),
		#[prost(string, tag = "6")]
		RankingIn(String),
		#[prost(string, tag = "7")]
		RankingUpdated(String),
		#[prost(string, tag = "8")]
		Visited(String),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Gift {
	#[prost(string, tag = "1")]
	pub item_id: String,
	#[prost(int64, optional, tag = "2")]
	pub advertiser_user_id: Option<i64>,
	#[prost(string, tag = "3")]
	pub advertiser_name: String,
	#[prost(int64, tag = "4")]
	pub point: i64,
	#[prost(string, tag = "5")]
	pub message: String,
	#[prost(string, tag = "6")]
	pub item_name: String,
	#[prost(int64, optional, tag = "7")]
	pub contribution_rank: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Nicoad {
	#[prost(message, optional, tag = "2")]
	pub v1: Option<nicoad::V1>,
}

pub mod nicoad {
	#[derive(Clone, PartialEq, ::prost::Message)]
	pub struct V1 {
		#[prost(int32, tag = "1")]
		pub total_ad_point: i32,
		#[prost(string, tag = "2")]
		pub message: String,
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NicoliveState {
	#[prost(message, optional, tag = "1")]
	pub statistics: Option<Statistics>,
	#[prost(message, optional, tag = "9")]
	pub program_status: Option<ProgramStatus>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Statistics {
	#[prost(int64, optional, tag = "1")]
	pub viewers: Option<i64>,
	#[prost(int64, optional, tag = "2")]
	pub comments: Option<i64>,
	#[prost(int64, optional, tag = "3")]
	pub ad_points: Option<i64>,
	#[prost(int64, optional, tag = "4")]
	pub gift_points: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProgramStatus {
	#[prost(enumeration = "program_status::State", tag = "1")]
	pub state: i32,
}

pub mod program_status {
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
	#[repr(i32)]
	pub enum State {
		Unknown = 0,
		Ended = 1,
	}
}
