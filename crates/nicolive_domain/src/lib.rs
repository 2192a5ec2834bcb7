#![forbid(unsafe_code)]

mod chat;
mod live;

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chat::{ChatEvent, ChatPayload, NotificationKind, Premium};
pub use live::{Live, LiveStatistics, ProgramProvider, User};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown room: {0}")]
	UnknownRoom(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Live program identifier (`lv12345`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(String);

impl ProgramId {
	/// Create a `ProgramId` from an exact `lv<digits>` value.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match trimmed.strip_prefix("lv") {
			Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
				Ok(Self(trimmed.to_string()))
			}
			_ => Err(ParseIdError::InvalidFormat(format!("expected lv<digits>, got {trimmed}"))),
		}
	}

	/// Extract the first `lv<digits>` token from free text, e.g. a watch page URL.
	pub fn extract(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let mut rest = s;
		while let Some(pos) = rest.find("lv") {
			let tail = &rest[pos + 2..];
			let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
			if !digits.is_empty() {
				return Ok(Self(format!("lv{digits}")));
			}
			rest = tail;
		}

		Err(ParseIdError::InvalidFormat(format!("no program id in {s}")))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ProgramId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ProgramId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ProgramId::extract(s)
	}
}

/// Transport-level thread identifier addressing one room's comment feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
	/// Create a non-empty `ThreadId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ThreadId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Seating position of a room: arena followed by the lettered stand rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPosition {
	Arena,
	StandA,
	StandB,
	StandC,
	StandD,
	StandE,
	StandF,
	StandG,
	StandH,
	StandI,
	StandJ,
}

impl RoomPosition {
	/// All positions in opening order.
	pub const ALL: [RoomPosition; 11] = [
		RoomPosition::Arena,
		RoomPosition::StandA,
		RoomPosition::StandB,
		RoomPosition::StandC,
		RoomPosition::StandD,
		RoomPosition::StandE,
		RoomPosition::StandF,
		RoomPosition::StandG,
		RoomPosition::StandH,
		RoomPosition::StandI,
		RoomPosition::StandJ,
	];

	pub const COUNT: usize = Self::ALL.len();

	pub const fn index(self) -> usize {
		self as usize
	}

	pub fn from_index(index: usize) -> Option<Self> {
		Self::ALL.get(index).copied()
	}

	/// The next position in opening order (`None` after stand J).
	pub fn next(self) -> Option<Self> {
		Self::from_index(self.index() + 1)
	}

	/// Display label.
	pub const fn label(self) -> &'static str {
		match self {
			RoomPosition::Arena => "Arena",
			RoomPosition::StandA => "Stand A",
			RoomPosition::StandB => "Stand B",
			RoomPosition::StandC => "Stand C",
			RoomPosition::StandD => "Stand D",
			RoomPosition::StandE => "Stand E",
			RoomPosition::StandF => "Stand F",
			RoomPosition::StandG => "Stand G",
			RoomPosition::StandH => "Stand H",
			RoomPosition::StandI => "Stand I",
			RoomPosition::StandJ => "Stand J",
		}
	}

	/// One-column label used in compact listings.
	pub const fn short_label(self) -> &'static str {
		match self {
			RoomPosition::Arena => "@",
			RoomPosition::StandA => "A",
			RoomPosition::StandB => "B",
			RoomPosition::StandC => "C",
			RoomPosition::StandD => "D",
			RoomPosition::StandE => "E",
			RoomPosition::StandF => "F",
			RoomPosition::StandG => "G",
			RoomPosition::StandH => "H",
			RoomPosition::StandI => "I",
			RoomPosition::StandJ => "J",
		}
	}

	/// Stable snake_case identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomPosition::Arena => "arena",
			RoomPosition::StandA => "stand_a",
			RoomPosition::StandB => "stand_b",
			RoomPosition::StandC => "stand_c",
			RoomPosition::StandD => "stand_d",
			RoomPosition::StandE => "stand_e",
			RoomPosition::StandF => "stand_f",
			RoomPosition::StandG => "stand_g",
			RoomPosition::StandH => "stand_h",
			RoomPosition::StandI => "stand_i",
			RoomPosition::StandJ => "stand_j",
		}
	}
}

impl fmt::Display for RoomPosition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomPosition {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let lowered = s.to_ascii_lowercase().replace([' ', '-'], "_");
		Self::ALL
			.into_iter()
			.find(|p| p.as_str() == lowered)
			.ok_or_else(|| ParseIdError::UnknownRoom(s.to_string()))
	}
}

/// Whether `user_id` is a numeric account id rather than an anonymous hash.
pub fn is_raw_user_id(user_id: &str) -> bool {
	!user_id.is_empty() && user_id.bytes().all(|b| b.is_ascii_digit())
}
