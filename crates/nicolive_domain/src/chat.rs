#![forbid(unsafe_code)]

use core::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{RoomPosition, is_raw_user_id};

/// Account tier attached to every chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Premium {
	Ippan,
	Premium,
	System,
	Caster,
	Operator,
	Bsp,
	IppanTransparent,
}

impl Premium {
	/// Map a wire tier code. Unknown or missing codes are treated as a regular viewer.
	pub fn from_code(code: Option<i64>) -> Self {
		match code {
			Some(1) => Premium::Premium,
			Some(2) => Premium::System,
			Some(3) => Premium::Caster,
			Some(6) => Premium::Operator,
			Some(7) => Premium::Bsp,
			Some(24) => Premium::IppanTransparent,
			_ => Premium::Ippan,
		}
	}

	pub const fn code(self) -> i64 {
		match self {
			Premium::Ippan => 0,
			Premium::Premium => 1,
			Premium::System => 2,
			Premium::Caster => 3,
			Premium::Operator => 6,
			Premium::Bsp => 7,
			Premium::IppanTransparent => 24,
		}
	}

	pub const fn is_user(self) -> bool {
		matches!(self, Premium::Ippan | Premium::Premium | Premium::IppanTransparent)
	}

	pub const fn is_system(self) -> bool {
		matches!(self, Premium::System | Premium::Caster | Premium::Operator)
	}

	pub const fn is_bsp(self) -> bool {
		matches!(self, Premium::Bsp)
	}
}

impl fmt::Display for Premium {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			Premium::Ippan => "ippan",
			Premium::Premium => "premium",
			Premium::System => "system",
			Premium::Caster => "caster",
			Premium::Operator => "operator",
			Premium::Bsp => "bsp",
			Premium::IppanTransparent => "ippan_transparent",
		};
		write!(f, "{}({label})", self.code())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
	Ichiba,
	Quote,
	Emotion,
	Cruise,
	ProgramExtended,
	RankingIn,
	RankingUpdated,
	Visited,
}

/// Structured content carried next to (or instead of) a plain comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatPayload {
	Gift {
		item_id: String,
		item_name: String,
		advertiser_name: String,
		advertiser_user_id: Option<i64>,
		point: i64,
		message: String,
	},
	Nicoad {
		total_ad_point: i32,
		message: String,
	},
	Notification {
		notification: NotificationKind,
		text: String,
	},
}

/// Normalized chat record delivered to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
	pub room: RoomPosition,
	/// Per-room sequence number; `0` when the transport has none.
	pub no: u64,
	pub date: SystemTime,
	pub date_usec: u32,
	pub mail: Vec<String>,
	pub user_id: String,
	pub premium: Premium,
	pub anonymous: bool,
	pub content: String,
	pub payload: Option<ChatPayload>,
}

impl ChatEvent {
	/// Build a timestamp from unix seconds + microsecond fraction.
	pub fn timestamp(unix_secs: i64, usec: u32) -> SystemTime {
		let secs = Duration::from_secs(unix_secs.max(0) as u64);
		UNIX_EPOCH + secs + Duration::from_micros(u64::from(usec.min(999_999)))
	}

	pub fn is_raw_user_id(&self) -> bool {
		is_raw_user_id(&self.user_id)
	}

	pub fn is_user_comment(&self) -> bool {
		self.premium.is_user()
	}

	pub fn is_system_comment(&self) -> bool {
		self.premium.is_system()
	}

	/// Server command asking the client to leave.
	pub fn is_disconnect_command(&self) -> bool {
		self.premium == Premium::System && self.content == "/disconnect"
	}

	/// Microseconds since the unix epoch (for ordering).
	pub fn unix_micros(&self) -> u128 {
		self.date.duration_since(UNIX_EPOCH).map(|d| d.as_micros()).unwrap_or_default()
	}
}

impl fmt::Display for ChatEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"[{} #{}] {} {}: {}",
			self.room.short_label(),
			self.no,
			self.premium,
			self.user_id,
			self.content
		)
	}
}
