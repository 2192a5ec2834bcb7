#![forbid(unsafe_code)]

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ProgramId;

/// Viewer identity resolved during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	pub user_id: String,
	pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramProvider {
	pub provider_id: String,
	pub name: String,
	pub profile_url: String,
	pub icon_url: Option<String>,
}

/// One broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Live {
	pub program_id: ProgramId,
	pub title: String,
	/// Origin of `vpos` values.
	pub base_time: SystemTime,
	pub open_time: SystemTime,
	pub begin_time: SystemTime,
	pub is_time_shift: bool,
	pub provider: Option<ProgramProvider>,
	pub social_group_id: Option<String>,
	/// `None` for channel programs, which carry no level.
	pub community_level: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LiveStatistics {
	pub viewers: i64,
	pub comments: i64,
	pub ad_points: Option<i64>,
	pub gift_points: Option<i64>,
}
