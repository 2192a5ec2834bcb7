#![forbid(unsafe_code)]

//! Watch socket: JSON control plane frames.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use nicolive_domain::LiveStatistics;
use serde::Deserialize;
use serde::de::DeserializeOwned;

pub const START_WATCHING: &str = r#"{"type":"startWatching","data":{}}"#;
pub const KEEP_SEAT: &str = r#"{"type":"keepSeat"}"#;
pub const PONG: &str = r#"{"type":"pong"}"#;

/// Parsed inbound watch-socket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchInbound {
	Ping,
	Seat {
		keep_interval_sec: u64,
	},
	Room(RoomData),
	MessageServer(MessageServerData),
	Statistics(LiveStatistics),
	Disconnect {
		reason: Option<String>,
	},
	Reconnect {
		audience_token: Option<String>,
		wait_time_sec: Option<u64>,
	},
	/// Frame types this client does not act on.
	Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomData {
	pub name: String,
	pub message_server: RoomMessageServer,
	pub thread_id: String,
	#[serde(default)]
	pub your_post_key: Option<String>,
	#[serde(default)]
	pub is_first: bool,
	#[serde(default)]
	pub waybackkey: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomMessageServer {
	pub uri: String,
	#[serde(rename = "type")]
	pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageServerData {
	pub view_uri: String,
	#[serde(default)]
	pub vpos_base_time: Option<String>,
	#[serde(default)]
	pub hashed_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WatchPeek {
	#[serde(rename = "type")]
	kind: String,
}

#[derive(Debug, Deserialize)]
struct WatchEnvelope<T> {
	data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeatData {
	keep_interval_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsData {
	viewers: i64,
	comments: i64,
	#[serde(default)]
	ad_points: Option<i64>,
	#[serde(default)]
	gift_points: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct DisconnectData {
	#[serde(default)]
	reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconnectData {
	#[serde(default)]
	audience_token: Option<String>,
	#[serde(default)]
	wait_time_sec: Option<u64>,
}

/// Read just the `type` discriminator.
pub fn peek_frame_type(text: &str) -> anyhow::Result<String> {
	let peek: WatchPeek = serde_json::from_str(text).context("watch frame peek type")?;
	Ok(peek.kind)
}

fn data<T: DeserializeOwned>(text: &str, kind: &str) -> anyhow::Result<T> {
	let env: WatchEnvelope<T> = serde_json::from_str(text).with_context(|| format!("watch frame parse {kind}"))?;
	Ok(env.data)
}

fn optional_data<T: DeserializeOwned + Default>(text: &str, kind: &str) -> anyhow::Result<T> {
	#[derive(Deserialize)]
	struct Optional<T> {
		#[serde(default)]
		data: Option<T>,
	}
	let env: Optional<T> = serde_json::from_str(text).with_context(|| format!("watch frame parse {kind}"))?;
	Ok(env.data.unwrap_or_default())
}

pub fn parse_watch_frame(text: &str) -> anyhow::Result<WatchInbound> {
	let kind = peek_frame_type(text)?;
	let frame = match kind.as_str() {
		"ping" => WatchInbound::Ping,
		"seat" => {
			let seat: SeatData = data(text, "seat")?;
			WatchInbound::Seat {
				keep_interval_sec: seat.keep_interval_sec,
			}
		}
		"room" => WatchInbound::Room(data(text, "room")?),
		"messageServer" => WatchInbound::MessageServer(data(text, "messageServer")?),
		"statistics" => {
			let s: StatisticsData = data(text, "statistics")?;
			WatchInbound::Statistics(LiveStatistics {
				viewers: s.viewers,
				comments: s.comments,
				ad_points: s.ad_points,
				gift_points: s.gift_points,
			})
		}
		"disconnect" => {
			let d: DisconnectData = optional_data(text, "disconnect")?;
			WatchInbound::Disconnect { reason: d.reason }
		}
		"reconnect" => {
			let r: ReconnectData = optional_data(text, "reconnect")?;
			WatchInbound::Reconnect {
				audience_token: r.audience_token,
				wait_time_sec: r.wait_time_sec,
			}
		}
		_ => WatchInbound::Unknown(kind),
	};
	Ok(frame)
}

/// Comment position in centiseconds since `base_time`, at whole-second resolution.
pub fn vpos_at(base_time: SystemTime, now: SystemTime) -> i64 {
	(unix_secs(now) - unix_secs(base_time)) * 100
}

fn unix_secs(t: SystemTime) -> i64 {
	match t.duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_secs() as i64,
		Err(e) => -(e.duration().as_secs() as i64),
	}
}

pub fn post_comment_frame(text: &str, vpos: i64, anonymous: bool) -> String {
	serde_json::json!({
		"type": "postComment",
		"data": {
			"text": text,
			"vpos": vpos,
			"isAnonymous": anonymous,
		}
	})
	.to_string()
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn parses_control_frames() {
		assert_eq!(parse_watch_frame(r#"{"type":"ping"}"#).unwrap(), WatchInbound::Ping);
		assert_eq!(
			parse_watch_frame(r#"{"type":"seat","data":{"keepIntervalSec":30}}"#).unwrap(),
			WatchInbound::Seat { keep_interval_sec: 30 }
		);
		assert_eq!(
			parse_watch_frame(r#"{"type":"disconnect","data":{"reason":"END_PROGRAM"}}"#).unwrap(),
			WatchInbound::Disconnect {
				reason: Some("END_PROGRAM".to_string())
			}
		);
		assert_eq!(
			parse_watch_frame(r#"{"type":"reconnect","data":{"audienceToken":"abc","waitTimeSec":10}}"#).unwrap(),
			WatchInbound::Reconnect {
				audience_token: Some("abc".to_string()),
				wait_time_sec: Some(10)
			}
		);
	}

	#[test]
	fn parses_room_assignment() {
		let text = r#"{"type":"room","data":{"name":"arena","messageServer":{"uri":"wss://msgd.live2.nicovideo.jp/websocket","type":"niwavided"},"threadId":"M.abc","yourPostKey":"key","isFirst":true,"waybackkey":"wb"}}"#;
		let WatchInbound::Room(room) = parse_watch_frame(text).unwrap() else {
			panic!("expected room");
		};
		assert_eq!(room.thread_id, "M.abc");
		assert_eq!(room.message_server.kind, "niwavided");
		assert_eq!(room.your_post_key.as_deref(), Some("key"));
		assert!(room.is_first);
	}

	#[test]
	fn parses_message_server_and_statistics() {
		let ms = parse_watch_frame(
			r#"{"type":"messageServer","data":{"viewUri":"https://mpn.live.nicovideo.jp/api/view/v4/abc","vposBaseTime":"2024-01-01T00:00:00+09:00","hashedUserId":"a:xyz"}}"#,
		)
		.unwrap();
		let WatchInbound::MessageServer(ms) = ms else {
			panic!("expected messageServer");
		};
		assert_eq!(ms.view_uri, "https://mpn.live.nicovideo.jp/api/view/v4/abc");

		let stats = parse_watch_frame(r#"{"type":"statistics","data":{"viewers":10,"comments":3,"adPoints":100}}"#).unwrap();
		assert_eq!(
			stats,
			WatchInbound::Statistics(LiveStatistics {
				viewers: 10,
				comments: 3,
				ad_points: Some(100),
				gift_points: None,
			})
		);
	}

	#[test]
	fn unknown_types_are_ignored_not_errors() {
		assert_eq!(
			parse_watch_frame(r#"{"type":"akashic","data":{"x":1}}"#).unwrap(),
			WatchInbound::Unknown("akashic".to_string())
		);
		assert!(parse_watch_frame("not json").is_err());
	}

	#[test]
	fn vpos_is_whole_seconds_times_100() {
		let base = UNIX_EPOCH + Duration::from_secs(1_000);
		let now = base + Duration::from_millis(12_900);
		assert_eq!(vpos_at(base, now), 1_200);
	}

	#[test]
	fn post_comment_escapes_text() {
		let frame = post_comment_frame("hi \"there\"", 1_200, true);
		let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
		assert_eq!(v["type"], "postComment");
		assert_eq!(v["data"]["text"], "hi \"there\"");
		assert_eq!(v["data"]["vpos"], 1_200);
		assert_eq!(v["data"]["isAnonymous"], true);
	}
}
