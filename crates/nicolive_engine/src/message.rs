#![forbid(unsafe_code)]

//! Legacy message socket: JSON chat feed, thread-join frames and history paging.

use std::time::SystemTime;

use anyhow::Context;
use nicolive_domain::{ChatEvent, Premium, RoomPosition};
use serde::{Deserialize, Deserializer};

/// Websocket subprotocol the message server expects.
pub const MESSAGE_SUBPROTOCOL: &str = "msg.nicovideo.jp#json";

pub const THREAD_VERSION: &str = "20061206";
pub const DEFAULT_RES_FROM: i64 = -999;

/// Ping contents bracketing one thread request's replay.
pub const REPLAY_START: &str = "rs:0";
pub const REPLAY_FINISH: &str = "rf:0";

/// Most history pages requested before giving up on older chats.
pub const HISTORY_REQUEST_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatFrame {
	#[serde(deserialize_with = "string_or_number")]
	pub thread: String,
	#[serde(default)]
	pub no: u64,
	#[serde(default)]
	pub vpos: i64,
	pub date: i64,
	#[serde(default)]
	pub date_usec: u32,
	#[serde(default)]
	pub mail: Option<String>,
	#[serde(default)]
	pub user_id: String,
	#[serde(default)]
	pub premium: Option<i64>,
	#[serde(default)]
	pub anonymity: Option<i64>,
	#[serde(default)]
	pub content: String,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		S(String),
		N(i64),
	}
	Ok(match Raw::deserialize(deserializer)? {
		Raw::S(s) => s,
		Raw::N(n) => n.to_string(),
	})
}

impl ChatFrame {
	pub fn premium(&self) -> Premium {
		Premium::from_code(self.premium)
	}

	pub fn to_chat(&self, room: RoomPosition) -> ChatEvent {
		ChatEvent {
			room,
			no: self.no,
			date: ChatEvent::timestamp(self.date, self.date_usec),
			date_usec: self.date_usec,
			mail: self
				.mail
				.as_deref()
				.map(|m| m.split_whitespace().map(str::to_string).collect())
				.unwrap_or_default(),
			user_id: self.user_id.clone(),
			premium: self.premium(),
			anonymous: self.anonymity.is_some_and(|a| a != 0),
			content: self.content.clone(),
			payload: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageInbound {
	Chat(ChatFrame),
	Ping(String),
	/// Thread acknowledgements and anything else the feed sends.
	Other,
}

#[derive(Debug, Deserialize)]
struct MessageEnvelope {
	#[serde(default)]
	chat: Option<ChatFrame>,
	#[serde(default)]
	ping: Option<PingContent>,
}

#[derive(Debug, Deserialize)]
struct PingContent {
	content: String,
}

pub fn parse_message_frame(text: &str) -> anyhow::Result<MessageInbound> {
	let env: MessageEnvelope = serde_json::from_str(text).context("message frame parse")?;
	Ok(match (env.chat, env.ping) {
		(Some(chat), _) => MessageInbound::Chat(chat),
		(None, Some(ping)) => MessageInbound::Ping(ping.content),
		(None, None) => MessageInbound::Other,
	})
}

fn ping(content: &str) -> serde_json::Value {
	serde_json::json!({ "ping": { "content": content } })
}

/// Join frame for a thread, replaying from the server default backlog.
pub fn thread_join_frame(thread: &str, user_id: &str, thread_key: &str) -> String {
	serde_json::json!([
		ping(REPLAY_START),
		ping("ps:0"),
		{
			"thread": {
				"thread": thread,
				"version": THREAD_VERSION,
				"user_id": user_id,
				"res_from": DEFAULT_RES_FROM,
				"with_global": 1,
				"scores": 1,
				"nicoru": 0,
				"threadkey": thread_key,
			}
		},
		ping("pf:0"),
		ping(REPLAY_FINISH),
	])
	.to_string()
}

/// Join frame asking for the chats posted before `when` (unix seconds).
pub fn history_thread_frame(thread: &str, user_id: &str, when: i64) -> String {
	serde_json::json!([
		ping(REPLAY_START),
		ping("ps:0"),
		{
			"thread": {
				"thread": thread,
				"version": THREAD_VERSION,
				"when": when,
				"user_id": user_id,
				"res_from": DEFAULT_RES_FROM,
				"with_global": 1,
				"scores": 1,
				"nicoru": 0,
			}
		},
		ping("pf:0"),
		ping(REPLAY_FINISH),
	])
	.to_string()
}

/// What to do after a replay finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryNext {
	/// Ask for the page before this unix time.
	FetchBefore(i64),
	/// Backfill complete; chats sorted by date.
	Finished(Vec<ChatEvent>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
	/// `(request_count, total_chat_count)` when the page returned chats.
	pub progress: Option<(usize, usize)>,
	pub next: HistoryNext,
}

/// Collects replayed chats across history pages until a page comes back empty.
#[derive(Debug, Default)]
pub struct HistoryCollector {
	chats: Vec<ChatEvent>,
	earliest: Option<SystemTime>,
	request_count: usize,
	in_request: usize,
	done: bool,
}

impl HistoryCollector {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_done(&self) -> bool {
		self.done
	}

	pub fn on_replay_start(&mut self) {
		self.in_request = 0;
	}

	pub fn on_chat(&mut self, chat: ChatEvent) {
		self.earliest = Some(match self.earliest {
			Some(e) if e <= chat.date => e,
			_ => chat.date,
		});
		self.chats.push(chat);
		self.in_request += 1;
	}

	pub fn on_replay_finish(&mut self) -> HistoryPage {
		let received_any = self.in_request > 0;
		let progress = received_any.then_some((self.request_count, self.chats.len()));

		let exhausted = !received_any || self.request_count > HISTORY_REQUEST_LIMIT;
		let next = match self.earliest {
			Some(earliest) if !exhausted => {
				self.request_count += 1;
				HistoryNext::FetchBefore(unix_secs(earliest))
			}
			_ => {
				self.done = true;
				let mut chats = std::mem::take(&mut self.chats);
				chats.sort_by_key(|c| c.date);
				HistoryNext::Finished(chats)
			}
		};

		HistoryPage { progress, next }
	}
}

fn unix_secs(t: SystemTime) -> i64 {
	t.duration_since(SystemTime::UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frame(no: u64, date: i64) -> ChatFrame {
		ChatFrame {
			thread: "100".to_string(),
			no,
			vpos: 0,
			date,
			date_usec: 0,
			mail: None,
			user_id: "1".to_string(),
			premium: None,
			anonymity: None,
			content: format!("c{no}"),
		}
	}

	#[test]
	fn parses_chat_and_ping() {
		let chat = parse_message_frame(
			r#"{"chat":{"thread":"M.abc","no":12,"vpos":300,"date":1700000000,"date_usec":5,"mail":"184 white","user_id":"a:xyz","premium":1,"anonymity":1,"content":"hello"}}"#,
		)
		.unwrap();
		let MessageInbound::Chat(chat) = chat else {
			panic!("expected chat");
		};
		let ev = chat.to_chat(RoomPosition::Arena);
		assert_eq!(ev.no, 12);
		assert_eq!(ev.mail, vec!["184".to_string(), "white".to_string()]);
		assert_eq!(ev.premium, Premium::Premium);
		assert!(ev.anonymous);
		assert_eq!(ev.unix_micros(), 1_700_000_000_000_005);

		assert_eq!(
			parse_message_frame(r#"{"ping":{"content":"rs:0"}}"#).unwrap(),
			MessageInbound::Ping("rs:0".to_string())
		);
		assert_eq!(
			parse_message_frame(r#"{"thread":{"resultcode":0}}"#).unwrap(),
			MessageInbound::Other
		);
	}

	#[test]
	fn numeric_thread_ids_are_accepted() {
		let MessageInbound::Chat(chat) =
			parse_message_frame(r#"{"chat":{"thread":1234,"no":1,"date":1,"user_id":"1","content":"x"}}"#).unwrap()
		else {
			panic!("expected chat");
		};
		assert_eq!(chat.thread, "1234");
		assert_eq!(chat.premium(), Premium::Ippan);
	}

	#[test]
	fn join_frames_carry_thread_parameters() {
		let join: serde_json::Value = serde_json::from_str(&thread_join_frame("T1", "U1", "K1")).unwrap();
		let items = join.as_array().unwrap();
		assert_eq!(items.len(), 5);
		assert_eq!(items[0]["ping"]["content"], "rs:0");
		assert_eq!(items[4]["ping"]["content"], "rf:0");
		assert_eq!(items[2]["thread"]["thread"], "T1");
		assert_eq!(items[2]["thread"]["threadkey"], "K1");
		assert_eq!(items[2]["thread"]["res_from"], -999);

		let hist: serde_json::Value = serde_json::from_str(&history_thread_frame("T1", "U1", 1_700_000_000)).unwrap();
		assert_eq!(hist[2]["thread"]["when"], 1_700_000_000i64);
		assert!(hist[2]["thread"].get("threadkey").is_none());
	}

	#[test]
	fn history_pages_until_an_empty_replay() {
		let mut h = HistoryCollector::new();

		h.on_replay_start();
		h.on_chat(frame(3, 300).to_chat(RoomPosition::Arena));
		h.on_chat(frame(2, 200).to_chat(RoomPosition::Arena));
		let page = h.on_replay_finish();
		assert_eq!(page.progress, Some((0, 2)));
		assert_eq!(page.next, HistoryNext::FetchBefore(200));

		h.on_replay_start();
		h.on_chat(frame(1, 100).to_chat(RoomPosition::Arena));
		let page = h.on_replay_finish();
		assert_eq!(page.progress, Some((1, 3)));
		assert_eq!(page.next, HistoryNext::FetchBefore(100));

		h.on_replay_start();
		let page = h.on_replay_finish();
		assert_eq!(page.progress, None);
		let HistoryNext::Finished(chats) = page.next else {
			panic!("expected finish");
		};
		assert_eq!(chats.iter().map(|c| c.no).collect::<Vec<_>>(), vec![1, 2, 3]);
		assert!(h.is_done());
	}

	#[test]
	fn history_stops_after_request_limit() {
		let mut h = HistoryCollector::new();
		let mut pages = 0;
		loop {
			h.on_replay_start();
			h.on_chat(frame(1, 1_000_000 - pages).to_chat(RoomPosition::Arena));
			pages += 1;
			if let HistoryNext::Finished(chats) = h.on_replay_finish().next {
				assert_eq!(chats.len() as i64, pages);
				break;
			}
		}
		assert_eq!(pages as usize, HISTORY_REQUEST_LIMIT + 2);
	}
}
