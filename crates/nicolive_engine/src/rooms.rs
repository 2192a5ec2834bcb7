#![forbid(unsafe_code)]

use std::collections::HashMap;

use nicolive_domain::{RoomPosition, ThreadId};
use parking_lot::Mutex;
use tracing::debug;

use crate::ConnectContext;
use crate::api::ProgramRoom;

/// Stand rooms unlocked for channel programs, which carry no level.
pub const CHANNEL_STAND_ROOMS: usize = 5;

/// Number of stand rooms unlocked at a community level.
pub fn stand_room_count(level: Option<u32>) -> usize {
	let Some(level) = level else {
		return CHANNEL_STAND_ROOMS;
	};
	match level {
		0..=49 => 1,
		50..=69 => 2,
		70..=104 => 3,
		105..=149 => 4,
		150..=189 => 5,
		190..=229 => 6,
		230..=255 => 7,
		_ => 9,
	}
}

/// Arena followed by every unlocked stand room, in opening order.
pub fn rooms_for(level: Option<u32>) -> Vec<RoomPosition> {
	RoomPosition::ALL
		.into_iter()
		.take(1 + stand_room_count(level))
		.collect()
}

/// Per-room dedup watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatNumbers {
	pub latest: u64,
	pub max_before_reconnect: u64,
}

#[derive(Debug, Default)]
struct RegistryState {
	numbers: [ChatNumbers; RoomPosition::COUNT],
	threads: HashMap<ThreadId, RoomPosition>,
	opened: usize,
}

/// Room bindings plus the sequence watermarks that survive reconnects.
#[derive(Debug, Default)]
pub struct RoomRegistry {
	state: Mutex<RegistryState>,
}

impl RoomRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Deliver only sequence numbers above the pre-reconnect watermark; always advances `latest`.
	pub fn should_deliver(&self, room: RoomPosition, no: u64) -> bool {
		let mut st = self.state.lock();
		let numbers = &mut st.numbers[room.index()];
		let deliver = no > numbers.max_before_reconnect;
		numbers.latest = numbers.latest.max(no);
		if !deliver {
			metrics::counter!("nicolive_chats_deduplicated_total").increment(1);
			debug!(%room, no, watermark = numbers.max_before_reconnect, "skipping duplicated chat");
		}
		deliver
	}

	/// Record a sequence number without a delivery decision (history replay).
	pub fn note_latest(&self, room: RoomPosition, no: u64) {
		let mut st = self.state.lock();
		let numbers = &mut st.numbers[room.index()];
		numbers.latest = numbers.latest.max(no);
	}

	pub fn numbers(&self, room: RoomPosition) -> ChatNumbers {
		self.state.lock().numbers[room.index()]
	}

	/// Reset watermarks for a fresh connect, or promote `latest` for a reconnect.
	pub fn mark_reconnect_boundary(&self, context: ConnectContext) {
		let mut st = self.state.lock();
		for numbers in st.numbers.iter_mut() {
			*numbers = match context {
				ConnectContext::Normal => ChatNumbers::default(),
				ConnectContext::Reconnect(_) => ChatNumbers {
					latest: numbers.latest,
					max_before_reconnect: numbers.latest,
				},
			};
		}
	}

	pub fn bind_thread(&self, room: RoomPosition, thread: ThreadId) {
		let mut st = self.state.lock();
		st.threads.retain(|_, r| *r != room);
		st.threads.insert(thread, room);
		st.opened = st.opened.max(room.index() + 1);
	}

	/// Room of a thread id; unknown threads belong to the arena.
	pub fn room_for_thread(&self, thread: &str) -> RoomPosition {
		let st = self.state.lock();
		st.threads
			.iter()
			.find(|(t, _)| t.as_str() == thread)
			.map(|(_, r)| *r)
			.unwrap_or(RoomPosition::Arena)
	}

	pub fn opened_count(&self) -> usize {
		self.state.lock().opened
	}

	/// Forget thread bindings; watermarks are kept.
	pub fn clear_threads(&self) {
		let mut st = self.state.lock();
		st.threads.clear();
		st.opened = 0;
	}

	/// Claim the advertised rooms that should open next.
	///
	/// The advertised list is positional (index 0 is the arena). Rooms open in
	/// ascending order right after the last opened one, and never past the
	/// unlocked count.
	pub fn plan_room_opens(&self, level: Option<u32>, advertised: &[ProgramRoom]) -> Vec<(RoomPosition, ProgramRoom)> {
		let unlocked = rooms_for(level);
		let mut st = self.state.lock();
		let mut planned = Vec::new();

		for (position, room) in unlocked.into_iter().zip(advertised).skip(st.opened) {
			let Ok(thread) = ThreadId::new(room.thread_id.clone()) else {
				break;
			};
			st.threads.insert(thread, position);
			st.opened = position.index() + 1;
			planned.push((position, room.clone()));
		}

		planned
	}
}
