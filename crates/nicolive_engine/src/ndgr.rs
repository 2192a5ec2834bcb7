#![forbid(unsafe_code)]

//! Segmented binary comment stream.
//!
//! A view URI yields a cursor stream of [`ChunkedEntry`] frames naming segment
//! URIs plus the `at` of the next view request. Each segment is fetched as its own
//! task and yields [`ChunkedMessage`] frames.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use nicolive_domain::{ChatEvent, ChatPayload, LiveStatistics, NotificationKind, Premium, RoomPosition};
use nicolive_protocol::ChunkedStreamDecoder;
use nicolive_protocol::pb::{
	ChunkedEntry, ChunkedMessage, NicoliveMessage, NicoliveState, PackedSegment, chunked_entry, chunked_message, nicolive_message,
	program_status, simple_notification,
};
use parking_lot::Mutex;
use prost::Message as _;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::rooms::RoomRegistry;
use crate::{EventSink, SessionEvent};

/// Distinct message ids remembered for dedup.
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Most backward history pages followed per connect.
pub const MAX_BACKWARD_PAGES: usize = 100;

pub type ByteStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// Opens a URI as a stream of raw byte chunks.
#[async_trait]
pub trait ByteStreamSource: Send + Sync + 'static {
	async fn open(&self, uri: &str) -> anyhow::Result<ByteStream>;
}

/// HTTP source reading response bodies chunk by chunk.
#[derive(Debug, Clone)]
pub struct HttpStreamSource {
	http: reqwest::Client,
}

impl HttpStreamSource {
	/// Streams stay open for minutes, so only connecting is time-bounded.
	pub fn new(user_agent: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent(user_agent)
			.connect_timeout(connect_timeout)
			.build()
			.context("build stream client")?;
		Ok(Self { http })
	}
}

#[async_trait]
impl ByteStreamSource for HttpStreamSource {
	async fn open(&self, uri: &str) -> anyhow::Result<ByteStream> {
		let resp = self
			.http
			.get(uri)
			.send()
			.await
			.with_context(|| format!("stream request {uri}"))?
			.error_for_status()
			.with_context(|| format!("stream status {uri}"))?;

		let chunks = stream::unfold(Some(resp), |resp| async move {
			let mut resp = resp?;
			match resp.chunk().await {
				Ok(Some(chunk)) => Some((Ok(chunk), Some(resp))),
				Ok(None) => None,
				Err(e) => Some((Err(anyhow::Error::new(e).context("stream chunk")), None)),
			}
		});
		Ok(chunks.boxed())
	}
}

/// Bounded set of recently seen message ids; oldest ids are evicted first.
#[derive(Debug)]
pub struct MessageIdSet {
	capacity: usize,
	inner: Mutex<SeenIds>,
}

#[derive(Debug, Default)]
struct SeenIds {
	ids: HashSet<String>,
	order: VecDeque<String>,
}

impl MessageIdSet {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			inner: Mutex::new(SeenIds::default()),
		}
	}

	/// Record `id`; `false` when it was already present.
	pub fn insert(&self, id: &str) -> bool {
		if id.is_empty() {
			return true;
		}
		let mut seen = self.inner.lock();
		if seen.ids.contains(id) {
			return false;
		}
		while seen.order.len() >= self.capacity {
			if let Some(old) = seen.order.pop_front() {
				seen.ids.remove(&old);
			}
		}
		seen.ids.insert(id.to_string());
		seen.order.push_back(id.to_string());
		true
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.inner.lock().order.len()
	}
}

/// Where the first view request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStart {
	Now,
	/// Unix seconds.
	At(i64),
}

/// Walker notifications the session supervisor acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkerSignal {
	/// A stream message arrived.
	Activity,
	/// The server reported the program as ended.
	ProgramEnded,
	/// A time-shifted replay caught up with the present.
	TimeShiftFinished,
}

#[derive(Debug, Clone)]
pub struct WalkerConfig {
	pub view_uri: String,
	pub start: WalkStart,
	pub is_time_shift: bool,
	/// Follow backward history pages (fresh connects only).
	pub fetch_backward: bool,
	pub max_backward_pages: usize,
	pub seen_capacity: usize,
}

impl WalkerConfig {
	pub fn new(view_uri: impl Into<String>) -> Self {
		Self {
			view_uri: view_uri.into(),
			start: WalkStart::Now,
			is_time_shift: false,
			fetch_backward: true,
			max_backward_pages: MAX_BACKWARD_PAGES,
			seen_capacity: DEFAULT_SEEN_CAPACITY,
		}
	}
}

#[derive(Debug, Default)]
struct HistoryBuffer {
	chats: Vec<ChatEvent>,
	flushed: bool,
}

struct WalkerShared {
	source: Arc<dyn ByteStreamSource>,
	sink: EventSink,
	rooms: Arc<RoomRegistry>,
	seen: MessageIdSet,
	history: Mutex<HistoryBuffer>,
	signals: mpsc::UnboundedSender<WalkerSignal>,
	/// Messages stamped before this are history.
	cutoff: SystemTime,
}

/// Follows the view cursor and fans segments out to fetch tasks.
pub struct PlaylistWalker {
	cfg: WalkerConfig,
	shared: Arc<WalkerShared>,
	cancel: CancellationToken,
}

impl PlaylistWalker {
	pub fn new(
		cfg: WalkerConfig,
		source: Arc<dyn ByteStreamSource>,
		sink: EventSink,
		rooms: Arc<RoomRegistry>,
		cancel: CancellationToken,
	) -> (Self, mpsc::UnboundedReceiver<WalkerSignal>) {
		let (signals, rx) = mpsc::unbounded_channel();
		let shared = Arc::new(WalkerShared {
			source,
			sink,
			rooms,
			seen: MessageIdSet::new(cfg.seen_capacity),
			history: Mutex::new(HistoryBuffer::default()),
			signals,
			cutoff: SystemTime::now(),
		});
		(Self { cfg, shared, cancel }, rx)
	}

	/// Walk until cancelled, the replay finishes, or the view stream fails.
	pub async fn run(self) -> anyhow::Result<()> {
		let mut at = self.cfg.start;
		let mut backward_pending = self.cfg.fetch_backward;
		let mut tasks = JoinSet::new();

		info!(view = %self.cfg.view_uri, ?at, time_shift = self.cfg.is_time_shift, "stream walker started");

		loop {
			let uri = view_url(&self.cfg.view_uri, at)?;
			let Some(mut view) = self.open(&uri).await? else {
				return Ok(());
			};

			let mut decoder = ChunkedStreamDecoder::<ChunkedEntry>::new();
			let mut next_at = None;

			loop {
				let chunk = tokio::select! {
					_ = self.cancel.cancelled() => return Ok(()),
					chunk = view.next() => chunk,
				};
				let Some(chunk) = chunk else { break };
				let chunk = chunk.context("view stream")?;

				for entry in decoder.feed(&chunk) {
					match entry.entry {
						Some(chunked_entry::Entry::Segment(segment)) => {
							self.spawn_segment(&mut tasks, segment.uri, false);
						}
						Some(chunked_entry::Entry::Previous(segment)) => {
							self.spawn_segment(&mut tasks, segment.uri, true);
						}
						Some(chunked_entry::Entry::Backward(backward)) => {
							let uri = backward.segment.map(|s| s.uri).unwrap_or_default();
							if backward_pending && !uri.is_empty() {
								backward_pending = false;
								self.spawn_backward(&mut tasks, uri);
							}
						}
						Some(chunked_entry::Entry::Next(next)) => next_at = Some(next.at),
						None => {}
					}
				}

				while tasks.try_join_next().is_some() {}
			}
			report_drops(&decoder);

			let next = next_at.ok_or_else(|| anyhow!("view stream ended without a next cursor"))?;
			if self.cfg.is_time_shift && next > unix_secs(SystemTime::now()) {
				self.finish_time_shift(&mut tasks).await;
				return Ok(());
			}
			debug!(next, "following view cursor");
			at = WalkStart::At(next);
		}
	}

	async fn open(&self, uri: &str) -> anyhow::Result<Option<ByteStream>> {
		tokio::select! {
			_ = self.cancel.cancelled() => Ok(None),
			stream = self.shared.source.open(uri) => stream.map(Some),
		}
	}

	async fn finish_time_shift(&self, tasks: &mut JoinSet<()>) {
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				joined = tasks.join_next() => if joined.is_none() { break },
			}
		}
		self.shared.flush_history();
		info!("time-shift replay reached the present");
		let _ = self.shared.signals.send(WalkerSignal::TimeShiftFinished);
	}

	fn spawn_segment(&self, tasks: &mut JoinSet<()>, uri: String, history: bool) {
		let shared = Arc::clone(&self.shared);
		let cancel = self.cancel.clone();
		tasks.spawn(async move {
			if let Err(e) = shared.read_segment(&cancel, &uri, history).await {
				warn!(error = ?e, %uri, "segment fetch failed");
			}
		});
	}

	fn spawn_backward(&self, tasks: &mut JoinSet<()>, uri: String) {
		let shared = Arc::clone(&self.shared);
		let cancel = self.cancel.clone();
		let max_pages = self.cfg.max_backward_pages;
		tasks.spawn(async move {
			if let Err(e) = shared.read_backward(&cancel, uri, max_pages).await {
				warn!(error = ?e, "backward history fetch failed");
			}
		});
	}
}

impl WalkerShared {
	async fn read_segment(&self, cancel: &CancellationToken, uri: &str, history: bool) -> anyhow::Result<()> {
		let mut stream = tokio::select! {
			_ = cancel.cancelled() => return Ok(()),
			stream = self.source.open(uri) => stream?,
		};
		let mut decoder = ChunkedStreamDecoder::<ChunkedMessage>::new();

		loop {
			let chunk = tokio::select! {
				_ = cancel.cancelled() => break,
				chunk = stream.next() => chunk,
			};
			let Some(chunk) = chunk else { break };
			let chunk = chunk.context("segment stream")?;
			for msg in decoder.feed(&chunk) {
				if let Some(chat) = self.on_message(msg, history) {
					self.push_history(vec![chat]);
				}
			}
		}
		report_drops(&decoder);
		Ok(())
	}

	async fn read_backward(&self, cancel: &CancellationToken, first: String, max_pages: usize) -> anyhow::Result<()> {
		let mut uri = Some(first);
		let mut pages = 0;

		while let Some(current) = uri.take() {
			if pages >= max_pages {
				debug!(pages, "backward page limit reached");
				break;
			}
			let Some(body) = self.read_all(cancel, &current).await? else {
				return Ok(());
			};
			let page = PackedSegment::decode(body).context("decode backward page")?;
			pages += 1;

			let chats: Vec<ChatEvent> = page.messages.into_iter().filter_map(|m| self.on_message(m, true)).collect();
			debug!(page = pages, chats = chats.len(), "backward page");
			self.push_history(chats);

			uri = page.next.map(|n| n.uri).filter(|u| !u.is_empty());
		}
		Ok(())
	}

	async fn read_all(&self, cancel: &CancellationToken, uri: &str) -> anyhow::Result<Option<Bytes>> {
		let mut stream = tokio::select! {
			_ = cancel.cancelled() => return Ok(None),
			stream = self.source.open(uri) => stream?,
		};
		let mut body = BytesMut::new();
		loop {
			let chunk = tokio::select! {
				_ = cancel.cancelled() => return Ok(None),
				chunk = stream.next() => chunk,
			};
			match chunk {
				Some(chunk) => body.extend_from_slice(&chunk.context("page stream")?),
				None => return Ok(Some(body.freeze())),
			}
		}
	}

	/// Handle one stream message. History chats are returned for buffering.
	fn on_message(&self, msg: ChunkedMessage, history: bool) -> Option<ChatEvent> {
		let meta = msg.meta.unwrap_or_default();
		if !self.seen.insert(&meta.id) {
			return None;
		}
		let _ = self.signals.send(WalkerSignal::Activity);

		let at = meta.at.map(timestamp_to_system).unwrap_or_else(SystemTime::now);
		match msg.payload? {
			chunked_message::Payload::Signal(signal) => {
				if signal == chunked_message::Signal::Flushed as i32 {
					self.flush_history();
				}
				None
			}
			chunked_message::Payload::State(state) => {
				self.on_state(state);
				None
			}
			chunked_message::Payload::Message(message) => {
				let chat = chat_from_message(message, at)?;
				if history || at < self.cutoff {
					if chat.no > 0 {
						self.rooms.note_latest(chat.room, chat.no);
					}
					return Some(chat);
				}
				self.flush_history();
				self.deliver(chat);
				None
			}
		}
	}

	fn on_state(&self, state: NicoliveState) {
		if let Some(stats) = state.statistics {
			self.sink.emit(SessionEvent::Statistics(LiveStatistics {
				viewers: stats.viewers.unwrap_or_default(),
				comments: stats.comments.unwrap_or_default(),
				ad_points: stats.ad_points,
				gift_points: stats.gift_points,
			}));
		}
		if state
			.program_status
			.is_some_and(|s| s.state == program_status::State::Ended as i32)
		{
			info!("program ended");
			let _ = self.signals.send(WalkerSignal::ProgramEnded);
		}
	}

	fn deliver(&self, chat: ChatEvent) {
		if chat.no > 0 && !self.rooms.should_deliver(chat.room, chat.no) {
			return;
		}
		metrics::counter!("nicolive_chats_delivered_total").increment(1);
		self.sink.emit(SessionEvent::Chat(Box::new(chat)));
	}

	/// Buffer history until the first flush; afterwards emit it as its own batch.
	fn push_history(&self, mut chats: Vec<ChatEvent>) {
		chats.retain(|c| self.is_new(c));
		if chats.is_empty() {
			return;
		}
		let mut history = self.history.lock();
		if !history.flushed {
			history.chats.append(&mut chats);
			return;
		}
		drop(history);
		chats.sort_by_key(|c| c.date);
		self.sink.emit(SessionEvent::ChatHistory(chats));
	}

	/// History replayed after a reconnect must clear the pre-reconnect watermark.
	fn is_new(&self, chat: &ChatEvent) -> bool {
		chat.no == 0 || chat.no > self.rooms.numbers(chat.room).max_before_reconnect
	}

	fn flush_history(&self) {
		let mut history = self.history.lock();
		if history.flushed {
			return;
		}
		history.flushed = true;
		let mut chats = std::mem::take(&mut history.chats);
		drop(history);

		chats.retain(|c| self.is_new(c));
		chats.sort_by_key(|c| c.date);
		debug!(count = chats.len(), "flushing stream history");
		if !chats.is_empty() {
			self.sink.emit(SessionEvent::ChatHistory(chats));
		}
	}
}

fn report_drops<M: prost::Message + Default>(decoder: &ChunkedStreamDecoder<M>) {
	let stats = decoder.stats();
	let dropped = stats.undecodable_frames + stats.oversized_frames + stats.carry_over_overflows;
	if dropped > 0 {
		metrics::counter!("nicolive_stream_frames_dropped_total").increment(dropped);
		debug!(?stats, "stream frames dropped");
	}
	let pending = decoder.pending_len();
	if pending > 0 {
		debug!(pending, "stream ended mid-frame");
	}
}

/// View request URL for a cursor.
pub fn view_url(view_uri: &str, at: WalkStart) -> anyhow::Result<String> {
	let mut url = Url::parse(view_uri).with_context(|| format!("invalid view uri {view_uri}"))?;
	let at = match at {
		WalkStart::Now => "now".to_string(),
		WalkStart::At(secs) => secs.to_string(),
	};
	url.query_pairs_mut().append_pair("at", &at);
	Ok(url.into())
}

fn timestamp_to_system(ts: prost_types::Timestamp) -> SystemTime {
	let secs = Duration::from_secs(ts.seconds.max(0) as u64);
	UNIX_EPOCH + secs + Duration::from_nanos(ts.nanos.clamp(0, 999_999_999) as u64)
}

fn unix_secs(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or_default()
}

fn system_chat(at: SystemTime, content: String, payload: ChatPayload) -> ChatEvent {
	ChatEvent {
		room: RoomPosition::Arena,
		no: 0,
		date: at,
		date_usec: usec_of(at),
		mail: Vec::new(),
		user_id: String::new(),
		premium: Premium::System,
		anonymous: false,
		content,
		payload: Some(payload),
	}
}

fn usec_of(t: SystemTime) -> u32 {
	t.duration_since(UNIX_EPOCH).map(|d| d.subsec_micros()).unwrap_or_default()
}

/// Normalize a stream message into a chat record, if it carries one.
pub fn chat_from_message(message: NicoliveMessage, at: SystemTime) -> Option<ChatEvent> {
	let chat = match message.data? {
		nicolive_message::Data::Chat(chat) | nicolive_message::Data::OverflowedChat(chat) => {
			let user_id = chat
				.raw_user_id
				.filter(|id| *id > 0)
				.map(|id| id.to_string())
				.or(chat.hashed_user_id)
				.unwrap_or_default();
			ChatEvent {
				room: RoomPosition::Arena,
				no: u64::try_from(chat.no).unwrap_or_default(),
				date: at,
				date_usec: usec_of(at),
				mail: Vec::new(),
				user_id,
				premium: if chat.account_status == 1 {
					Premium::Premium
				} else {
					Premium::Ippan
				},
				anonymous: chat.raw_user_id.is_none(),
				content: chat.content,
				payload: None,
			}
		}
		nicolive_message::Data::Gift(gift) => {
			let mut ev = system_chat(
				at,
				gift.message.clone(),
				ChatPayload::Gift {
					item_id: gift.item_id,
					item_name: gift.item_name,
					advertiser_name: gift.advertiser_name,
					advertiser_user_id: gift.advertiser_user_id,
					point: gift.point,
					message: gift.message,
				},
			);
			if let Some(id) = gift.advertiser_user_id {
				ev.user_id = id.to_string();
			}
			ev
		}
		nicolive_message::Data::Nicoad(nicoad) => {
			let v1 = nicoad.v1?;
			system_chat(
				at,
				v1.message.clone(),
				ChatPayload::Nicoad {
					total_ad_point: v1.total_ad_point,
					message: v1.message,
				},
			)
		}
		nicolive_message::Data::SimpleNotification(notification) => {
			use simple_notification::Message as N;
			let (kind, text) = match notification.message? {
				N::Ichiba(t) => (NotificationKind::Ichiba, t),
				N::Quote(t) => (NotificationKind::Quote, t),
				N::Emotion(t) => (NotificationKind::Emotion, t),
				N::Cruise(t) => (NotificationKind::Cruise, t),
				N::ProgramExtended(t) => (NotificationKind::ProgramExtended, t),
				N::RankingIn(t) => (NotificationKind::RankingIn, t),
				N::RankingUpdated(t) => (NotificationKind::RankingUpdated, t),
				N::Visited(t) => (NotificationKind::Visited, t),
			};
			system_chat(
				at,
				text.clone(),
				ChatPayload::Notification {
					notification: kind,
					text,
				},
			)
		}
	};
	Some(chat)
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use nicolive_protocol::pb::{Chat, Gift, MessageSegment, ReadyForNext, Statistics, packed_segment};

	use super::*;
	use crate::session_channel;

	#[derive(Default)]
	struct MemorySource {
		streams: Mutex<HashMap<String, Vec<Bytes>>>,
		hang: HashSet<String>,
	}

	impl MemorySource {
		fn with(mut self, uri: &str, chunks: Vec<Vec<u8>>) -> Self {
			self.streams
				.get_mut()
				.insert(uri.to_string(), chunks.into_iter().map(Bytes::from).collect());
			self
		}

		fn hanging(mut self, uri: &str) -> Self {
			self.hang.insert(uri.to_string());
			self
		}
	}

	#[async_trait]
	impl ByteStreamSource for MemorySource {
		async fn open(&self, uri: &str) -> anyhow::Result<ByteStream> {
			if self.hang.contains(uri) {
				return Ok(stream::pending().boxed());
			}
			let chunks = self
				.streams
				.lock()
				.get(uri)
				.cloned()
				.ok_or_else(|| anyhow!("no stream for {uri}"))?;
			Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
		}
	}

	fn framed<M: prost::Message>(items: &[M]) -> Vec<u8> {
		items.iter().flat_map(|m| m.encode_length_delimited_to_vec()).collect()
	}

	fn ts(secs: i64) -> prost_types::Timestamp {
		prost_types::Timestamp { seconds: secs, nanos: 0 }
	}

	fn chat_msg(id: &str, at: i64, no: i32, content: &str) -> ChunkedMessage {
		ChunkedMessage {
			meta: Some(chunked_message::Meta {
				id: id.to_string(),
				at: Some(ts(at)),
			}),
			payload: Some(chunked_message::Payload::Message(NicoliveMessage {
				data: Some(nicolive_message::Data::Chat(Chat {
					content: content.to_string(),
					name: None,
					vpos: 0,
					account_status: 0,
					raw_user_id: Some(42),
					hashed_user_id: None,
					no,
				})),
			})),
		}
	}

	fn flushed(id: &str) -> ChunkedMessage {
		ChunkedMessage {
			meta: Some(chunked_message::Meta {
				id: id.to_string(),
				at: None,
			}),
			payload: Some(chunked_message::Payload::Signal(chunked_message::Signal::Flushed as i32)),
		}
	}

	fn entry(e: chunked_entry::Entry) -> ChunkedEntry {
		ChunkedEntry { entry: Some(e) }
	}

	fn segment(uri: &str) -> MessageSegment {
		MessageSegment {
			from: None,
			until: None,
			uri: uri.to_string(),
		}
	}

	fn now_secs() -> i64 {
		unix_secs(SystemTime::now())
	}

	const VIEW: &str = "https://ndgr.test/view/v4/abc";

	fn walker(source: MemorySource, cfg: WalkerConfig) -> (PlaylistWalker, mpsc::UnboundedReceiver<WalkerSignal>, crate::SessionEventRx, CancellationToken) {
		let (tx, rx) = session_channel(256);
		let cancel = CancellationToken::new();
		let (w, signals) = PlaylistWalker::new(
			cfg,
			Arc::new(source),
			EventSink::new(tx),
			Arc::new(RoomRegistry::new()),
			cancel.clone(),
		);
		(w, signals, rx, cancel)
	}

	fn drain(rx: &mut crate::SessionEventRx) -> Vec<SessionEvent> {
		let mut out = Vec::new();
		while let Ok(ev) = rx.try_recv() {
			out.push(ev);
		}
		out
	}

	#[test]
	fn id_set_evicts_oldest() {
		let set = MessageIdSet::new(2);
		assert!(set.insert("a"));
		assert!(!set.insert("a"));
		assert!(set.insert("b"));
		assert!(set.insert("c"));
		assert_eq!(set.len(), 2);
		assert!(set.insert("a"));
		assert!(!set.insert("c"));
		assert!(set.insert(""));
		assert!(set.insert(""));
	}

	#[test]
	fn view_url_appends_cursor() {
		assert_eq!(view_url(VIEW, WalkStart::Now).unwrap(), format!("{VIEW}?at=now"));
		assert_eq!(
			view_url("https://ndgr.test/view?x=1", WalkStart::At(1_700_000_000)).unwrap(),
			"https://ndgr.test/view?x=1&at=1700000000"
		);
		assert!(view_url("not a url", WalkStart::Now).is_err());
	}

	#[test]
	fn gift_becomes_structured_chat() {
		let at = UNIX_EPOCH + Duration::from_micros(1_700_000_000_000_123);
		let chat = chat_from_message(
			NicoliveMessage {
				data: Some(nicolive_message::Data::Gift(Gift {
					item_id: "i1".to_string(),
					advertiser_user_id: Some(7),
					advertiser_name: "alice".to_string(),
					point: 500,
					message: "thanks".to_string(),
					item_name: "cake".to_string(),
					contribution_rank: None,
				})),
			},
			at,
		)
		.unwrap();
		assert_eq!(chat.premium, Premium::System);
		assert_eq!(chat.user_id, "7");
		assert_eq!(chat.date_usec, 123);
		assert!(matches!(chat.payload, Some(ChatPayload::Gift { point: 500, .. })));
		assert!(chat_from_message(NicoliveMessage { data: None }, at).is_none());
	}

	#[test]
	fn anonymous_chats_use_hashed_ids() {
		let chat = chat_from_message(
			NicoliveMessage {
				data: Some(nicolive_message::Data::Chat(Chat {
					content: "hi".to_string(),
					name: None,
					vpos: 0,
					account_status: 1,
					raw_user_id: None,
					hashed_user_id: Some("a:xyz".to_string()),
					no: 3,
				})),
			},
			UNIX_EPOCH,
		)
		.unwrap();
		assert!(chat.anonymous);
		assert_eq!(chat.user_id, "a:xyz");
		assert_eq!(chat.premium, Premium::Premium);
		assert_eq!(chat.no, 3);
	}

	#[tokio::test]
	async fn time_shift_buffers_history_and_finishes() {
		let begin = now_secs() - 3_600;
		let first_view = view_url(VIEW, WalkStart::At(begin)).unwrap();
		let view = framed(&[
			entry(chunked_entry::Entry::Segment(segment("https://ndgr.test/seg/1"))),
			entry(chunked_entry::Entry::Next(ReadyForNext { at: now_secs() + 3_600 })),
		]);
		let seg = framed(&[
			chat_msg("m2", begin + 20, 2, "second"),
			chat_msg("m1", begin + 10, 1, "first"),
			chat_msg("m1", begin + 10, 1, "first again"),
			flushed("f1"),
		]);
		// Split the segment mid-frame to exercise carry-over.
		let (a, b) = seg.split_at(seg.len() / 2 + 1);
		let source = MemorySource::default()
			.with(&first_view, vec![view])
			.with("https://ndgr.test/seg/1", vec![a.to_vec(), b.to_vec()]);

		let mut cfg = WalkerConfig::new(VIEW);
		cfg.start = WalkStart::At(begin);
		cfg.is_time_shift = true;
		let (w, mut signals, mut rx, _cancel) = walker(source, cfg);

		w.run().await.unwrap();

		let events = drain(&mut rx);
		let history: Vec<_> = events
			.iter()
			.filter_map(|e| match e {
				SessionEvent::ChatHistory(chats) => Some(chats.iter().map(|c| c.content.clone()).collect::<Vec<_>>()),
				_ => None,
			})
			.collect();
		assert_eq!(history, vec![vec!["first".to_string(), "second".to_string()]]);
		assert!(!events.iter().any(|e| matches!(e, SessionEvent::Chat(_))));

		let mut got = Vec::new();
		while let Ok(s) = signals.try_recv() {
			got.push(s);
		}
		assert_eq!(got.last(), Some(&WalkerSignal::TimeShiftFinished));
		assert_eq!(got.iter().filter(|s| **s == WalkerSignal::Activity).count(), 3);
	}

	#[tokio::test]
	async fn live_messages_flush_history_then_stream() {
		let now = now_secs();
		let first_view = view_url(VIEW, WalkStart::Now).unwrap();
		let second_view = view_url(VIEW, WalkStart::At(now + 60)).unwrap();
		let view = framed(&[
			entry(chunked_entry::Entry::Segment(segment("https://ndgr.test/seg/live"))),
			entry(chunked_entry::Entry::Next(ReadyForNext { at: now + 60 })),
		]);
		let seg = framed(&[
			chat_msg("old", now - 600, 10, "old"),
			chat_msg("new1", now + 30, 11, "new1"),
			chat_msg("new2", now + 31, 12, "new2"),
			ChunkedMessage {
				meta: Some(chunked_message::Meta {
					id: "st".to_string(),
					at: None,
				}),
				payload: Some(chunked_message::Payload::State(NicoliveState {
					statistics: Some(Statistics {
						viewers: Some(10),
						comments: Some(2),
						ad_points: None,
						gift_points: None,
					}),
					program_status: None,
				})),
			},
		]);
		let source = MemorySource::default()
			.with(&first_view, vec![view])
			.with("https://ndgr.test/seg/live", vec![seg])
			.hanging(&second_view);

		let (w, _signals, mut rx, cancel) = walker(source, WalkerConfig::new(VIEW));
		let run = tokio::spawn(w.run());

		let mut seen = Vec::new();
		while seen.len() < 4 {
			let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
			seen.push(ev);
		}
		assert!(matches!(&seen[0], SessionEvent::ChatHistory(c) if c.len() == 1 && c[0].content == "old"));
		assert!(matches!(&seen[1], SessionEvent::Chat(c) if c.content == "new1"));
		assert!(matches!(&seen[2], SessionEvent::Chat(c) if c.content == "new2"));
		assert!(matches!(&seen[3], SessionEvent::Statistics(s) if s.viewers == 10));

		cancel.cancel();
		run.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn overlapping_segments_deliver_each_message_once() {
		let now = now_secs();
		let first_view = view_url(VIEW, WalkStart::Now).unwrap();
		let second_view = view_url(VIEW, WalkStart::At(now + 60)).unwrap();
		let view = framed(&[
			entry(chunked_entry::Entry::Previous(segment("https://ndgr.test/seg/prev"))),
			entry(chunked_entry::Entry::Segment(segment("https://ndgr.test/seg/a"))),
			entry(chunked_entry::Entry::Segment(segment("https://ndgr.test/seg/b"))),
			entry(chunked_entry::Entry::Next(ReadyForNext { at: now + 60 })),
		]);
		// Same id and number in every segment; only the id set can tell them apart.
		let shared = chat_msg("dup", now + 30, 20, "dup");
		let source = MemorySource::default()
			.with(&first_view, vec![view])
			.with("https://ndgr.test/seg/prev", vec![framed(&[
				chat_msg("p", now - 30, 19, "prev"),
				shared.clone(),
			])])
			.with("https://ndgr.test/seg/a", vec![framed(&[shared.clone(), chat_msg("a", now + 31, 21, "a")])])
			.with("https://ndgr.test/seg/b", vec![framed(&[chat_msg("b", now + 32, 22, "b"), shared])])
			.hanging(&second_view);

		let (w, _signals, mut rx, cancel) = walker(source, WalkerConfig::new(VIEW));
		let run = tokio::spawn(w.run());

		let contents = |ev: SessionEvent| match ev {
			SessionEvent::Chat(c) => vec![c.content],
			SessionEvent::ChatHistory(chats) => chats.into_iter().map(|c| c.content).collect(),
			_ => Vec::new(),
		};
		let mut got = Vec::new();
		while got.len() < 4 {
			let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
			got.extend(contents(ev));
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
		got.extend(drain(&mut rx).into_iter().flat_map(contents));

		got.sort();
		assert_eq!(got, vec!["a", "b", "dup", "prev"]);

		cancel.cancel();
		run.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn backward_pages_are_followed_once() {
		let begin = now_secs() - 60;
		let first_view = view_url(VIEW, WalkStart::At(begin)).unwrap();
		let backward = || {
			entry(chunked_entry::Entry::Backward(nicolive_protocol::pb::BackwardSegment {
				until: None,
				segment: Some(packed_segment::Next {
					uri: "https://ndgr.test/back/1".to_string(),
				}),
				snapshot: None,
			}))
		};
		let view = framed(&[
			backward(),
			backward(),
			entry(chunked_entry::Entry::Next(ReadyForNext { at: now_secs() + 600 })),
		]);
		let page1 = PackedSegment {
			messages: vec![chat_msg("b2", begin - 10, 0, "b2")],
			next: Some(packed_segment::Next {
				uri: "https://ndgr.test/back/2".to_string(),
			}),
			snapshot: None,
		};
		let page2 = PackedSegment {
			messages: vec![chat_msg("b1", begin - 20, 0, "b1")],
			next: None,
			snapshot: None,
		};
		let source = MemorySource::default()
			.with(&first_view, vec![view])
			.with("https://ndgr.test/back/1", vec![page1.encode_to_vec()])
			.with("https://ndgr.test/back/2", vec![page2.encode_to_vec()]);

		let mut cfg = WalkerConfig::new(VIEW);
		cfg.start = WalkStart::At(begin);
		cfg.is_time_shift = true;
		let (w, _signals, mut rx, _cancel) = walker(source, cfg);
		w.run().await.unwrap();

		let events = drain(&mut rx);
		let batches: Vec<Vec<String>> = events
			.iter()
			.filter_map(|e| match e {
				SessionEvent::ChatHistory(c) => Some(c.iter().map(|c| c.content.clone()).collect()),
				_ => None,
			})
			.collect();
		assert_eq!(batches, vec![vec!["b1".to_string(), "b2".to_string()]]);
	}

	#[tokio::test]
	async fn missing_view_stream_is_an_error() {
		let (w, _signals, _rx, _cancel) = walker(MemorySource::default(), WalkerConfig::new(VIEW));
		assert!(w.run().await.is_err());
	}
}
