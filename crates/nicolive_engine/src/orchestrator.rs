#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use nicolive_domain::{ChatEvent, Live, ProgramId, RoomPosition, ThreadId, User};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::api::{ApiEndpoints, ApiError, NicoApi, ProgramRoom};
use crate::auth::{TokenProvider, with_token_refresh};
use crate::health::{HealthConfig, HealthMonitor, HealthRx, HealthSignal};
use crate::message::{
	HistoryCollector, HistoryNext, MESSAGE_SUBPROTOCOL, MessageInbound, REPLAY_FINISH, REPLAY_START, history_thread_frame,
	parse_message_frame, thread_join_frame,
};
use crate::ndgr::{
	ByteStreamSource, DEFAULT_SEEN_CAPACITY, HttpStreamSource, MAX_BACKWARD_PAGES, PlaylistWalker, WalkStart, WalkerConfig,
	WalkerSignal,
};
use crate::rooms::RoomRegistry;
use crate::single_flight::SingleFlight;
use crate::watch::{KEEP_SEAT, PONG, RoomData, START_WATCHING, WatchInbound, parse_watch_frame, post_comment_frame, vpos_at};
use crate::{
	ConnectContext, ConnectionPhase, DEFAULT_EVENT_CAPACITY, DisconnectContext, EventSink, HandshakeStage, NicoError,
	ReconnectReason, SecretString, SessionEvent, SessionEventTx, new_session_id,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type NicoWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket to open, with the subprotocol to request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsTarget {
	pub url: Url,
	pub protocol: Option<&'static str>,
}

pub type WsConnector = Arc<dyn Fn(WsTarget) -> BoxFuture<'static, anyhow::Result<NicoWs>> + Send + Sync>;

/// Engine tunables.
#[derive(Clone)]
pub struct EngineConfig {
	pub endpoints: ApiEndpoints,
	pub user_agent: String,
	pub request_timeout: Duration,
	pub health: HealthConfig,
	pub reconnect_delay: Duration,
	pub event_capacity: usize,
	pub seen_capacity: usize,
	pub max_backward_pages: usize,
	pub ws_connector: Option<WsConnector>,
	pub stream_source: Option<Arc<dyn ByteStreamSource>>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			endpoints: ApiEndpoints::default(),
			user_agent: format!("nicolive/{}", env!("CARGO_PKG_VERSION")),
			request_timeout: Duration::from_secs(10),
			health: HealthConfig::default(),
			reconnect_delay: Duration::from_secs(2),
			event_capacity: DEFAULT_EVENT_CAPACITY,
			seen_capacity: DEFAULT_SEEN_CAPACITY,
			max_backward_pages: MAX_BACKWARD_PAGES,
			ws_connector: None,
			stream_source: None,
		}
	}
}

impl std::fmt::Debug for EngineConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EngineConfig")
			.field("user_agent", &self.user_agent)
			.field("request_timeout", &self.request_timeout)
			.field("health", &self.health)
			.field("reconnect_delay", &self.reconnect_delay)
			.field("event_capacity", &self.event_capacity)
			.field("seen_capacity", &self.seen_capacity)
			.field("max_backward_pages", &self.max_backward_pages)
			.field("ws_connector", &self.ws_connector.is_some())
			.field("stream_source", &self.stream_source.is_some())
			.finish()
	}
}

async fn connect_ws(target: WsTarget) -> anyhow::Result<NicoWs> {
	let mut request = target.url.as_str().into_client_request().context("build ws request")?;
	if let Some(protocol) = target.protocol {
		request
			.headers_mut()
			.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
	}
	let (ws, _resp) = tokio_tungstenite::connect_async(request)
		.await
		.with_context(|| format!("connect_async to {}", target.url))?;
	Ok(ws)
}

struct SessionHandle {
	id: Uuid,
	cancel: CancellationToken,
	watch_tx: mpsc::UnboundedSender<Message>,
	health: Arc<HealthMonitor>,
}

#[derive(Default)]
struct State {
	phase: ConnectionPhase,
	on_going: Option<ProgramId>,
	last_established: Option<ProgramId>,
	live: Option<Live>,
	user: Option<User>,
	/// Token of the connect attempt in flight; becomes the session token on success.
	attempt: Option<CancellationToken>,
	session: Option<SessionHandle>,
	pending_reconnect: Option<CancellationToken>,
}

struct Inner {
	cfg: EngineConfig,
	api: Arc<dyn NicoApi>,
	tokens: Arc<dyn TokenProvider>,
	source: Arc<dyn ByteStreamSource>,
	connector: WsConnector,
	events: EventSink,
	rooms: Arc<RoomRegistry>,
	reconnect_flight: Arc<SingleFlight>,
	state: Mutex<State>,
}

/// Owns the single live session: handshake, socket tasks, timers and reconnects.
#[derive(Clone)]
pub struct Orchestrator {
	inner: Arc<Inner>,
}

enum MessageTarget {
	Room(RoomData),
	Stream { view_uri: String },
}

enum Transport {
	Legacy { ws: NicoWs, thread: ThreadId },
	Stream { view_uri: String },
}

struct Handshake {
	live: Live,
	user: User,
	watch: NicoWs,
	transport: Transport,
	keep_seat: Option<u64>,
}

/// Session task inputs.
#[derive(Debug)]
enum SessionInput {
	Watch(WatchInbound),
	Message(MessageInbound),
	Pong,
	Closed { socket: &'static str, error: Option<String> },
	Walker(WalkerSignal),
	WalkerFailed(String),
}

impl Orchestrator {
	pub fn new(
		cfg: EngineConfig,
		api: Arc<dyn NicoApi>,
		tokens: Arc<dyn TokenProvider>,
		events: SessionEventTx,
	) -> anyhow::Result<Self> {
		let source: Arc<dyn ByteStreamSource> = match &cfg.stream_source {
			Some(source) => Arc::clone(source),
			None => Arc::new(HttpStreamSource::new(&cfg.user_agent, cfg.request_timeout)?),
		};
		let connector: WsConnector = match &cfg.ws_connector {
			Some(c) => c.clone(),
			None => Arc::new(|target: WsTarget| {
				Box::pin(async move { connect_ws(target).await }) as BoxFuture<'static, anyhow::Result<NicoWs>>
			}),
		};

		Ok(Self {
			inner: Arc::new(Inner {
				cfg,
				api,
				tokens,
				source,
				connector,
				events: EventSink::new(events),
				rooms: Arc::new(RoomRegistry::new()),
				reconnect_flight: SingleFlight::new(),
				state: Mutex::new(State::default()),
			}),
		})
	}

	pub fn config(&self) -> &EngineConfig {
		&self.inner.cfg
	}

	pub fn api(&self) -> &Arc<dyn NicoApi> {
		&self.inner.api
	}

	pub fn tokens(&self) -> &Arc<dyn TokenProvider> {
		&self.inner.tokens
	}

	pub fn events(&self) -> &EventSink {
		&self.inner.events
	}

	pub fn rooms(&self) -> &RoomRegistry {
		&self.inner.rooms
	}

	pub fn phase(&self) -> ConnectionPhase {
		self.inner.state.lock().phase
	}

	pub fn live(&self) -> Option<Live> {
		self.inner.state.lock().live.clone()
	}

	pub fn user(&self) -> Option<User> {
		self.inner.state.lock().user.clone()
	}

	pub fn last_established(&self) -> Option<ProgramId> {
		self.inner.state.lock().last_established.clone()
	}

	pub fn session_id(&self) -> Option<Uuid> {
		self.inner.state.lock().session.as_ref().map(|s| s.id)
	}

	/// Connect to `program`, replacing any current session.
	pub async fn connect(&self, program: ProgramId) {
		self.connect_with(program, ConnectContext::Normal).await;
	}

	async fn connect_with(&self, program: ProgramId, context: ConnectContext) {
		let events = &self.inner.events;
		if !self.inner.tokens.has_token() {
			info!(%program, "no access token; connect skipped");
			events.emit(SessionEvent::NeedsToken);
			return;
		}
		events.emit(SessionEvent::DidConfirmTokenExistence);

		{
			let mut st = self.inner.state.lock();
			match context {
				ConnectContext::Normal => {
					if let Some(pending) = st.pending_reconnect.take() {
						pending.cancel();
					}
				}
				ConnectContext::Reconnect(_) => st.pending_reconnect = None,
			}
			st.on_going = Some(program.clone());
			st.last_established = None;
		}
		self.inner.rooms.mark_reconnect_boundary(context);
		self.teardown(DisconnectContext::Normal);

		let attempt = CancellationToken::new();
		self.inner.state.lock().attempt = Some(attempt.clone());

		info!(%program, ?context, "connecting");
		events.emit(SessionEvent::WillPrepareLive);

		match self.handshake(&program, context, &attempt).await {
			Ok(Some(hs)) => {
				self.establish(hs, context, attempt);
			}
			Ok(None) => debug!(%program, "connect attempt superseded"),
			Err(error) => self.fail(&attempt, error),
		}
	}

	fn enter_stage(&self, attempt: &CancellationToken, stage: HandshakeStage) -> bool {
		let mut st = self.inner.state.lock();
		if attempt.is_cancelled() {
			return false;
		}
		st.phase = ConnectionPhase::Connecting(stage);
		drop(st);
		self.inner.events.debug(format!("stage {}: {stage:?}", stage.number()));
		true
	}

	/// Run stages 1..5. `Ok(None)` when the attempt was cancelled midway.
	async fn handshake(
		&self,
		program: &ProgramId,
		context: ConnectContext,
		attempt: &CancellationToken,
	) -> Result<Option<Handshake>, NicoError> {
		let api = Arc::clone(&self.inner.api);

		if !self.enter_stage(attempt, HandshakeStage::VerifyToken) {
			return Ok(None);
		}
		if !self.inner.tokens.has_token() {
			return Err(NicoError::Internal);
		}

		if !self.enter_stage(attempt, HandshakeStage::LiveInfo) {
			return Ok(None);
		}
		let programs = self
			.call_api(|token| {
				let api = Arc::clone(&api);
				let program = program.clone();
				async move { api.watch_program(&token, &program).await }
			})
			.await
			.map_err(|e| {
				warn!(error = %e, %program, "program info request failed");
				NicoError::Internal
			})?;
		if programs.is_not_started() {
			info!(%program, "program has not started yet");
			return Err(NicoError::NotStarted);
		}
		let live = programs.to_live(program).map_err(|e| {
			warn!(error = %e, %program, "program info unusable");
			NicoError::Internal
		})?;

		if !self.enter_stage(attempt, HandshakeStage::UserInfo) {
			return Ok(None);
		}
		let user = self
			.call_api(|token| {
				let api = Arc::clone(&api);
				async move { api.user_info(&token).await }
			})
			.await
			.map_err(|e| {
				warn!(error = %e, "user info request failed");
				NicoError::Internal
			})?
			.to_user();

		if !self.enter_stage(attempt, HandshakeStage::WsEndpoint) {
			return Ok(None);
		}
		let endpoint = self
			.call_api(|token| {
				let api = Arc::clone(&api);
				let program = program.clone();
				let user_id = user.user_id.clone();
				async move { api.ws_endpoint(&token, &program, &user_id).await }
			})
			.await
			.map_err(|e| {
				warn!(error = %e, "websocket endpoint request failed");
				NicoError::Internal
			})?;
		let watch_url = Url::parse(&endpoint).map_err(|e| {
			warn!(error = %e, %endpoint, "websocket endpoint is not a url");
			NicoError::Internal
		})?;

		{
			let mut st = self.inner.state.lock();
			if attempt.is_cancelled() {
				return Ok(None);
			}
			st.live = Some(live.clone());
			st.user = Some(user.clone());
		}
		self.inner.events.emit(SessionEvent::DidPrepareLive {
			user: user.clone(),
			live: Box::new(live.clone()),
			context,
		});

		if !self.enter_stage(attempt, HandshakeStage::MessageServer) {
			return Ok(None);
		}
		let Some(mut watch) = self
			.open_ws(attempt, WsTarget {
				url: watch_url,
				protocol: None,
			})
			.await
			.map_err(|e| {
				warn!(error = ?e, "watch socket connect failed");
				NicoError::NoMessageServerInfo
			})?
		else {
			return Ok(None);
		};

		let (target, keep_seat) = match self.read_until_target(&mut watch, attempt).await {
			Ok(found) => found,
			Err(_) if attempt.is_cancelled() => return Ok(None),
			Err(e) => {
				warn!(error = ?e, "no message target from watch socket");
				return Err(NicoError::NoMessageServerInfo);
			}
		};

		let transport = match target {
			MessageTarget::Stream { view_uri } => {
				info!(%view_uri, "stream message server assigned");
				Transport::Stream { view_uri }
			}
			MessageTarget::Room(room) => {
				info!(room = %room.name, thread = %room.thread_id, "message room assigned");
				let thread = ThreadId::new(room.thread_id.clone()).map_err(|_| NicoError::NoMessageServerInfo)?;
				let ws = self
					.open_message_socket(attempt, &room, &user)
					.await
					.map_err(|e| {
						warn!(error = ?e, uri = %room.message_server.uri, "message socket connect failed");
						NicoError::OpenMessageServerFailed
					})?;
				let Some(ws) = ws else {
					return Ok(None);
				};
				self.inner.rooms.bind_thread(RoomPosition::Arena, thread.clone());
				Transport::Legacy { ws, thread }
			}
		};

		Ok(Some(Handshake {
			live,
			user,
			watch,
			transport,
			keep_seat,
		}))
	}

	async fn call_api<T, F, Fut>(&self, call: F) -> Result<T, ApiError>
	where
		F: FnMut(SecretString) -> Fut,
		Fut: Future<Output = Result<T, ApiError>>,
	{
		with_token_refresh(self.inner.tokens.as_ref(), call).await
	}

	async fn open_ws(&self, attempt: &CancellationToken, target: WsTarget) -> anyhow::Result<Option<NicoWs>> {
		tokio::select! {
			_ = attempt.cancelled() => Ok(None),
			ws = (self.inner.connector)(target) => ws.map(Some),
		}
	}

	async fn open_message_socket(
		&self,
		attempt: &CancellationToken,
		room: &RoomData,
		user: &User,
	) -> anyhow::Result<Option<NicoWs>> {
		let url = Url::parse(&room.message_server.uri).context("message server uri")?;
		let Some(mut ws) = self
			.open_ws(attempt, WsTarget {
				url,
				protocol: Some(MESSAGE_SUBPROTOCOL),
			})
			.await?
		else {
			return Ok(None);
		};
		let join = thread_join_frame(&room.thread_id, &user.user_id, room.your_post_key.as_deref().unwrap_or_default());
		ws.send(Message::text(join)).await.context("send thread join")?;
		Ok(Some(ws))
	}

	async fn read_until_target(
		&self,
		ws: &mut NicoWs,
		attempt: &CancellationToken,
	) -> anyhow::Result<(MessageTarget, Option<u64>)> {
		ws.send(Message::text(START_WATCHING)).await.context("send startWatching")?;

		let mut keep_seat = None;
		loop {
			let msg = tokio::select! {
				_ = attempt.cancelled() => anyhow::bail!("connect attempt cancelled"),
				msg = ws.next() => msg,
			};
			let Some(msg) = msg else {
				anyhow::bail!("watch socket closed before a message target");
			};

			match msg.context("watch socket read")? {
				Message::Text(t) => match parse_watch_frame(&t) {
					Ok(WatchInbound::Room(room)) => return Ok((MessageTarget::Room(room), keep_seat)),
					Ok(WatchInbound::MessageServer(ms)) => {
						return Ok((MessageTarget::Stream { view_uri: ms.view_uri }, keep_seat));
					}
					Ok(WatchInbound::Ping) => ws.send(Message::text(PONG)).await.context("send pong")?,
					Ok(WatchInbound::Seat { keep_interval_sec }) => keep_seat = Some(keep_interval_sec),
					Ok(WatchInbound::Statistics(stats)) => self.inner.events.emit(SessionEvent::Statistics(stats)),
					Ok(WatchInbound::Disconnect { reason }) => {
						anyhow::bail!("server disconnected during handshake: {reason:?}");
					}
					Ok(other) => debug!(?other, "ignoring watch frame during handshake"),
					Err(e) => debug!(error = ?e, "unparseable watch frame"),
				},
				Message::Close(c) => anyhow::bail!("watch socket closed before a message target: close={c:?}"),
				_ => {}
			}
		}
	}

	/// Handshake failure: drop partial state silently and report once.
	fn fail(&self, attempt: &CancellationToken, error: NicoError) {
		{
			let mut st = self.inner.state.lock();
			if attempt.is_cancelled() {
				return;
			}
			attempt.cancel();
			st.attempt = None;
			st.on_going = None;
			st.live = None;
			st.user = None;
			st.phase = ConnectionPhase::Idle;
		}
		self.inner.rooms.clear_threads();
		warn!(%error, "failed to prepare live");
		self.inner.events.emit(SessionEvent::DidFailToPrepareLive { error });
	}

	fn establish(&self, hs: Handshake, context: ConnectContext, token: CancellationToken) {
		let (health, health_rx) = HealthMonitor::new(&token, self.inner.cfg.health);
		let health = Arc::new(health);
		let (watch_tx, watch_rx) = mpsc::unbounded_channel();
		let id = new_session_id();

		{
			let mut st = self.inner.state.lock();
			if token.is_cancelled() {
				return;
			}
			st.last_established = st.on_going.take();
			st.phase = ConnectionPhase::Connected;
			st.session = Some(SessionHandle {
				id,
				cancel: token.clone(),
				watch_tx: watch_tx.clone(),
				health: Arc::clone(&health),
			});
		}

		let (input_tx, input_rx) = mpsc::unbounded_channel();
		spawn_socket("watch", hs.watch, watch_rx, token.clone(), input_tx.clone(), parse_watch_input);

		let (message_tx, history, ping_tx) = match hs.transport {
			Transport::Legacy { ws, thread } => {
				let (tx, rx) = mpsc::unbounded_channel();
				spawn_socket("message", ws, rx, token.clone(), input_tx.clone(), parse_message_input);
				let history = (!context.is_reconnect()).then(HistoryCollector::new);
				(Some((tx.clone(), thread)), history, tx)
			}
			Transport::Stream { view_uri } => {
				self.spawn_walker(&hs.live, view_uri, context, &token, input_tx.clone());
				(None, None, watch_tx.clone())
			}
		};

		health.start_ping_pong();
		// A later seat frame re-arms this with the server's interval.
		health.start_keep_seat(keep_seat_period(hs.keep_seat, &self.inner.cfg.health));
		if message_tx.is_some() {
			health.start_empty_message();
			health.start_room_poll();
		}
		// A fresh legacy session arms text silence once history is complete.
		if history.is_none() {
			health.touch_text();
		}

		info!(session = %id, program = %hs.live.program_id, ?context, "connected to live");
		self.inner.events.emit(SessionEvent::DidConnectToLive {
			room: RoomPosition::Arena,
			context,
		});

		let supervisor = SessionSupervisor {
			orch: self.clone(),
			id,
			token,
			health,
			watch_tx,
			message_tx,
			ping_tx,
			history,
			live: hs.live,
			user: hs.user,
		};
		tokio::spawn(supervisor.run(input_rx, health_rx));
	}

	fn spawn_walker(
		&self,
		live: &Live,
		view_uri: String,
		context: ConnectContext,
		token: &CancellationToken,
		input: mpsc::UnboundedSender<SessionInput>,
	) {
		let start = if live.is_time_shift {
			WalkStart::At(unix_secs(live.begin_time))
		} else {
			WalkStart::Now
		};
		let cfg = WalkerConfig {
			view_uri,
			start,
			is_time_shift: live.is_time_shift,
			fetch_backward: !context.is_reconnect(),
			max_backward_pages: self.inner.cfg.max_backward_pages,
			seen_capacity: self.inner.cfg.seen_capacity,
		};
		let (walker, mut signals) = PlaylistWalker::new(
			cfg,
			Arc::clone(&self.inner.source),
			self.inner.events.clone(),
			Arc::clone(&self.inner.rooms),
			token.clone(),
		);

		let forward = input.clone();
		tokio::spawn(async move {
			while let Some(signal) = signals.recv().await {
				if forward.send(SessionInput::Walker(signal)).is_err() {
					break;
				}
			}
		});
		tokio::spawn(async move {
			if let Err(e) = walker.run().await {
				let _ = input.send(SessionInput::WalkerFailed(format!("{e:#}")));
			}
		});
	}

	/// Tear down sockets, walker and timers. Emits only when something existed.
	fn teardown(&self, context: DisconnectContext) {
		let had_session = {
			let mut st = self.inner.state.lock();
			let had = st.live.is_some() || st.session.is_some();
			if let Some(attempt) = st.attempt.take() {
				attempt.cancel();
			}
			if let Some(session) = st.session.take() {
				session.health.stop_all();
				session.cancel.cancel();
				debug!(session = %session.id, "session torn down");
			}
			st.live = None;
			st.user = None;
			st.phase = ConnectionPhase::Idle;
			had
		};
		self.inner.rooms.clear_threads();

		if had_session {
			info!(?context, "disconnected");
			self.inner.events.emit(SessionEvent::DidDisconnect { context });
		}
	}

	/// Leave the current live and drop every pending retry.
	pub fn disconnect(&self) {
		{
			let mut st = self.inner.state.lock();
			if let Some(pending) = st.pending_reconnect.take() {
				pending.cancel();
			}
			st.on_going = None;
			st.last_established = None;
		}
		self.teardown(DisconnectContext::Normal);
	}

	/// Retry the last established connect after the reconnect delay.
	///
	/// Concurrent triggers collapse into one attempt; returns whether this call
	/// scheduled it. Must be called from within a tokio runtime.
	pub fn reconnect(&self, reason: ReconnectReason) -> bool {
		let Some(permit) = self.inner.reconnect_flight.try_acquire() else {
			debug!(%reason, "reconnect already in flight");
			return false;
		};
		let Some(program) = self.inner.state.lock().last_established.take() else {
			debug!(%reason, "nothing to reconnect to");
			return false;
		};

		metrics::counter!("nicolive_reconnects_total", "reason" => reason.as_str()).increment(1);
		warn!(%program, %reason, "reconnecting");

		self.teardown(DisconnectContext::Reconnect(reason));
		self.inner.events.emit(SessionEvent::WillReconnect { reason });

		let pending = CancellationToken::new();
		{
			let mut st = self.inner.state.lock();
			st.phase = ConnectionPhase::Reconnecting;
			if let Some(old) = st.pending_reconnect.replace(pending.clone()) {
				old.cancel();
			}
		}

		let orch = self.clone();
		let delay = self.inner.cfg.reconnect_delay;
		tokio::spawn(async move {
			let _permit = permit;
			tokio::select! {
				_ = pending.cancelled() => {
					debug!("pending reconnect cancelled");
					return;
				}
				_ = sleep(delay) => {}
			}
			orch.connect_with(program, ConnectContext::Reconnect(reason)).await;
		});
		true
	}

	/// Post a comment to the current live.
	pub fn comment(&self, text: &str, anonymous: bool) -> Result<(), NicoError> {
		let st = self.inner.state.lock();
		let live = st.live.as_ref().ok_or(NicoError::NoLiveInfo)?;
		let session = st.session.as_ref().ok_or(NicoError::NoMessageServerInfo)?;
		let vpos = vpos_at(live.base_time, SystemTime::now());
		session
			.watch_tx
			.send(Message::text(post_comment_frame(text, vpos, anonymous)))
			.map_err(|_| NicoError::Internal)?;
		debug!(vpos, anonymous, "comment posted");
		Ok(())
	}

	/// Advertised rooms of `program`, refreshing the token once if needed.
	pub async fn fetch_rooms(&self, program: &ProgramId) -> Result<Vec<ProgramRoom>, ApiError> {
		let api = Arc::clone(&self.inner.api);
		self.call_api(|token| {
			let api = Arc::clone(&api);
			let program = program.clone();
			async move { api.program_rooms(&token, &program).await }
		})
		.await
	}
}

/// Server-supplied keep-seat interval, or the configured default when absent or zero.
fn keep_seat_period(secs: Option<u64>, health: &HealthConfig) -> Duration {
	match secs {
		Some(secs) if secs > 0 => Duration::from_secs(secs),
		_ => health.keep_seat,
	}
}

fn unix_secs(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or_default()
}

fn parse_watch_input(text: &str) -> Option<SessionInput> {
	match parse_watch_frame(text) {
		Ok(frame) => Some(SessionInput::Watch(frame)),
		Err(e) => {
			debug!(error = ?e, "unparseable watch frame");
			None
		}
	}
}

fn parse_message_input(text: &str) -> Option<SessionInput> {
	if text.is_empty() {
		return Some(SessionInput::Message(MessageInbound::Other));
	}
	match parse_message_frame(text) {
		Ok(frame) => Some(SessionInput::Message(frame)),
		Err(e) => {
			debug!(error = ?e, "unparseable message frame");
			Some(SessionInput::Message(MessageInbound::Other))
		}
	}
}

/// Pump one websocket: outbound queue in, parsed frames out, until cancelled or closed.
fn spawn_socket(
	name: &'static str,
	mut ws: NicoWs,
	mut outbound: mpsc::UnboundedReceiver<Message>,
	token: CancellationToken,
	input: mpsc::UnboundedSender<SessionInput>,
	parse: fn(&str) -> Option<SessionInput>,
) {
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = token.cancelled() => {
					let _ = ws.close(None).await;
					break;
				}
				out = outbound.recv() => match out {
					Some(msg) => {
						if let Err(e) = ws.send(msg).await {
							let _ = input.send(SessionInput::Closed { socket: name, error: Some(e.to_string()) });
							break;
						}
					}
					None => break,
				},
				inbound = ws.next() => match inbound {
					Some(Ok(Message::Text(t))) => {
						if let Some(parsed) = parse(&t) {
							if input.send(parsed).is_err() {
								break;
							}
						}
					}
					Some(Ok(Message::Pong(_))) => {
						let _ = input.send(SessionInput::Pong);
					}
					Some(Ok(Message::Close(frame))) => {
						let _ = input.send(SessionInput::Closed {
							socket: name,
							error: frame.map(|f| format!("close {}: {}", f.code, f.reason)),
						});
						break;
					}
					Some(Ok(_)) => {}
					Some(Err(e)) => {
						let _ = input.send(SessionInput::Closed { socket: name, error: Some(e.to_string()) });
						break;
					}
					None => {
						let _ = input.send(SessionInput::Closed { socket: name, error: None });
						break;
					}
				},
			}
		}
		debug!(socket = name, "socket task stopped");
	});
}

/// Per-session task reacting to socket frames, walker signals and health timers.
struct SessionSupervisor {
	orch: Orchestrator,
	id: Uuid,
	token: CancellationToken,
	health: Arc<HealthMonitor>,
	watch_tx: mpsc::UnboundedSender<Message>,
	/// Legacy transport only: message socket and its arena thread.
	message_tx: Option<(mpsc::UnboundedSender<Message>, ThreadId)>,
	ping_tx: mpsc::UnboundedSender<Message>,
	history: Option<HistoryCollector>,
	live: Live,
	user: User,
}

impl SessionSupervisor {
	async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SessionInput>, mut health: HealthRx) {
		loop {
			tokio::select! {
				_ = self.token.cancelled() => break,
				input = inputs.recv() => match input {
					Some(input) => self.on_input(input),
					None => break,
				},
				signal = health.recv() => match signal {
					Some(signal) => self.on_health(signal),
					None => break,
				},
			}
		}
		debug!(session = %self.id, "session supervisor stopped");
	}

	fn events(&self) -> &EventSink {
		&self.orch.inner.events
	}

	fn rooms(&self) -> &RoomRegistry {
		&self.orch.inner.rooms
	}

	fn in_history(&self) -> bool {
		self.history.as_ref().is_some_and(|h| !h.is_done())
	}

	fn on_input(&mut self, input: SessionInput) {
		if self.token.is_cancelled() {
			return;
		}
		match input {
			SessionInput::Watch(frame) => self.on_watch(frame),
			SessionInput::Message(frame) => self.on_message(frame),
			SessionInput::Pong => self.health.record_pong(),
			SessionInput::Closed { socket, error } => {
				warn!(session = %self.id, socket, ?error, "socket closed");
				self.orch.reconnect(ReconnectReason::Normal);
			}
			SessionInput::Walker(WalkerSignal::Activity) => self.health.touch_text(),
			SessionInput::Walker(WalkerSignal::ProgramEnded | WalkerSignal::TimeShiftFinished) => self.orch.disconnect(),
			SessionInput::WalkerFailed(error) => {
				warn!(session = %self.id, %error, "stream walker failed");
				self.orch.reconnect(ReconnectReason::Normal);
			}
		}
	}

	fn on_watch(&mut self, frame: WatchInbound) {
		match frame {
			WatchInbound::Ping => {
				let _ = self.watch_tx.send(Message::text(PONG));
			}
			WatchInbound::Seat { keep_interval_sec } => {
				self.health
					.start_keep_seat(keep_seat_period(Some(keep_interval_sec), self.health.config()));
			}
			WatchInbound::Statistics(stats) => self.events().emit(SessionEvent::Statistics(stats)),
			WatchInbound::Disconnect { reason } => {
				info!(session = %self.id, ?reason, "server requested disconnect");
				self.orch.disconnect();
			}
			WatchInbound::Reconnect { wait_time_sec, .. } => {
				info!(session = %self.id, ?wait_time_sec, "server requested reconnect");
				self.orch.reconnect(ReconnectReason::Normal);
			}
			WatchInbound::Room(_) | WatchInbound::MessageServer(_) => {
				debug!(session = %self.id, "ignoring message target after connect");
			}
			WatchInbound::Unknown(kind) => debug!(%kind, "ignoring watch frame"),
		}
	}

	fn on_message(&mut self, frame: MessageInbound) {
		let in_history = self.in_history();
		if !in_history {
			self.health.touch_text();
		}
		match frame {
			MessageInbound::Chat(chat) if in_history => {
				let room = self.rooms().room_for_thread(&chat.thread);
				let chat = chat.to_chat(room);
				self.rooms().note_latest(room, chat.no);
				if let Some(history) = self.history.as_mut() {
					history.on_chat(chat);
				}
			}
			MessageInbound::Chat(chat) => {
				let room = self.rooms().room_for_thread(&chat.thread);
				self.on_chat(chat.to_chat(room));
			}
			MessageInbound::Ping(content) if in_history => self.on_history_ping(&content),
			MessageInbound::Ping(_) | MessageInbound::Other => {}
		}
	}

	fn on_chat(&mut self, chat: ChatEvent) {
		if chat.room != RoomPosition::Arena && !chat.premium.is_user() {
			debug!(room = %chat.room, premium = %chat.premium, "dropping non-user chat outside arena");
			return;
		}
		if !self.rooms().should_deliver(chat.room, chat.no) {
			return;
		}
		let disconnect = chat.is_disconnect_command();
		metrics::counter!("nicolive_chats_delivered_total").increment(1);
		self.events().emit(SessionEvent::Chat(Box::new(chat)));

		if disconnect {
			info!(session = %self.id, "received disconnect command");
			self.orch.disconnect();
		}
	}

	fn on_history_ping(&mut self, content: &str) {
		let Some(history) = self.history.as_mut() else {
			return;
		};
		match content {
			REPLAY_START => history.on_replay_start(),
			REPLAY_FINISH => {
				let page = history.on_replay_finish();
				if let Some((request_count, total_chat_count)) = page.progress {
					self.events().emit(SessionEvent::ReceivingChatHistory {
						request_count,
						total_chat_count,
					});
				}
				match page.next {
					HistoryNext::FetchBefore(when) => {
						if let Some((tx, thread)) = &self.message_tx {
							let frame = history_thread_frame(thread.as_str(), &self.user.user_id, when);
							let _ = tx.send(Message::text(frame));
						}
					}
					HistoryNext::Finished(chats) => {
						info!(session = %self.id, count = chats.len(), "chat history complete");
						self.events().emit(SessionEvent::ChatHistory(chats));
						if self.live.is_time_shift {
							self.orch.disconnect();
						} else {
							self.health.touch_text();
						}
					}
				}
			}
			_ => {}
		}
	}

	fn on_health(&mut self, signal: HealthSignal) {
		if self.token.is_cancelled() {
			return;
		}
		match signal {
			HealthSignal::KeepSeat => {
				let _ = self.watch_tx.send(Message::text(KEEP_SEAT));
			}
			HealthSignal::EmptyMessage => {
				if let Some((tx, _)) = &self.message_tx {
					let _ = tx.send(Message::text(""));
				}
			}
			HealthSignal::SendPing => {
				let _ = self.ping_tx.send(Message::Ping(Bytes::new()));
			}
			HealthSignal::PollRooms => self.poll_rooms(),
			HealthSignal::Alarm(reason) => {
				warn!(session = %self.id, %reason, "session unhealthy");
				self.orch.reconnect(reason);
			}
		}
	}

	/// Open newly advertised rooms over the message socket.
	fn poll_rooms(&self) {
		if self.in_history() {
			debug!("chat history in progress; skipping room poll");
			return;
		}
		let Some((tx, _)) = &self.message_tx else {
			return;
		};
		let tx = tx.clone();
		let orch = self.orch.clone();
		let token = self.token.clone();
		let program = self.live.program_id.clone();
		let level = self.live.community_level;
		let user_id = self.user.user_id.clone();

		tokio::spawn(async move {
			let rooms = tokio::select! {
				_ = token.cancelled() => return,
				rooms = orch.fetch_rooms(&program) => rooms,
			};
			let rooms = match rooms {
				Ok(rooms) => rooms,
				Err(e) => {
					warn!(error = %e, %program, "room list request failed");
					return;
				}
			};
			if token.is_cancelled() {
				return;
			}
			for (position, room) in orch.inner.rooms.plan_room_opens(level, &rooms) {
				let key = room.your_post_key.as_deref().unwrap_or_default();
				let _ = tx.send(Message::text(thread_join_frame(&room.thread_id, &user_id, key)));
				orch.inner
					.events
					.debug(format!("opened {} ({})", position.label(), room.thread_id));
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keep_seat_falls_back_to_default() {
		let health = HealthConfig::default();
		assert_eq!(keep_seat_period(None, &health), Duration::from_secs(30));
		assert_eq!(keep_seat_period(Some(0), &health), Duration::from_secs(30));
		assert_eq!(keep_seat_period(Some(45), &health), Duration::from_secs(45));
	}

	#[test]
	fn empty_message_frames_count_as_activity() {
		assert!(matches!(
			parse_message_input(""),
			Some(SessionInput::Message(MessageInbound::Other))
		));
		assert!(matches!(
			parse_message_input("garbage"),
			Some(SessionInput::Message(MessageInbound::Other))
		));
		assert!(parse_watch_input("garbage").is_none());
	}

	#[test]
	fn default_config_matches_documented_timers() {
		let cfg = EngineConfig::default();
		assert_eq!(cfg.request_timeout, Duration::from_secs(10));
		assert_eq!(cfg.reconnect_delay, Duration::from_secs(2));
		assert_eq!(cfg.event_capacity, 4096);
		assert_eq!(cfg.seen_capacity, 10_000);
		assert!(format!("{cfg:?}").contains("ws_connector: false"));
	}
}
