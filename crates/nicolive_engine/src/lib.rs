#![forbid(unsafe_code)]

pub mod api;
pub mod auth;
pub mod facade;
pub mod health;
pub mod message;
pub mod ndgr;
pub mod orchestrator;
pub mod rooms;
pub mod single_flight;
pub mod watch;

use std::fmt;

use nicolive_domain::{ChatEvent, Live, LiveStatistics, RoomPosition, User};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

pub use api::{ApiError, NicoApi, NicoApiClient};
pub use auth::{RefreshingTokenProvider, StaticTokenProvider, TokenProvider};
pub use facade::NicoLiveClient;
pub use orchestrator::{EngineConfig, Orchestrator, WsConnector};

/// Default bound of the session event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Consumer-facing handshake failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum NicoError {
	#[error("internal error")]
	Internal,
	#[error("no live info")]
	NoLiveInfo,
	#[error("no message server info")]
	NoMessageServerInfo,
	#[error("failed to open message server")]
	OpenMessageServerFailed,
	#[error("program has not started")]
	NotStarted,
}

/// Why the engine is tearing down and retrying a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectReason {
	/// Socket failure or a server request.
	Normal,
	NoPong,
	NoTexts,
}

impl ReconnectReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			ReconnectReason::Normal => "normal",
			ReconnectReason::NoPong => "no_pong",
			ReconnectReason::NoTexts => "no_texts",
		}
	}
}

impl fmt::Display for ReconnectReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectContext {
	#[default]
	Normal,
	Reconnect(ReconnectReason),
}

impl ConnectContext {
	pub const fn is_reconnect(self) -> bool {
		matches!(self, ConnectContext::Reconnect(_))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisconnectContext {
	#[default]
	Normal,
	Reconnect(ReconnectReason),
}

/// Handshake stage, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeStage {
	VerifyToken,
	LiveInfo,
	UserInfo,
	WsEndpoint,
	MessageServer,
}

impl HandshakeStage {
	/// 1-based stage number.
	pub const fn number(self) -> u8 {
		self as u8 + 1
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionPhase {
	#[default]
	Idle,
	Connecting(HandshakeStage),
	Connected,
	Reconnecting,
}

/// Engine → consumer event.
#[derive(Debug, Clone)]
pub enum SessionEvent {
	NeedsToken,
	DidConfirmTokenExistence,
	WillPrepareLive,
	DidPrepareLive {
		user: User,
		live: Box<Live>,
		context: ConnectContext,
	},
	DidFailToPrepareLive {
		error: NicoError,
	},
	DidConnectToLive {
		room: RoomPosition,
		context: ConnectContext,
	},
	Chat(Box<ChatEvent>),
	WillReconnect {
		reason: ReconnectReason,
	},
	Statistics(LiveStatistics),
	ReceivingChatHistory {
		request_count: usize,
		total_chat_count: usize,
	},
	/// Backfilled chats, sorted by date.
	ChatHistory(Vec<ChatEvent>),
	DidDisconnect {
		context: DisconnectContext,
	},
	/// Human-readable progress note.
	Debug(String),
}

pub type SessionEventTx = mpsc::Sender<SessionEvent>;
pub type SessionEventRx = mpsc::Receiver<SessionEvent>;

/// Build a bounded event channel pair.
pub fn session_channel(capacity: usize) -> (SessionEventTx, SessionEventRx) {
	mpsc::channel(capacity.max(1))
}

/// Non-blocking event emitter shared by every engine task.
#[derive(Debug, Clone)]
pub struct EventSink {
	tx: SessionEventTx,
}

impl EventSink {
	pub fn new(tx: SessionEventTx) -> Self {
		Self { tx }
	}

	/// Deliver `event` without waiting; a full or closed channel drops it.
	pub fn emit(&self, event: SessionEvent) {
		match self.tx.try_send(event) {
			Ok(()) => {}
			Err(TrySendError::Full(_)) => {
				metrics::counter!("nicolive_events_dropped_total").increment(1);
				warn!("session event channel full; dropping event");
			}
			Err(TrySendError::Closed(_)) => {
				metrics::counter!("nicolive_events_dropped_total").increment(1);
			}
		}
	}

	/// Log a progress note and forward it to the consumer.
	pub fn debug(&self, msg: impl Into<String>) {
		let msg = msg.into();
		debug!(note = %msg, "session");
		self.emit(SessionEvent::Debug(msg));
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Generate an opaque session id.
pub fn new_session_id() -> Uuid {
	Uuid::new_v4()
}
