#![forbid(unsafe_code)]

//! Consumer-facing client: session control, username lookup and page URLs.

use std::collections::HashMap;
use std::sync::Arc;

use nicolive_domain::{Live, ParseIdError, ProgramId, User, is_raw_user_id};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::api::{NicoApi, NicoApiClient};
use crate::auth::TokenProvider;
use crate::orchestrator::{EngineConfig, Orchestrator};
use crate::{ConnectionPhase, NicoError, ReconnectReason, SessionEventRx, session_channel};

const USERNAME_QUEUE: usize = 256;

pub fn user_page_url(user_id: &str) -> String {
	format!("https://www.nicovideo.jp/user/{user_id}")
}

/// Icon URL of a numeric account; anonymous hashes have none.
pub fn user_icon_url(user_id: &str) -> Option<String> {
	if !is_raw_user_id(user_id) {
		return None;
	}
	let id: u64 = user_id.parse().ok()?;
	Some(format!(
		"https://secure-dcdn.cdn.nimg.jp/nicoaccount/usericon/{}/{id}.jpg",
		id / 10_000
	))
}

pub fn live_page_url(program: &ProgramId) -> String {
	format!("https://live.nicovideo.jp/watch/{program}")
}

pub fn community_page_url(community_id: &str) -> String {
	format!("https://com.nicovideo.jp/community/{community_id}")
}

pub fn ad_page_url(program: &ProgramId) -> String {
	format!("https://nicoad.nicovideo.jp/live/publish/{program}")
}

pub fn gift_page_url(program: &ProgramId) -> String {
	format!("https://nicoad.nicovideo.jp/nage/publish?content_id={program}")
}

struct UsernameRequest {
	user_id: String,
	reply: oneshot::Sender<Option<String>>,
}

/// Cached nickname lookup with a single worker, so at most one request is in flight.
#[derive(Clone)]
pub struct UsernameResolver {
	cache: Arc<RwLock<HashMap<String, String>>>,
	tx: mpsc::Sender<UsernameRequest>,
}

impl UsernameResolver {
	/// Start the worker task. Must be called from within a tokio runtime.
	pub fn spawn(api: Arc<dyn NicoApi>) -> Self {
		let cache = Arc::new(RwLock::new(HashMap::new()));
		let (tx, mut rx) = mpsc::channel::<UsernameRequest>(USERNAME_QUEUE);

		let worker_cache = Arc::clone(&cache);
		tokio::spawn(async move {
			while let Some(req) = rx.recv().await {
				let cached = worker_cache.read().get(&req.user_id).cloned();
				let name = match cached {
					Some(name) => Some(name),
					None => match api.user_nickname(&req.user_id).await {
						Ok(name) => {
							worker_cache.write().insert(req.user_id.clone(), name.clone());
							Some(name)
						}
						Err(e) => {
							warn!(error = %e, user_id = %req.user_id, "nickname lookup failed");
							None
						}
					},
				};
				let _ = req.reply.send(name);
			}
			debug!("username worker stopped");
		});

		Self { cache, tx }
	}

	pub fn cached(&self, user_id: &str) -> Option<String> {
		self.cache.read().get(user_id).cloned()
	}

	pub async fn resolve(&self, user_id: &str) -> Option<String> {
		if !is_raw_user_id(user_id) {
			return None;
		}
		if let Some(name) = self.cached(user_id) {
			return Some(name);
		}
		let (reply, rx) = oneshot::channel();
		self.tx
			.send(UsernameRequest {
				user_id: user_id.to_string(),
				reply,
			})
			.await
			.ok()?;
		rx.await.ok().flatten()
	}
}

/// Entry point for consumers: one live at a time, events on the returned receiver.
#[derive(Clone)]
pub struct NicoLiveClient {
	orch: Orchestrator,
	usernames: UsernameResolver,
}

impl NicoLiveClient {
	/// Build a client talking to the real service endpoints.
	pub fn new(cfg: EngineConfig, tokens: Arc<dyn TokenProvider>) -> anyhow::Result<(Self, SessionEventRx)> {
		let api = NicoApiClient::new(cfg.endpoints.clone(), &cfg.user_agent, cfg.request_timeout)?;
		Self::with_api(cfg, Arc::new(api), tokens)
	}

	pub fn with_api(
		cfg: EngineConfig,
		api: Arc<dyn NicoApi>,
		tokens: Arc<dyn TokenProvider>,
	) -> anyhow::Result<(Self, SessionEventRx)> {
		let (tx, rx) = session_channel(cfg.event_capacity);
		let usernames = UsernameResolver::spawn(Arc::clone(&api));
		let orch = Orchestrator::new(cfg, api, tokens, tx)?;
		Ok((Self { orch, usernames }, rx))
	}

	pub fn orchestrator(&self) -> &Orchestrator {
		&self.orch
	}

	/// Connect to a program given as `lv…` or any text containing one, such as a watch URL.
	pub async fn connect(&self, live: &str) -> Result<(), ParseIdError> {
		let program = ProgramId::extract(live)?;
		self.orch.connect(program).await;
		Ok(())
	}

	pub fn disconnect(&self) {
		self.orch.disconnect();
	}

	pub fn reconnect(&self, reason: ReconnectReason) -> bool {
		self.orch.reconnect(reason)
	}

	pub fn comment(&self, text: &str, anonymous: bool) -> Result<(), NicoError> {
		self.orch.comment(text, anonymous)
	}

	/// Leave the live and forget stored credentials.
	pub fn logout(&self) {
		self.orch.disconnect();
		self.orch.tokens().clear();
		info!("logged out");
	}

	pub fn live(&self) -> Option<Live> {
		self.orch.live()
	}

	pub fn user(&self) -> Option<User> {
		self.orch.user()
	}

	pub fn state(&self) -> ConnectionPhase {
		self.orch.phase()
	}

	pub fn cached_username(&self, user_id: &str) -> Option<String> {
		self.usernames.cached(user_id)
	}

	pub async fn resolve_username(&self, user_id: &str) -> Option<String> {
		self.usernames.resolve(user_id).await
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use async_trait::async_trait;

	use super::*;
	use crate::SecretString;
	use crate::api::{ApiError, ProgramRoom, UserInfoResponse, WatchProgramsResponse};

	#[derive(Default)]
	struct NicknameApi {
		calls: AtomicUsize,
	}

	#[async_trait]
	impl NicoApi for NicknameApi {
		async fn watch_program(&self, _: &SecretString, _: &ProgramId) -> Result<WatchProgramsResponse, ApiError> {
			Err(ApiError::Invalid("unused".to_string()))
		}

		async fn user_info(&self, _: &SecretString) -> Result<UserInfoResponse, ApiError> {
			Err(ApiError::Invalid("unused".to_string()))
		}

		async fn ws_endpoint(&self, _: &SecretString, _: &ProgramId, _: &str) -> Result<String, ApiError> {
			Err(ApiError::Invalid("unused".to_string()))
		}

		async fn program_rooms(&self, _: &SecretString, _: &ProgramId) -> Result<Vec<ProgramRoom>, ApiError> {
			Err(ApiError::Invalid("unused".to_string()))
		}

		async fn user_nickname(&self, user_id: &str) -> Result<String, ApiError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			tokio::time::sleep(Duration::from_millis(20)).await;
			if user_id == "404" {
				return Err(ApiError::Invalid("no such user".to_string()));
			}
			Ok(format!("user-{user_id}"))
		}
	}

	#[test]
	fn derived_urls() {
		let lv = ProgramId::new("lv123").unwrap();
		assert_eq!(user_page_url("42"), "https://www.nicovideo.jp/user/42");
		assert_eq!(
			user_icon_url("123456").as_deref(),
			Some("https://secure-dcdn.cdn.nimg.jp/nicoaccount/usericon/12/123456.jpg")
		);
		assert_eq!(
			user_icon_url("42").as_deref(),
			Some("https://secure-dcdn.cdn.nimg.jp/nicoaccount/usericon/0/42.jpg")
		);
		assert_eq!(user_icon_url("a:hash"), None);
		assert_eq!(live_page_url(&lv), "https://live.nicovideo.jp/watch/lv123");
		assert_eq!(community_page_url("co1"), "https://com.nicovideo.jp/community/co1");
		assert_eq!(ad_page_url(&lv), "https://nicoad.nicovideo.jp/live/publish/lv123");
		assert_eq!(gift_page_url(&lv), "https://nicoad.nicovideo.jp/nage/publish?content_id=lv123");
	}

	#[tokio::test]
	async fn concurrent_lookups_share_one_request() {
		let api = Arc::new(NicknameApi::default());
		let resolver = UsernameResolver::spawn(api.clone());

		let (a, b) = tokio::join!(resolver.resolve("42"), resolver.resolve("42"));
		assert_eq!(a.as_deref(), Some("user-42"));
		assert_eq!(b.as_deref(), Some("user-42"));
		assert_eq!(api.calls.load(Ordering::SeqCst), 1);
		assert_eq!(resolver.cached("42").as_deref(), Some("user-42"));
	}

	#[tokio::test]
	async fn hashed_ids_and_failures_resolve_to_none() {
		let api = Arc::new(NicknameApi::default());
		let resolver = UsernameResolver::spawn(api.clone());

		assert_eq!(resolver.resolve("a:xyz").await, None);
		assert_eq!(api.calls.load(Ordering::SeqCst), 0);

		assert_eq!(resolver.resolve("404").await, None);
		assert_eq!(resolver.cached("404"), None);
	}
}
