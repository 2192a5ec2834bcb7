#![forbid(unsafe_code)]

//! REST endpoints used during the handshake and by the username resolver.

use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use nicolive_domain::{Live, ProgramId, ProgramProvider, User};
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::SecretString;

pub const WATCH_PROGRAMS_URL: &str = "https://api.live2.nicovideo.jp/api/v1/watch/programs";
pub const USER_INFO_URL: &str = "https://oauth.nicovideo.jp/open_id/userinfo";
pub const WS_ENDPOINT_URL: &str = "https://api.live2.nicovideo.jp/api/v1/wsendpoint";
pub const USER_NICKNAME_URL: &str = "https://api.live2.nicovideo.jp/api/v1/user/nickname";
pub const PROGRAM_ROOMS_URL: &str = "https://api.live2.nicovideo.jp/api/v1/unama/programs/rooms";
pub const TOKEN_REFRESH_URL: &str = "https://oauth.nicovideo.jp/oauth2/token";

const WATCH_PROGRAM_FIELDS: &str = "program,programProvider,socialGroup";

/// Endpoint URLs; overridable so tests can point at a local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
	pub watch_programs: String,
	pub user_info: String,
	pub ws_endpoint: String,
	pub user_nickname: String,
	pub program_rooms: String,
	pub token_refresh: String,
}

impl Default for ApiEndpoints {
	fn default() -> Self {
		Self {
			watch_programs: WATCH_PROGRAMS_URL.to_string(),
			user_info: USER_INFO_URL.to_string(),
			ws_endpoint: WS_ENDPOINT_URL.to_string(),
			user_nickname: USER_NICKNAME_URL.to_string(),
			program_rooms: PROGRAM_ROOMS_URL.to_string(),
			token_refresh: TOKEN_REFRESH_URL.to_string(),
		}
	}
}

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("{label} send: {source}")]
	Transport {
		label: &'static str,
		#[source]
		source: reqwest::Error,
	},

	#[error("{label} auth failed (status={status})")]
	Auth { label: &'static str, status: u16 },

	#[error("{label} failed (status={status}) body={body}")]
	Status {
		label: &'static str,
		status: u16,
		body: String,
	},

	#[error("{label} parse json: {source}")]
	Parse {
		label: &'static str,
		#[source]
		source: serde_json::Error,
	},

	#[error("invalid response: {0}")]
	Invalid(String),

	#[error("no access token")]
	NoToken,

	#[error("token refresh failed: {0}")]
	RefreshFailed(String),
}

impl ApiError {
	/// The server rejected the bearer token (401/403).
	pub fn is_auth_expired(&self) -> bool {
		matches!(self, ApiError::Auth { .. })
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
	BeforeRelease,
	Released,
	OnAir,
	Ended,
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchProgramsResponse {
	pub data: WatchProgramsData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchProgramsData {
	pub program: WatchProgram,
	#[serde(default)]
	pub program_provider: Option<WatchProgramProvider>,
	#[serde(default)]
	pub social_group: Option<WatchSocialGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchProgram {
	pub title: String,
	pub schedule: WatchSchedule,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSchedule {
	pub begin_time: String,
	pub open_time: String,
	#[serde(default)]
	pub end_time: Option<String>,
	pub vpos_base_time: String,
	pub status: ScheduleStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchProgramProvider {
	pub name: String,
	pub profile_url: String,
	#[serde(default)]
	pub program_provider_id: Option<String>,
	#[serde(default)]
	pub icons: Option<WatchProviderIcons>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchProviderIcons {
	pub uri150x150: String,
	pub uri50x50: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSocialGroup {
	pub social_group_id: String,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub level: Option<u32>,
}

impl WatchProgramsResponse {
	pub fn is_not_started(&self) -> bool {
		matches!(
			self.data.program.schedule.status,
			ScheduleStatus::BeforeRelease | ScheduleStatus::Released
		)
	}

	pub fn to_live(&self, program_id: &ProgramId) -> Result<Live, ApiError> {
		let program = &self.data.program;
		let schedule = &program.schedule;

		Ok(Live {
			program_id: program_id.clone(),
			title: program.title.clone(),
			base_time: parse_rfc3339(&schedule.vpos_base_time)?,
			open_time: parse_rfc3339(&schedule.open_time)?,
			begin_time: parse_rfc3339(&schedule.begin_time)?,
			is_time_shift: schedule.status == ScheduleStatus::Ended,
			provider: self.data.program_provider.as_ref().map(WatchProgramProvider::to_provider),
			social_group_id: self.data.social_group.as_ref().map(|g| g.social_group_id.clone()),
			community_level: self.data.social_group.as_ref().and_then(|g| g.level),
		})
	}
}

impl WatchProgramProvider {
	fn to_provider(&self) -> ProgramProvider {
		// Channels carry no provider id; "https://ch.nicovideo.jp/channel/ch2648853" -> "ch2648853".
		let provider_id = self.program_provider_id.clone().unwrap_or_else(|| {
			self.profile_url
				.trim_end_matches('/')
				.rsplit('/')
				.next()
				.unwrap_or_default()
				.to_string()
		});
		ProgramProvider {
			provider_id,
			name: self.name.clone(),
			profile_url: self.profile_url.clone(),
			icon_url: Some(
				self.icons
					.as_ref()
					.map(|i| i.uri150x150.clone())
					.unwrap_or_else(|| self.profile_url.clone()),
			),
		}
	}
}

fn parse_rfc3339(s: &str) -> Result<SystemTime, ApiError> {
	DateTime::parse_from_rfc3339(s)
		.map(SystemTime::from)
		.map_err(|e| ApiError::Invalid(format!("bad timestamp {s:?}: {e}")))
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfoResponse {
	pub sub: String,
	pub nickname: String,
}

impl UserInfoResponse {
	pub fn to_user(&self) -> User {
		User {
			user_id: self.sub.clone(),
			nickname: self.nickname.clone(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsEndpointResponse {
	pub data: WsEndpointData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsEndpointData {
	pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserNicknameResponse {
	pub data: UserNicknameData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserNicknameData {
	pub nickname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramRoomsResponse {
	pub data: Vec<ProgramRoom>,
}

/// One server-advertised room.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramRoom {
	pub name: String,
	pub thread_id: String,
	#[serde(default)]
	pub web_socket_uri: Option<String>,
	#[serde(default)]
	pub xml_socket_uri: Option<String>,
	#[serde(default)]
	pub your_post_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenRefreshResponse {
	pub access_token: SecretString,
	#[serde(default)]
	pub refresh_token: Option<SecretString>,
	#[serde(default)]
	pub expires_in: Option<u64>,
}

/// REST surface the orchestrator and facade depend on.
#[async_trait]
pub trait NicoApi: Send + Sync + 'static {
	async fn watch_program(&self, token: &SecretString, program: &ProgramId) -> Result<WatchProgramsResponse, ApiError>;

	async fn user_info(&self, token: &SecretString) -> Result<UserInfoResponse, ApiError>;

	/// Resolve the watch websocket URL.
	async fn ws_endpoint(&self, token: &SecretString, program: &ProgramId, user_id: &str) -> Result<String, ApiError>;

	async fn program_rooms(&self, token: &SecretString, program: &ProgramId) -> Result<Vec<ProgramRoom>, ApiError>;

	/// Unauthenticated nickname lookup for a numeric user id.
	async fn user_nickname(&self, user_id: &str) -> Result<String, ApiError>;
}

#[derive(Clone, Debug)]
pub struct NicoApiClient {
	http: reqwest::Client,
	endpoints: ApiEndpoints,
}

impl NicoApiClient {
	pub fn new(endpoints: ApiEndpoints, user_agent: &str, timeout: Duration) -> anyhow::Result<Self> {
		let http = build_http_client(user_agent, timeout)?;
		Ok(Self { http, endpoints })
	}

	pub fn http(&self) -> &reqwest::Client {
		&self.http
	}

	pub fn endpoints(&self) -> &ApiEndpoints {
		&self.endpoints
	}

	async fn get_json<T: DeserializeOwned>(
		&self,
		url: String,
		token: Option<&SecretString>,
		label: &'static str,
	) -> Result<T, ApiError> {
		debug!(label, %url, "api request");
		let mut req = self.http.get(url);
		if let Some(token) = token {
			req = req.header(AUTHORIZATION, format!("Bearer {}", token.expose()));
		}

		let resp = req.send().await.map_err(|source| ApiError::Transport { label, source })?;
		let status = resp.status();

		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(ApiError::Auth {
				label,
				status: status.as_u16(),
			});
		}

		let body = resp.text().await.map_err(|source| ApiError::Transport { label, source })?;
		if !status.is_success() {
			return Err(ApiError::Status {
				label,
				status: status.as_u16(),
				body,
			});
		}

		serde_json::from_str(&body).map_err(|source| ApiError::Parse { label, source })
	}
}

/// Shared reqwest client settings.
pub fn build_http_client(user_agent: &str, timeout: Duration) -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent(user_agent)
		.timeout(timeout)
		.build()
		.context("build reqwest client")
}

#[async_trait]
impl NicoApi for NicoApiClient {
	async fn watch_program(&self, token: &SecretString, program: &ProgramId) -> Result<WatchProgramsResponse, ApiError> {
		let url = format!(
			"{}?nicoliveProgramId={}&fields={}",
			self.endpoints.watch_programs,
			urlencoding::encode(program.as_str()),
			urlencoding::encode(WATCH_PROGRAM_FIELDS),
		);
		self.get_json(url, Some(token), "GET watch/programs").await
	}

	async fn user_info(&self, token: &SecretString) -> Result<UserInfoResponse, ApiError> {
		self.get_json(self.endpoints.user_info.clone(), Some(token), "GET open_id/userinfo")
			.await
	}

	async fn ws_endpoint(&self, token: &SecretString, program: &ProgramId, user_id: &str) -> Result<String, ApiError> {
		let url = format!(
			"{}?nicoliveProgramId={}&userId={}",
			self.endpoints.ws_endpoint,
			urlencoding::encode(program.as_str()),
			urlencoding::encode(user_id),
		);
		let resp: WsEndpointResponse = self.get_json(url, Some(token), "GET wsendpoint").await?;
		Ok(resp.data.url)
	}

	async fn program_rooms(&self, token: &SecretString, program: &ProgramId) -> Result<Vec<ProgramRoom>, ApiError> {
		let url = format!(
			"{}?nicoliveProgramId={}",
			self.endpoints.program_rooms,
			urlencoding::encode(program.as_str()),
		);
		let resp: ProgramRoomsResponse = self.get_json(url, Some(token), "GET unama/programs/rooms").await?;
		Ok(resp.data)
	}

	async fn user_nickname(&self, user_id: &str) -> Result<String, ApiError> {
		let url = format!("{}?userId={}", self.endpoints.user_nickname, urlencoding::encode(user_id));
		let resp: UserNicknameResponse = self.get_json(url, None, "GET user/nickname").await?;
		Ok(resp.data.nickname)
	}
}

/// Exchange a refresh token for a new access token.
pub async fn refresh_access_token(
	http: &reqwest::Client,
	token_url: &str,
	client_id: &str,
	client_secret: &str,
	refresh_token: &str,
) -> anyhow::Result<TokenRefreshResponse> {
	let resp = http
		.post(token_url)
		.form(&[
			("grant_type", "refresh_token"),
			("client_id", client_id),
			("client_secret", client_secret),
			("refresh_token", refresh_token),
		])
		.send()
		.await
		.context("oauth refresh token request")?;

	let status = resp.status();
	let body = resp.text().await.context("oauth refresh token read body")?;

	if !status.is_success() {
		anyhow::bail!("oauth refresh token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("oauth refresh token parse json")
}
