#![forbid(unsafe_code)]

use std::future::Future;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::SecretString;
use crate::api::{ApiError, refresh_access_token};

/// Source of the bearer token used for every authenticated REST call.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
	fn access_token(&self) -> Option<SecretString>;

	/// Obtain a fresh access token, replacing the current one.
	async fn refresh(&self) -> anyhow::Result<SecretString>;

	/// Forget every stored credential.
	fn clear(&self);

	fn has_token(&self) -> bool {
		self.access_token().is_some_and(|t| !t.is_blank())
	}
}

/// Fixed token supplied by the consumer; cannot refresh.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
	token: RwLock<Option<SecretString>>,
}

impl StaticTokenProvider {
	pub fn new(token: Option<SecretString>) -> Self {
		Self {
			token: RwLock::new(token),
		}
	}

	pub fn set(&self, token: SecretString) {
		*self.token.write() = Some(token);
	}
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
	fn access_token(&self) -> Option<SecretString> {
		self.token.read().clone()
	}

	async fn refresh(&self) -> anyhow::Result<SecretString> {
		anyhow::bail!("static token provider cannot refresh")
	}

	fn clear(&self) {
		*self.token.write() = None;
	}
}

#[derive(Debug, Default)]
struct OAuthTokens {
	access: Option<SecretString>,
	refresh: Option<SecretString>,
}

/// OAuth token pair refreshed through the token endpoint.
#[derive(Debug)]
pub struct RefreshingTokenProvider {
	http: reqwest::Client,
	token_url: String,
	client_id: String,
	client_secret: SecretString,
	tokens: RwLock<OAuthTokens>,
	refresh_lock: tokio::sync::Mutex<()>,
}

impl RefreshingTokenProvider {
	pub fn new(
		http: reqwest::Client,
		token_url: impl Into<String>,
		client_id: impl Into<String>,
		client_secret: SecretString,
		access_token: Option<SecretString>,
		refresh_token: Option<SecretString>,
	) -> Self {
		Self {
			http,
			token_url: token_url.into(),
			client_id: client_id.into(),
			client_secret,
			tokens: RwLock::new(OAuthTokens {
				access: access_token,
				refresh: refresh_token,
			}),
			refresh_lock: tokio::sync::Mutex::new(()),
		}
	}
}

#[async_trait]
impl TokenProvider for RefreshingTokenProvider {
	fn access_token(&self) -> Option<SecretString> {
		self.tokens.read().access.clone()
	}

	async fn refresh(&self) -> anyhow::Result<SecretString> {
		let _guard = self.refresh_lock.lock().await;

		let Some(refresh_token) = self.tokens.read().refresh.clone() else {
			anyhow::bail!("no refresh token available");
		};
		if self.client_id.trim().is_empty() || self.client_secret.is_blank() {
			anyhow::bail!("oauth client credentials are not configured");
		}

		let resp = refresh_access_token(
			&self.http,
			&self.token_url,
			&self.client_id,
			self.client_secret.expose(),
			refresh_token.expose(),
		)
		.await?;

		let mut tokens = self.tokens.write();
		tokens.access = Some(resp.access_token.clone());
		if let Some(next) = resp.refresh_token {
			tokens.refresh = Some(next);
		}
		info!(expires_in = ?resp.expires_in, "refreshed access token");
		Ok(resp.access_token)
	}

	fn clear(&self) {
		let mut tokens = self.tokens.write();
		tokens.access = None;
		tokens.refresh = None;
	}
}

/// Run `call` with the current token; on an auth-expired error refresh once and retry once.
pub async fn with_token_refresh<T, F, Fut>(tokens: &dyn TokenProvider, mut call: F) -> Result<T, ApiError>
where
	F: FnMut(SecretString) -> Fut,
	Fut: Future<Output = Result<T, ApiError>>,
{
	let token = tokens.access_token().ok_or(ApiError::NoToken)?;

	match call(token).await {
		Err(e) if e.is_auth_expired() => {
			info!(error = %e, "access token rejected; refreshing");
			let token = tokens.refresh().await.map_err(|e| {
				warn!(error = %e, "token refresh failed");
				ApiError::RefreshFailed(e.to_string())
			})?;
			call(token).await
		}
		other => other,
	}
}
