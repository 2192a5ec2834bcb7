#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use nicolive_engine::{EngineConfig, SecretString};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.nicolive/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".nicolive").join("config.toml"))
}

/// Load the CLI config from TOML and process env overrides.
pub fn load_cli_config_from_path(path: &Path) -> anyhow::Result<CliConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = CliConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct CliConfig {
	/// Bearer token used when no refresh credentials are configured.
	pub access_token: Option<SecretString>,
	pub oauth: OAuthSettings,
	pub engine: EngineSettings,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Print engine progress notes next to chats.
	pub show_debug_events: bool,
}

/// Credentials for refreshing the access token; all three are needed.
#[derive(Debug, Clone, Default)]
pub struct OAuthSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
}

impl OAuthSettings {
	pub fn is_configured(&self) -> bool {
		self.client_id.is_some() && self.client_secret.is_some() && self.refresh_token.is_some()
	}
}

/// Engine overrides; unset fields keep `EngineConfig` defaults.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
	pub user_agent: Option<String>,
	pub request_timeout: Option<Duration>,
	pub reconnect_delay: Option<Duration>,
	pub event_capacity: Option<usize>,
}

impl EngineSettings {
	pub fn to_engine_config(&self) -> EngineConfig {
		let mut cfg = EngineConfig::default();
		if let Some(ua) = self.user_agent.clone() {
			cfg.user_agent = ua;
		}
		if let Some(timeout) = self.request_timeout {
			cfg.request_timeout = timeout;
		}
		if let Some(delay) = self.reconnect_delay {
			cfg.reconnect_delay = delay;
		}
		if let Some(capacity) = self.event_capacity {
			cfg.event_capacity = capacity;
		}
		cfg
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	access_token: Option<String>,
	metrics_bind: Option<String>,
	show_debug_events: Option<bool>,

	#[serde(default)]
	oauth: FileOAuthSettings,

	#[serde(default)]
	engine: FileEngineSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOAuthSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEngineSettings {
	user_agent: Option<String>,
	request_timeout_secs: Option<u64>,
	reconnect_delay_ms: Option<u64>,
	event_capacity: Option<usize>,
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.filter(|s| !s.trim().is_empty())
}

impl CliConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			access_token: non_blank(file.access_token).map(SecretString::new),
			oauth: OAuthSettings {
				client_id: non_blank(file.oauth.client_id),
				client_secret: non_blank(file.oauth.client_secret).map(SecretString::new),
				refresh_token: non_blank(file.oauth.refresh_token).map(SecretString::new),
			},
			engine: EngineSettings {
				user_agent: non_blank(file.engine.user_agent),
				request_timeout: file
					.engine
					.request_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs),
				reconnect_delay: file.engine.reconnect_delay_ms.map(Duration::from_millis),
				event_capacity: file.engine.event_capacity.filter(|v| *v > 0),
			},
			metrics_bind: non_blank(file.metrics_bind),
			show_debug_events: file.show_debug_events.unwrap_or(false),
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut CliConfig, env: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("NICOLIVE_ACCESS_TOKEN") {
		cfg.access_token = Some(SecretString::new(v));
		info!("auth: access_token overridden by env");
	}

	if let Some(v) = text("NICOLIVE_CLIENT_ID") {
		cfg.oauth.client_id = Some(v);
		info!("oauth: client_id overridden by env");
	}

	if let Some(v) = text("NICOLIVE_CLIENT_SECRET") {
		cfg.oauth.client_secret = Some(SecretString::new(v));
		info!("oauth: client_secret overridden by env");
	}

	if let Some(v) = text("NICOLIVE_REFRESH_TOKEN") {
		cfg.oauth.refresh_token = Some(SecretString::new(v));
		info!("oauth: refresh_token overridden by env");
	}

	if let Some(v) = text("NICOLIVE_USER_AGENT") {
		cfg.engine.user_agent = Some(v);
		info!("engine config: user_agent overridden by env");
	}

	if let Some(secs) = text("NICOLIVE_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok())
		&& secs > 0
	{
		cfg.engine.request_timeout = Some(Duration::from_secs(secs));
		info!(secs, "engine config: request_timeout overridden by env");
	}

	if let Some(ms) = text("NICOLIVE_RECONNECT_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
		cfg.engine.reconnect_delay = Some(Duration::from_millis(ms));
		info!(ms, "engine config: reconnect_delay overridden by env");
	}

	if let Some(capacity) = text("NICOLIVE_EVENT_CAPACITY").and_then(|v| v.parse::<usize>().ok())
		&& capacity > 0
	{
		cfg.engine.event_capacity = Some(capacity);
		info!(capacity, "engine config: event_capacity overridden by env");
	}

	if let Some(v) = text("NICOLIVE_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("cli config: metrics_bind overridden by env");
	}

	if let Some(show) = env("NICOLIVE_SHOW_DEBUG_EVENTS").and_then(|v| parse_env_bool(&v)) {
		cfg.show_debug_events = show;
		info!(show, "cli config: show_debug_events overridden by env");
	}

	let oauth = &cfg.oauth;
	let partial = oauth.client_id.is_some() || oauth.client_secret.is_some() || oauth.refresh_token.is_some();
	if partial && !oauth.is_configured() {
		warn!("oauth config incomplete (need client_id, client_secret and refresh_token); token refresh disabled");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml: &str) -> CliConfig {
		CliConfig::from_file(toml::from_str(toml).unwrap())
	}

	#[test]
	fn file_fields_map_to_settings() {
		let cfg = parse(
			r#"
access_token = "tok"
metrics_bind = "127.0.0.1:9100"

[oauth]
client_id = "cid"
client_secret = "secret"
refresh_token = "rt"

[engine]
user_agent = "test-agent"
request_timeout_secs = 5
reconnect_delay_ms = 500
"#,
		);

		assert_eq!(cfg.access_token.as_ref().map(SecretString::expose), Some("tok"));
		assert!(cfg.oauth.is_configured());
		assert_eq!(cfg.metrics_bind.as_deref(), Some("127.0.0.1:9100"));

		let engine = cfg.engine.to_engine_config();
		assert_eq!(engine.user_agent, "test-agent");
		assert_eq!(engine.request_timeout, Duration::from_secs(5));
		assert_eq!(engine.reconnect_delay, Duration::from_millis(500));
		assert_eq!(engine.event_capacity, EngineConfig::default().event_capacity);
	}

	#[test]
	fn blank_strings_and_zero_values_are_ignored() {
		let cfg = parse(
			r#"
access_token = "   "
metrics_bind = ""

[oauth]
client_id = ""

[engine]
request_timeout_secs = 0
event_capacity = 0
"#,
		);

		assert!(cfg.access_token.is_none());
		assert!(cfg.metrics_bind.is_none());
		assert!(cfg.oauth.client_id.is_none());
		assert!(cfg.engine.request_timeout.is_none());
		assert!(cfg.engine.event_capacity.is_none());
	}

	#[test]
	fn env_overrides_win_over_file() {
		let mut cfg = parse(
			r#"
access_token = "from-file"
show_debug_events = true
"#,
		);
		let env: HashMap<&str, &str> = HashMap::from([
			("NICOLIVE_ACCESS_TOKEN", " from-env "),
			("NICOLIVE_RECONNECT_DELAY_MS", "250"),
			("NICOLIVE_REQUEST_TIMEOUT_SECS", "nope"),
			("NICOLIVE_SHOW_DEBUG_EVENTS", "off"),
			("NICOLIVE_METRICS_BIND", ""),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.access_token.as_ref().map(SecretString::expose), Some("from-env"));
		assert_eq!(cfg.engine.reconnect_delay, Some(Duration::from_millis(250)));
		assert!(cfg.engine.request_timeout.is_none());
		assert!(!cfg.show_debug_events);
		assert!(cfg.metrics_bind.is_none());
	}

	#[test]
	fn env_bool_spellings() {
		assert_eq!(parse_env_bool("YES"), Some(true));
		assert_eq!(parse_env_bool(" 0 "), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let path = std::env::temp_dir().join("nicolive-missing-config-test").join("config.toml");
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}
}
