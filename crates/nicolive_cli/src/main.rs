#![forbid(unsafe_code)]

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use metrics::Unit;
use metrics_exporter_prometheus::PrometheusBuilder;

use nicolive_domain::{ChatEvent, ChatPayload, ProgramId};
use nicolive_engine::api::build_http_client;
use nicolive_engine::facade::{live_page_url, user_page_url};
use nicolive_engine::{
	DisconnectContext, EngineConfig, NicoLiveClient, RefreshingTokenProvider, SessionEvent, StaticTokenProvider,
	TokenProvider,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::CliConfig;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: nicolive <lv…|watch URL> [--config PATH] [--comment TEXT] [--anonymous]\n\
\n\
Options:\n\
\t--config     Config file (default: ~/.nicolive/config.toml)\n\
\t--comment    Post TEXT once connected\n\
\t--anonymous  Post the comment anonymously\n\
\t--help       Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	program: ProgramId,
	config_path: Option<PathBuf>,
	comment: Option<String>,
	anonymous: bool,
}

fn parse_args() -> Args {
	let mut program = None;
	let mut config_path = None;
	let mut comment = None;
	let mut anonymous = false;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			"--comment" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--comment must be non-empty");
					usage_and_exit();
				}
				comment = Some(v);
			}
			"--anonymous" | "--184" => anonymous = true,
			other if other.starts_with("--") => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
			other => {
				let id = ProgramId::extract(other).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				});
				program = Some(id);
			}
		}
	}

	let Some(program) = program else {
		eprintln!("missing program id");
		usage_and_exit();
	};

	Args {
		program,
		config_path,
		comment,
		anonymous,
	}
}

fn init_rustls_crypto_provider() {
	if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
		debug!("rustls crypto provider already installed");
	}
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,nicolive_engine=debug".to_string());
	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn metrics_addr(bind: &str) -> anyhow::Result<SocketAddr> {
	bind.trim()
		.parse()
		.with_context(|| format!("invalid metrics bind address {bind:?} (expected host:port)"))
}

fn describe_engine_metrics() {
	metrics::describe_counter!("nicolive_reconnects_total", Unit::Count, "Session reconnects, by reason");
	metrics::describe_counter!("nicolive_chats_delivered_total", Unit::Count, "Chats handed to the consumer");
	metrics::describe_counter!(
		"nicolive_chats_deduplicated_total",
		Unit::Count,
		"Chats held back at or below the pre-reconnect watermark"
	);
	metrics::describe_counter!(
		"nicolive_events_dropped_total",
		Unit::Count,
		"Session events lost to a full or closed channel"
	);
	metrics::describe_counter!(
		"nicolive_stream_frames_dropped_total",
		Unit::Count,
		"Stream frames discarded while decoding"
	);
}

/// Serve the engine counters on `bind` for Prometheus to scrape.
fn init_metrics(bind: &str) -> anyhow::Result<SocketAddr> {
	let addr = metrics_addr(bind)?;
	PrometheusBuilder::new()
		.with_http_listener(addr)
		.install()
		.context("start prometheus exporter")?;
	describe_engine_metrics();
	Ok(addr)
}

fn token_provider(cfg: &CliConfig, engine: &EngineConfig) -> anyhow::Result<Arc<dyn TokenProvider>> {
	let oauth = &cfg.oauth;
	if let (Some(client_id), Some(secret), Some(refresh)) = (&oauth.client_id, &oauth.client_secret, &oauth.refresh_token) {
		let http = build_http_client(&engine.user_agent, engine.request_timeout)?;
		info!("using refreshable oauth credentials");
		return Ok(Arc::new(RefreshingTokenProvider::new(
			http,
			engine.endpoints.token_refresh.clone(),
			client_id.clone(),
			secret.clone(),
			cfg.access_token.clone(),
			Some(refresh.clone()),
		)));
	}
	if cfg.access_token.is_none() {
		warn!("no access token configured (set access_token or NICOLIVE_ACCESS_TOKEN)");
	}
	Ok(Arc::new(StaticTokenProvider::new(cfg.access_token.clone())))
}

fn print_chat(chat: &ChatEvent) {
	let who = if chat.anonymous { "184" } else { chat.user_id.as_str() };
	match &chat.payload {
		Some(ChatPayload::Gift {
			item_name,
			advertiser_name,
			point,
			..
		}) => println!("[{}] gift {item_name} from {advertiser_name} ({point}pt)", chat.room),
		Some(ChatPayload::Nicoad { message, .. }) => println!("[{}] ad: {message}", chat.room),
		Some(ChatPayload::Notification { text, .. }) => println!("[{}] info: {text}", chat.room),
		None => println!("[{}] #{} {who}: {}", chat.room, chat.no, chat.content),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	init_rustls_crypto_provider();

	let mut args = parse_args();

	let config_path = match args.config_path.take() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cli_cfg = crate::config::load_cli_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded cli config (toml + env overrides)");

	if let Some(bind) = cli_cfg.metrics_bind.as_deref() {
		match init_metrics(bind) {
			Ok(addr) => info!(%addr, "metrics exporter listening"),
			Err(e) => warn!(error = ?e, "metrics disabled"),
		}
	}

	let engine_cfg = cli_cfg.engine.to_engine_config();
	let tokens = token_provider(&cli_cfg, &engine_cfg)?;
	let (client, mut events) = NicoLiveClient::new(engine_cfg, tokens)?;

	info!(program = %args.program, url = %live_page_url(&args.program), "connecting");
	let connector = client.clone();
	let program = args.program.clone();
	tokio::spawn(async move { connector.orchestrator().connect(program).await });

	let shutdown = tokio::signal::ctrl_c();
	tokio::pin!(shutdown);

	loop {
		let ev = tokio::select! {
			_ = &mut shutdown => {
				info!("interrupted; disconnecting");
				client.disconnect();
				break;
			}
			ev = events.recv() => ev,
		};
		let Some(ev) = ev else {
			break;
		};

		match ev {
			SessionEvent::NeedsToken => {
				error!("an access token is required to connect");
				return Err(anyhow::anyhow!("no access token"));
			}
			SessionEvent::DidPrepareLive { user, live, context } => {
				info!(user = %user.nickname, profile = %user_page_url(&user.user_id), title = %live.title, ?context, "live prepared");
			}
			SessionEvent::DidFailToPrepareLive { error } => {
				error!(%error, "failed to prepare live");
				return Err(anyhow::anyhow!("connect failed: {error}"));
			}
			SessionEvent::DidConnectToLive { room, context } => {
				info!(%room, ?context, "connected");
				if let Some(text) = args.comment.take()
					&& let Err(e) = client.comment(&text, args.anonymous)
				{
					warn!(error = %e, "failed to post comment");
				}
			}
			SessionEvent::Chat(chat) => print_chat(&chat),
			SessionEvent::ChatHistory(chats) => {
				info!(count = chats.len(), "chat history");
				chats.iter().for_each(print_chat);
			}
			SessionEvent::ReceivingChatHistory {
				request_count,
				total_chat_count,
			} => info!(request_count, total_chat_count, "receiving chat history"),
			SessionEvent::Statistics(stats) => {
				info!(viewers = stats.viewers, comments = stats.comments, "statistics");
			}
			SessionEvent::WillReconnect { reason } => warn!(%reason, "reconnecting"),
			SessionEvent::DidDisconnect { context } => {
				info!(?context, "disconnected");
				if context == DisconnectContext::Normal {
					break;
				}
			}
			SessionEvent::Debug(msg) => {
				if cli_cfg.show_debug_events {
					println!("-- {msg}");
				}
			}
			SessionEvent::DidConfirmTokenExistence | SessionEvent::WillPrepareLive => {}
		}
	}

	Ok(())
}
