#![forbid(unsafe_code)]

//! Session watchdog timers.
//!
//! Each timer runs as its own task under a child of the session cancellation
//! token and reports through a [`HealthSignal`] channel; the session supervisor
//! performs the actual socket writes and reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ReconnectReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
	KeepSeat,
	EmptyMessage,
	PingPong,
	TextSilence,
	RoomPoll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
	/// Send `keepSeat` on the watch socket.
	KeepSeat,
	/// Send an empty text frame on the message socket.
	EmptyMessage,
	/// Send a transport ping.
	SendPing,
	/// Re-query the advertised room list.
	PollRooms,
	/// Liveness lost; reconnect.
	Alarm(ReconnectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
	pub keep_seat: Duration,
	pub empty_message: Duration,
	pub ping_interval: Duration,
	pub pong_timeout: Duration,
	pub text_silence: Duration,
	pub room_poll: Duration,
}

impl Default for HealthConfig {
	fn default() -> Self {
		Self {
			keep_seat: Duration::from_secs(30),
			empty_message: Duration::from_secs(60),
			ping_interval: Duration::from_secs(10),
			pong_timeout: Duration::from_secs(5),
			text_silence: Duration::from_secs(60),
			room_poll: Duration::from_secs(30),
		}
	}
}

pub type HealthTx = mpsc::UnboundedSender<HealthSignal>;
pub type HealthRx = mpsc::UnboundedReceiver<HealthSignal>;

#[derive(Debug)]
pub struct HealthMonitor {
	cfg: HealthConfig,
	root: CancellationToken,
	signals: HealthTx,
	timers: Mutex<HashMap<TimerKind, CancellationToken>>,
	last_pong: Arc<Mutex<Instant>>,
	last_text: Arc<Mutex<Instant>>,
}

impl HealthMonitor {
	/// Create a monitor whose timers all die with `session`.
	pub fn new(session: &CancellationToken, cfg: HealthConfig) -> (Self, HealthRx) {
		let (signals, rx) = mpsc::unbounded_channel();
		let now = Instant::now();
		let monitor = Self {
			cfg,
			root: session.child_token(),
			signals,
			timers: Mutex::new(HashMap::new()),
			last_pong: Arc::new(Mutex::new(now)),
			last_text: Arc::new(Mutex::new(now)),
		};
		(monitor, rx)
	}

	pub fn config(&self) -> &HealthConfig {
		&self.cfg
	}

	/// Cancel any running timer of `kind` and hand out a fresh token for it.
	fn replace_timer(&self, kind: TimerKind) -> CancellationToken {
		let token = self.root.child_token();
		if let Some(old) = self.timers.lock().insert(kind, token.clone()) {
			old.cancel();
		}
		token
	}

	#[cfg(test)]
	fn is_running(&self, kind: TimerKind) -> bool {
		self.timers.lock().get(&kind).is_some_and(|t| !t.is_cancelled())
	}

	#[cfg(test)]
	fn stop(&self, kind: TimerKind) {
		if let Some(token) = self.timers.lock().remove(&kind) {
			token.cancel();
		}
	}

	pub fn stop_all(&self) {
		self.root.cancel();
		self.timers.lock().clear();
		debug!("stopped all health timers");
	}

	fn spawn_periodic(&self, kind: TimerKind, period: Duration, signal: HealthSignal) {
		let token = self.replace_timer(kind);
		let tx = self.signals.clone();
		tokio::spawn(async move {
			let mut ticker = interval_at(Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = ticker.tick() => {
						if tx.send(signal).is_err() {
							break;
						}
					}
				}
			}
		});
	}

	/// (Re)start the keep-seat timer with the server-supplied period.
	pub fn start_keep_seat(&self, period: Duration) {
		debug!(period_secs = period.as_secs(), "keep-seat timer started");
		self.spawn_periodic(TimerKind::KeepSeat, period, HealthSignal::KeepSeat);
	}

	pub fn start_empty_message(&self) {
		self.spawn_periodic(TimerKind::EmptyMessage, self.cfg.empty_message, HealthSignal::EmptyMessage);
	}

	pub fn start_room_poll(&self) {
		self.spawn_periodic(TimerKind::RoomPoll, self.cfg.room_poll, HealthSignal::PollRooms);
	}

	/// Ping periodically; raise `NoPong` when no pong newer than the ping arrives in time.
	pub fn start_ping_pong(&self) {
		let token = self.replace_timer(TimerKind::PingPong);
		*self.last_pong.lock() = Instant::now();

		let tx = self.signals.clone();
		let last_pong = Arc::clone(&self.last_pong);
		let interval = self.cfg.ping_interval;
		let timeout = self.cfg.pong_timeout;

		tokio::spawn(async move {
			let mut ticker = interval_at(Instant::now() + interval, interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = ticker.tick() => {}
				}

				let ping_at = Instant::now();
				if tx.send(HealthSignal::SendPing).is_err() {
					break;
				}

				tokio::select! {
					_ = token.cancelled() => break,
					_ = sleep(timeout) => {}
				}

				if *last_pong.lock() <= ping_at {
					debug!("no pong for last ping");
					let _ = tx.send(HealthSignal::Alarm(ReconnectReason::NoPong));
					break;
				}
			}
			token.cancel();
		});
	}

	pub fn record_pong(&self) {
		*self.last_pong.lock() = Instant::now();
	}

	/// Note a received text frame, arming the silence timer on first use.
	pub fn touch_text(&self) {
		*self.last_text.lock() = Instant::now();

		let mut timers = self.timers.lock();
		if timers.get(&TimerKind::TextSilence).is_some_and(|t| !t.is_cancelled()) {
			return;
		}
		let token = self.root.child_token();
		timers.insert(TimerKind::TextSilence, token.clone());
		drop(timers);

		let tx = self.signals.clone();
		let last_text = Arc::clone(&self.last_text);
		let silence = self.cfg.text_silence;

		tokio::spawn(async move {
			loop {
				let deadline = *last_text.lock() + silence;
				tokio::select! {
					_ = token.cancelled() => break,
					_ = sleep_until(deadline) => {}
				}
				if Instant::now() >= *last_text.lock() + silence {
					debug!(silence_secs = silence.as_secs(), "no texts for a while");
					let _ = tx.send(HealthSignal::Alarm(ReconnectReason::NoTexts));
					break;
				}
			}
			token.cancel();
		});
	}
}

impl Drop for HealthMonitor {
	fn drop(&mut self) {
		self.root.cancel();
	}
}
