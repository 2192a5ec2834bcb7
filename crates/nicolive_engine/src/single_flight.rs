#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Collapses concurrent triggers into a single in-flight attempt.
#[derive(Debug, Default)]
pub struct SingleFlight {
	busy: AtomicBool,
}

impl SingleFlight {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Take the permit, or `None` while another holder is still running.
	pub fn try_acquire(self: &Arc<Self>) -> Option<FlightPermit> {
		self.busy
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| FlightPermit { owner: Arc::clone(self) })
	}

	#[cfg(test)]
	fn is_busy(&self) -> bool {
		self.busy.load(Ordering::Acquire)
	}
}

/// Released on drop.
#[derive(Debug)]
pub struct FlightPermit {
	owner: Arc<SingleFlight>,
}

impl Drop for FlightPermit {
	fn drop(&mut self) {
		self.owner.busy.store(false, Ordering::Release);
	}
}
