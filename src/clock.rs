use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Wall-clock source. Timestamps here are persisted (queue entries, cache
/// entries, peer state) so they are `chrono` times rather than `Instant`s.
pub trait Clock: Send + Sync + 'static {
	fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
	now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
	pub fn new(start: DateTime<Utc>) -> Self {
		Self {
			now: Arc::new(Mutex::new(start)),
		}
	}

	pub fn advance(&self, by: Duration) {
		let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
		*now += by;
	}

	pub fn set(&self, to: DateTime<Utc>) {
		let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
		*now = to;
	}
}

impl Default for ManualClock {
	fn default() -> Self {
		Self::new(Utc::now())
	}
}

impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.lock().unwrap_or_else(|p| p.into_inner())
	}
}

/// Convert a millisecond knob to a chrono duration.
pub fn millis(ms: u64) -> Duration {
	Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
