//! Per-peer connection state machine.
//!
//! connected -> stale when no heartbeat arrives within the stale timeout;
//! stale -> connected when a reconnect succeeds or a heartbeat arrives;
//! stale -> disconnected once the reconnect budget is spent.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::millis;
use crate::config::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
	Connected,
	Stale,
	Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnection {
	pub peer_id: String,
	pub address: Option<String>,
	pub last_heartbeat_at: Option<DateTime<Utc>>,
	pub state: PeerState,
	pub reconnect_attempts: u32,
	pub next_reconnect_at: Option<DateTime<Utc>>,
}

/// Timing knobs for the state machine, read from settings once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPolicy {
	pub stale_timeout_ms: u64,
	pub max_reconnect_attempts: u32,
	pub backoff_base_ms: u64,
	pub backoff_max_ms: u64,
}

impl PeerPolicy {
	pub fn from_settings(s: &Settings) -> Self {
		Self {
			stale_timeout_ms: s.lan_stale_timeout_ms,
			max_reconnect_attempts: s.lan_max_reconnect_attempts,
			backoff_base_ms: s.lan_reconnect_backoff_base_ms,
			backoff_max_ms: s.lan_reconnect_backoff_max_ms,
		}
	}

	/// `base * 2^attempts`, capped at the configured maximum.
	pub fn reconnect_backoff(&self, attempts: u32) -> Duration {
		let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
		let ms = self
			.backoff_base_ms
			.saturating_mul(factor)
			.min(self.backoff_max_ms);
		Duration::from_millis(ms)
	}

	fn backoff_delta(&self, attempts: u32) -> chrono::Duration {
		millis(self.reconnect_backoff(attempts).as_millis() as u64)
	}
}

impl PeerConnection {
	/// A peer known by configuration but never heard from. It starts out
	/// stale so the supervisor connects it right away.
	pub fn configured(peer_id: &str, address: &str, now: DateTime<Utc>) -> Self {
		Self {
			peer_id: peer_id.to_string(),
			address: Some(address.to_string()),
			last_heartbeat_at: None,
			state: PeerState::Stale,
			reconnect_attempts: 0,
			next_reconnect_at: Some(now),
		}
	}

	/// A peer that just announced itself.
	pub fn discovered(peer_id: &str, address: Option<&str>, now: DateTime<Utc>) -> Self {
		Self {
			peer_id: peer_id.to_string(),
			address: address.map(str::to_string),
			last_heartbeat_at: Some(now),
			state: PeerState::Connected,
			reconnect_attempts: 0,
			next_reconnect_at: None,
		}
	}

	/// A heartbeat always restores the peer. Returns `true` if it was not
	/// connected before.
	pub fn record_heartbeat(&mut self, now: DateTime<Utc>) -> bool {
		let was_connected = self.state == PeerState::Connected;
		self.last_heartbeat_at = Some(now);
		self.state = PeerState::Connected;
		self.reconnect_attempts = 0;
		self.next_reconnect_at = None;
		!was_connected
	}

	/// Move a silent connected peer to stale. Returns `true` on transition.
	pub fn check_stale(&mut self, now: DateTime<Utc>, policy: &PeerPolicy) -> bool {
		if self.state != PeerState::Connected {
			return false;
		}
		let silent_since = match self.last_heartbeat_at {
			Some(at) => at,
			None => return false,
		};
		if now - silent_since < millis(policy.stale_timeout_ms) {
			return false;
		}
		self.mark_stale(now, policy);
		true
	}

	pub fn mark_stale(&mut self, now: DateTime<Utc>, policy: &PeerPolicy) {
		self.state = PeerState::Stale;
		self.next_reconnect_at = Some(now + policy.backoff_delta(self.reconnect_attempts));
	}

	pub fn reconnect_due(&self, now: DateTime<Utc>) -> bool {
		self.state == PeerState::Stale && self.next_reconnect_at.is_none_or(|at| at <= now)
	}

	/// Count a failed reconnect and schedule the next one. Returns the state
	/// after the failure; `Disconnected` once the budget is spent.
	pub fn record_reconnect_failure(&mut self, now: DateTime<Utc>, policy: &PeerPolicy) -> PeerState {
		self.reconnect_attempts += 1;
		if self.reconnect_attempts >= policy.max_reconnect_attempts {
			self.state = PeerState::Disconnected;
			self.next_reconnect_at = None;
		} else {
			self.next_reconnect_at = Some(now + policy.backoff_delta(self.reconnect_attempts));
		}
		self.state
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use chrono::Duration as ChronoDuration;

	use super::*;

	fn policy() -> PeerPolicy {
		PeerPolicy::from_settings(&Settings::default())
	}

	#[test]
	fn backoff_doubles_and_caps() {
		let p = policy();
		let ladder: Vec<u64> = (0..8).map(|n| p.reconnect_backoff(n).as_millis() as u64).collect();
		assert_eq!(ladder, vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]);
		assert_eq!(p.reconnect_backoff(200), Duration::from_millis(60_000));
	}

	#[test]
	fn silence_makes_a_peer_stale() {
		let p = policy();
		let t0 = Utc::now();
		let mut peer = PeerConnection::discovered("kds-1", None, t0);

		assert!(!peer.check_stale(t0 + ChronoDuration::milliseconds(59_999), &p));
		assert!(peer.check_stale(t0 + ChronoDuration::milliseconds(60_000), &p));
		assert_eq!(peer.state, PeerState::Stale);
		assert!(!peer.check_stale(t0 + ChronoDuration::minutes(5), &p));
	}

	#[test]
	fn heartbeat_after_reconnect_resets_attempts() {
		let p = policy();
		let t0 = Utc::now();
		let mut peer = PeerConnection::discovered("kds-1", None, t0);
		peer.mark_stale(t0, &p);
		peer.record_reconnect_failure(t0, &p);
		peer.record_reconnect_failure(t0, &p);
		assert_eq!(peer.reconnect_attempts, 2);
		assert_eq!(peer.next_reconnect_at, Some(t0 + ChronoDuration::seconds(4)));

		assert!(peer.record_heartbeat(t0 + ChronoDuration::seconds(5)));
		assert_eq!(peer.state, PeerState::Connected);
		assert_eq!(peer.reconnect_attempts, 0);
	}

	#[test]
	fn budget_exhaustion_disconnects() {
		let mut p = policy();
		p.max_reconnect_attempts = 3;
		let now = Utc::now();
		let mut peer = PeerConnection::configured("display", "10.0.0.9:8787", now);
		assert!(peer.reconnect_due(now));
		assert_eq!(peer.record_reconnect_failure(now, &p), PeerState::Stale);
		assert_eq!(peer.record_reconnect_failure(now, &p), PeerState::Stale);
		assert_eq!(peer.record_reconnect_failure(now, &p), PeerState::Disconnected);
		assert!(!peer.reconnect_due(now + ChronoDuration::hours(1)));
	}
}
