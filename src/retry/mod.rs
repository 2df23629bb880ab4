//! Retry coordinator: backoff ladder and dead-letter classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::clock::millis;
use crate::config::Settings;
use crate::queue::MutationQueueEntry;

/// What to do with an entry after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
	Retry,
	Dead,
}

/// Snapshot of the retry knobs taken at a cycle boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
	delays_ms: Vec<u64>,
	max_retries: u32,
}

impl RetryPolicy {
	/// An empty ladder is treated as a single zero delay; `Settings::validate`
	/// rejects it before it gets here.
	pub fn new(delays_ms: Vec<u64>, max_retries: u32) -> Self {
		let delays_ms = if delays_ms.is_empty() { vec![0] } else { delays_ms };
		Self {
			delays_ms,
			max_retries,
		}
	}

	pub fn from_settings(settings: &Settings) -> Self {
		Self::new(settings.retry_backoff_delays_ms.clone(), settings.max_retries)
	}

	pub fn max_retries(&self) -> u32 {
		self.max_retries
	}

	/// Delay after the `retry_count`-th failure. The ladder plateaus at its
	/// last rung.
	pub fn delay_for(&self, retry_count: u32) -> Duration {
		let idx = (retry_count as usize).min(self.delays_ms.len() - 1);
		Duration::from_millis(self.delays_ms[idx])
	}

	/// When the entry may be attempted again. `retry_count` already includes
	/// the failure being recorded.
	pub fn next_attempt(&self, entry: &MutationQueueEntry, now: DateTime<Utc>) -> DateTime<Utc> {
		let idx = (entry.retry_count as usize).min(self.delays_ms.len() - 1);
		now + millis(self.delays_ms[idx])
	}

	/// `Dead` once the entry has failed `max_retries` times.
	pub fn classify(&self, entry: &MutationQueueEntry) -> Disposition {
		if entry.retry_count >= self.max_retries {
			Disposition::Dead
		} else {
			Disposition::Retry
		}
	}
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::from_settings(&Settings::default())
	}
}

/// Deterministic idempotency key for a queued mutation. The same entry always
/// produces the same key, so a redelivery after a lost acknowledgement is
/// recognised by the remote side.
pub fn idempotency_key(device_id: &str, seq: u64, entity_type: &str, entity_id: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(device_id.as_bytes());
	hasher.update([0u8]);
	hasher.update(seq.to_be_bytes());
	hasher.update(entity_type.as_bytes());
	hasher.update([0u8]);
	hasher.update(entity_id.as_bytes());
	let digest = hasher.finalize();
	digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::queue::{EntryStatus, MutationQueueEntry, Operation};

	fn entry_with_retries(retry_count: u32) -> MutationQueueEntry {
		MutationQueueEntry {
			id: 1,
			operation: Operation::Update,
			entity_type: "orders".into(),
			entity_id: "o-1".into(),
			payload: serde_json::json!({}),
			idempotency_key: "k".into(),
			enqueued_at: Utc::now(),
			retry_count,
			next_attempt_at: None,
			status: EntryStatus::Failed,
			last_error: None,
			failure_kind: None,
		}
	}

	#[test]
	fn ladder_plateaus_at_last_rung() {
		let policy = RetryPolicy::default();
		let expected = [5_000, 10_000, 30_000, 60_000, 300_000, 300_000, 300_000];
		for (n, ms) in expected.iter().enumerate() {
			assert_eq!(policy.delay_for(n as u32), Duration::from_millis(*ms));
		}
		assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(300_000));
	}

	#[test]
	fn nth_failure_waits_nth_rung() {
		let policy = RetryPolicy::new(vec![100, 200, 300], 5);
		let now = Utc::now();
		assert_eq!(
			policy.next_attempt(&entry_with_retries(1), now) - now,
			chrono::Duration::milliseconds(200)
		);
		assert_eq!(
			policy.next_attempt(&entry_with_retries(2), now) - now,
			chrono::Duration::milliseconds(300)
		);
		assert_eq!(
			policy.next_attempt(&entry_with_retries(7), now) - now,
			chrono::Duration::milliseconds(300)
		);
	}

	#[test]
	fn classify_dead_once_budget_spent() {
		let policy = RetryPolicy::new(vec![1], 2);
		assert_eq!(policy.classify(&entry_with_retries(0)), Disposition::Retry);
		assert_eq!(policy.classify(&entry_with_retries(1)), Disposition::Retry);
		assert_eq!(policy.classify(&entry_with_retries(2)), Disposition::Dead);
	}

	#[test]
	fn idempotency_keys_are_stable_and_distinct() {
		let a = idempotency_key("pos-1", 1, "orders", "o-1");
		assert_eq!(a, idempotency_key("pos-1", 1, "orders", "o-1"));
		assert_eq!(a.len(), 64);
		assert_ne!(a, idempotency_key("pos-1", 2, "orders", "o-1"));
		assert_ne!(a, idempotency_key("pos-2", 1, "orders", "o-1"));
	}
}
