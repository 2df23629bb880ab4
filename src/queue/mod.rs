//! Durable, bounded, ordered queue of pending write operations.
//!
//! Entries are replayed FIFO. An entry that cannot be attempted right now
//! (waiting out its backoff, in flight, or dead-lettered) blocks every later
//! entry for the same entity, so the remote never sees a later write before an
//! earlier one.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::clock::SharedClock;
use crate::config::SettingsRx;
use crate::error::{SyncError, SyncResult};
use crate::retry::{Disposition, RetryPolicy, idempotency_key};
use crate::signal::ChangeSignal;
use crate::store::{SharedStore, StoreError, encode_json, list_json, put_json};

pub type EntryId = u64;

const KEY_PREFIX: &str = "queue/";

/// Prefix of ids minted while offline; replaced by the server id once the
/// create is acknowledged.
pub const LOCAL_ID_PREFIX: &str = "LOCAL-";

pub fn is_local_id(id: &str) -> bool {
	id.starts_with(LOCAL_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
	Create,
	Update,
	Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
	Pending,
	InFlight,
	Failed,
	Dead,
}

/// Why the last attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	Transient,
	Conflict,
	Rejected,
}

/// A write request handed to the queue by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
	pub operation: Operation,
	pub entity_type: String,
	pub entity_id: String,
	pub payload: Value,
	/// Caller-supplied key; one is derived from the entry sequence otherwise.
	pub idempotency_key: Option<String>,
}

impl NewMutation {
	pub fn new(
		operation: Operation,
		entity_type: impl Into<String>,
		entity_id: impl Into<String>,
		payload: Value,
	) -> Self {
		Self {
			operation,
			entity_type: entity_type.into(),
			entity_id: entity_id.into(),
			payload,
			idempotency_key: None,
		}
	}

	pub fn create(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
		Self::new(Operation::Create, entity_type, entity_id, payload)
	}

	pub fn update(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
		Self::new(Operation::Update, entity_type, entity_id, payload)
	}

	pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
		Self::new(Operation::Delete, entity_type, entity_id, Value::Null)
	}

	pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
		self.idempotency_key = Some(key.into());
		self
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationQueueEntry {
	pub id: EntryId,
	pub operation: Operation,
	pub entity_type: String,
	pub entity_id: String,
	pub payload: Value,
	pub idempotency_key: String,
	pub enqueued_at: DateTime<Utc>,
	pub retry_count: u32,
	pub next_attempt_at: Option<DateTime<Utc>>,
	pub status: EntryStatus,
	pub last_error: Option<String>,
	pub failure_kind: Option<FailureKind>,
}

impl MutationQueueEntry {
	/// Pending, or failed with its backoff elapsed.
	pub fn is_due(&self, now: DateTime<Utc>) -> bool {
		match self.status {
			EntryStatus::Pending => true,
			EntryStatus::Failed => self.next_attempt_at.is_none_or(|at| at <= now),
			EntryStatus::InFlight | EntryStatus::Dead => false,
		}
	}

	fn entity(&self) -> (&str, &str) {
		(&self.entity_type, &self.entity_id)
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
	pub pending: usize,
	pub in_flight: usize,
	pub failed: usize,
	pub dead: usize,
	pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
	Rescheduled { at: DateTime<Utc> },
	DeadLettered,
}

pub struct MutationQueue {
	store: SharedStore,
	settings: SettingsRx,
	clock: SharedClock,
	signal: ChangeSignal,
	entries: Mutex<BTreeMap<EntryId, MutationQueueEntry>>,
	next_id: Mutex<EntryId>,
}

fn entry_key(id: EntryId) -> String {
	format!("{}{:020}", KEY_PREFIX, id)
}

impl MutationQueue {
	/// Load the queue from the store. Entries left in flight by a previous
	/// process never got an answer and go back to pending.
	pub async fn open(
		store: SharedStore,
		settings: SettingsRx,
		clock: SharedClock,
		signal: ChangeSignal,
	) -> Result<Self, StoreError> {
		let mut entries = BTreeMap::new();
		let mut recovered = 0usize;
		for (_key, mut entry) in list_json::<MutationQueueEntry>(store.as_ref(), KEY_PREFIX).await? {
			if entry.status == EntryStatus::InFlight {
				entry.status = EntryStatus::Pending;
				put_json(store.as_ref(), &entry_key(entry.id), &entry).await?;
				recovered += 1;
			}
			entries.insert(entry.id, entry);
		}
		if recovered > 0 {
			info!("recovered {} orphaned in-flight mutations", recovered);
		}

		let next_id = entries.keys().next_back().map_or(1, |id| id + 1);
		debug!("mutation queue opened with {} entries, next id {}", entries.len(), next_id);

		Ok(Self {
			store,
			settings,
			clock,
			signal,
			entries: Mutex::new(entries),
			next_id: Mutex::new(next_id),
		})
	}

	pub async fn enqueue(&self, mutation: NewMutation) -> SyncResult<EntryId> {
		let ids = self.enqueue_batch(vec![mutation]).await?;
		ids.into_iter()
			.next()
			.ok_or_else(|| SyncError::InvalidState("enqueue produced no entry".into()))
	}

	/// Enqueue several mutations as one unit: either all are accepted or none.
	pub async fn enqueue_batch(&self, mutations: Vec<NewMutation>) -> SyncResult<Vec<EntryId>> {
		for m in &mutations {
			if m.entity_type.trim().is_empty() || m.entity_id.trim().is_empty() {
				return Err(SyncError::Validation(
					"mutation must name an entity type and id".into(),
				));
			}
		}

		let (max, device_id) = {
			let s = self.settings.borrow();
			(s.max_queue_size, s.device_id.clone())
		};

		let mut entries = self.entries.lock().await;
		if entries.len() + mutations.len() > max {
			warn!(
				"rejecting {} mutation(s): queue holds {} of {}",
				mutations.len(),
				entries.len(),
				max
			);
			return Err(SyncError::QueueFull { max });
		}

		let mut next_id = self.next_id.lock().await;
		let now = self.clock.now();
		let mut staged = Vec::with_capacity(mutations.len());
		for (offset, m) in mutations.into_iter().enumerate() {
			let id = *next_id + offset as u64;
			let key = m
				.idempotency_key
				.unwrap_or_else(|| idempotency_key(&device_id, id, &m.entity_type, &m.entity_id));
			staged.push(MutationQueueEntry {
				id,
				operation: m.operation,
				entity_type: m.entity_type,
				entity_id: m.entity_id,
				payload: m.payload,
				idempotency_key: key,
				enqueued_at: now,
				retry_count: 0,
				next_attempt_at: None,
				status: EntryStatus::Pending,
				last_error: None,
				failure_kind: None,
			});
		}

		let mut puts = Vec::with_capacity(staged.len());
		for entry in &staged {
			let key = entry_key(entry.id);
			let bytes = encode_json(&key, entry)?;
			puts.push((key, bytes));
		}
		self.store.write_batch(puts, Vec::new()).await?;

		*next_id += staged.len() as u64;
		let ids: Vec<EntryId> = staged.iter().map(|e| e.id).collect();
		for entry in staged {
			debug!(
				"enqueued {:?} {}/{} as #{}",
				entry.operation, entry.entity_type, entry.entity_id, entry.id
			);
			entries.insert(entry.id, entry);
		}
		drop(entries);
		self.signal.notify();
		Ok(ids)
	}

	/// Up to `n` entries that may be attempted now, in FIFO order.
	pub async fn peek_batch(&self, n: usize) -> Vec<MutationQueueEntry> {
		let now = self.clock.now();
		let entries = self.entries.lock().await;
		eligible(&entries, now, EntryId::MAX, &HashSet::new(), n)
	}

	/// The next entry a sync cycle should attempt. Entries newer than
	/// `cutoff` belong to the next cycle; ids in `attempted` were already
	/// tried in this one.
	pub async fn next_eligible(
		&self,
		cutoff: EntryId,
		attempted: &HashSet<EntryId>,
	) -> Option<MutationQueueEntry> {
		let now = self.clock.now();
		let entries = self.entries.lock().await;
		eligible(&entries, now, cutoff, attempted, 1).into_iter().next()
	}

	pub async fn mark_in_flight(&self, id: EntryId) -> SyncResult<()> {
		self.update(id, |entry| {
			entry.status = EntryStatus::InFlight;
			Ok(())
		})
		.await
	}

	/// Remove an entry the remote confirmed. The in-memory entry stays until
	/// the store has dropped it.
	pub async fn mark_succeeded(&self, id: EntryId) -> SyncResult<()> {
		let mut entries = self.entries.lock().await;
		if !entries.contains_key(&id) {
			return Err(SyncError::NotFound(format!("queue entry {}", id)));
		}
		self.store.delete(&entry_key(id)).await?;
		entries.remove(&id);
		drop(entries);
		self.signal.notify();
		Ok(())
	}

	/// Return an in-flight entry to pending after its attempt could not be
	/// settled. Memory is always updated; the store copy is recovered on the
	/// next open if persisting fails here.
	pub async fn release_in_flight(&self, id: EntryId) {
		let mut entries = self.entries.lock().await;
		let Some(entry) = entries.get_mut(&id) else {
			return;
		};
		if entry.status != EntryStatus::InFlight {
			return;
		}
		entry.status = EntryStatus::Pending;
		if let Err(e) = put_json(self.store.as_ref(), &entry_key(id), &*entry).await {
			warn!("could not persist release of mutation #{}: {}", id, e);
		}
		drop(entries);
		self.signal.notify();
	}

	/// Record a failed attempt. Transient failures are rescheduled on the
	/// ladder until the budget is spent; conflicts and rejections are
	/// dead-lettered straight away.
	pub async fn mark_failed(
		&self,
		id: EntryId,
		error: &str,
		kind: FailureKind,
		policy: &RetryPolicy,
	) -> SyncResult<FailureOutcome> {
		let now = self.clock.now();
		let mut outcome = FailureOutcome::DeadLettered;
		self.update(id, |entry| {
			if entry.status == EntryStatus::Dead {
				return Err(SyncError::InvalidState(format!(
					"queue entry {} is already dead-lettered",
					id
				)));
			}
			entry.retry_count += 1;
			let at = policy.next_attempt(entry, now);
			entry.last_error = Some(error.to_string());
			entry.failure_kind = Some(kind);

			let disposition = match kind {
				FailureKind::Transient => policy.classify(entry),
				FailureKind::Conflict | FailureKind::Rejected => Disposition::Dead,
			};
			match disposition {
				Disposition::Retry => {
					entry.status = EntryStatus::Failed;
					entry.next_attempt_at = Some(at);
					outcome = FailureOutcome::Rescheduled { at };
				}
				Disposition::Dead => {
					entry.status = EntryStatus::Dead;
					entry.next_attempt_at = None;
					outcome = FailureOutcome::DeadLettered;
				}
			}
			Ok(())
		})
		.await?;

		match outcome {
			FailureOutcome::Rescheduled { at } => {
				debug!("mutation #{} failed ({}), next attempt at {}", id, error, at)
			}
			FailureOutcome::DeadLettered => {
				warn!("mutation #{} dead-lettered for operator review: {}", id, error)
			}
		}
		Ok(outcome)
	}

	/// Point queued writes for an offline-created entity at its server id.
	pub async fn remap_entity(
		&self,
		entity_type: &str,
		local_id: &str,
		server_id: &str,
	) -> SyncResult<usize> {
		let mut entries = self.entries.lock().await;
		let mut remapped = 0;
		for entry in entries.values_mut() {
			if entry.entity_type == entity_type
				&& entry.entity_id == local_id
				&& entry.status != EntryStatus::InFlight
			{
				entry.entity_id = server_id.to_string();
				put_json(self.store.as_ref(), &entry_key(entry.id), &*entry).await?;
				remapped += 1;
			}
		}
		if remapped > 0 {
			debug!("remapped {} queued {} writes {} -> {}", remapped, entity_type, local_id, server_id);
		}
		Ok(remapped)
	}

	pub async fn dead_letters(&self) -> Vec<MutationQueueEntry> {
		self.entries
			.lock()
			.await
			.values()
			.filter(|e| e.status == EntryStatus::Dead)
			.cloned()
			.collect()
	}

	/// Operator action: give a dead-lettered entry a fresh retry budget.
	pub async fn requeue_dead(&self, id: EntryId) -> SyncResult<()> {
		self.update(id, |entry| {
			if entry.status != EntryStatus::Dead {
				return Err(SyncError::InvalidState(format!(
					"queue entry {} is not dead-lettered",
					id
				)));
			}
			entry.status = EntryStatus::Pending;
			entry.retry_count = 0;
			entry.next_attempt_at = None;
			entry.last_error = None;
			entry.failure_kind = None;
			Ok(())
		})
		.await?;
		info!("dead-lettered mutation #{} requeued by operator", id);
		Ok(())
	}

	/// Operator action: drop a dead-lettered entry for good.
	pub async fn purge_dead(&self, id: EntryId) -> SyncResult<MutationQueueEntry> {
		let mut entries = self.entries.lock().await;
		match entries.get(&id) {
			None => return Err(SyncError::NotFound(format!("queue entry {}", id))),
			Some(e) if e.status != EntryStatus::Dead => {
				return Err(SyncError::InvalidState(format!(
					"queue entry {} is not dead-lettered",
					id
				)));
			}
			Some(_) => {}
		}
		self.store.delete(&entry_key(id)).await?;
		let purged = entries
			.remove(&id)
			.ok_or_else(|| SyncError::NotFound(format!("queue entry {}", id)))?;
		drop(entries);
		info!("dead-lettered mutation #{} purged by operator", id);
		self.signal.notify();
		Ok(purged)
	}

	/// Where a mutation stands. `Ok(None)` once it has left the queue
	/// (synced or purged); `DeadLetter` while it waits for an operator.
	pub async fn track(&self, id: EntryId) -> SyncResult<Option<MutationQueueEntry>> {
		match self.get(id).await {
			Some(entry) if entry.status == EntryStatus::Dead => Err(SyncError::DeadLetter {
				id,
				reason: entry.last_error.unwrap_or_else(|| "retry budget exhausted".into()),
			}),
			other => Ok(other),
		}
	}

	pub async fn get(&self, id: EntryId) -> Option<MutationQueueEntry> {
		self.entries.lock().await.get(&id).cloned()
	}

	pub async fn entries(&self) -> Vec<MutationQueueEntry> {
		self.entries.lock().await.values().cloned().collect()
	}

	pub async fn counts(&self) -> QueueCounts {
		let entries = self.entries.lock().await;
		let mut counts = QueueCounts {
			total: entries.len(),
			..Default::default()
		};
		for e in entries.values() {
			match e.status {
				EntryStatus::Pending => counts.pending += 1,
				EntryStatus::InFlight => counts.in_flight += 1,
				EntryStatus::Failed => counts.failed += 1,
				EntryStatus::Dead => counts.dead += 1,
			}
		}
		counts
	}

	/// Entries still waiting to reach the remote (everything but dead letters).
	pub async fn pending_count(&self) -> usize {
		let c = self.counts().await;
		c.pending + c.in_flight + c.failed
	}

	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.lock().await.is_empty()
	}

	/// Highest id handed out so far.
	pub async fn last_id(&self) -> EntryId {
		*self.next_id.lock().await - 1
	}

	async fn update<F>(&self, id: EntryId, f: F) -> SyncResult<()>
	where
		F: FnOnce(&mut MutationQueueEntry) -> SyncResult<()>,
	{
		let mut entries = self.entries.lock().await;
		let entry = entries
			.get_mut(&id)
			.ok_or_else(|| SyncError::NotFound(format!("queue entry {}", id)))?;
		let mut next = entry.clone();
		f(&mut next)?;
		put_json(self.store.as_ref(), &entry_key(id), &next).await?;
		*entry = next;
		drop(entries);
		self.signal.notify();
		Ok(())
	}
}

fn eligible(
	entries: &BTreeMap<EntryId, MutationQueueEntry>,
	now: DateTime<Utc>,
	cutoff: EntryId,
	attempted: &HashSet<EntryId>,
	limit: usize,
) -> Vec<MutationQueueEntry> {
	let mut blocked: HashSet<(&str, &str)> = HashSet::new();
	let mut out = Vec::new();
	for entry in entries.range(..=cutoff).map(|(_, e)| e) {
		if out.len() >= limit {
			break;
		}
		let entity = entry.entity();
		if blocked.contains(&entity) {
			continue;
		}
		if entry.is_due(now) && !attempted.contains(&entry.id) {
			out.push(entry.clone());
		}
		// Anything later on this entity waits for this entry to leave the queue.
		blocked.insert(entity);
	}
	out
}
