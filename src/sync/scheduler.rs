use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::time::{sleep, sleep_until};

use crate::clock::SharedClock;
use crate::config::SettingsRx;
use crate::error::SyncResult;
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::observability::MetricsRegistry;
use crate::queue::{FailureOutcome, MutationQueue, MutationQueueEntry, Operation, is_local_id};
use crate::remote::SharedRemote;
use crate::retry::RetryPolicy;
use crate::signal::ChangeSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
	Idle,
	Syncing,
	Error,
}

/// Per-device sync bookkeeping. Never persisted; a restart begins idle and
/// learns the rest from the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncCycleState {
	pub status: SyncStatus,
	pub last_success_at: Option<DateTime<Utc>>,
	pub current_cycle_id: Option<u64>,
	pub last_error: Option<String>,
	pub auto_sync: bool,
}

impl Default for SyncCycleState {
	fn default() -> Self {
		Self {
			status: SyncStatus::Idle,
			last_success_at: None,
			current_cycle_id: None,
			last_error: None,
			auto_sync: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
	Startup,
	Interval,
	Reconnect,
	Manual,
}

/// Outcome of one drain of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
	pub cycle_id: u64,
	pub trigger: CycleTrigger,
	pub synced: usize,
	pub duplicates: usize,
	pub failed: usize,
	pub dead_lettered: usize,
	pub remapped: usize,
	/// Connectivity dropped mid-cycle; the rest of the queue stays pending.
	pub aborted_offline: bool,
}

impl CycleReport {
	fn new(cycle_id: u64, trigger: CycleTrigger) -> Self {
		Self {
			cycle_id,
			trigger,
			synced: 0,
			duplicates: 0,
			failed: 0,
			dead_lettered: 0,
			remapped: 0,
			aborted_offline: false,
		}
	}

	pub fn attempted(&self) -> usize {
		self.synced + self.duplicates + self.failed
	}
}

/// Releases the syncing flag when a cycle ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

/// Drives the mutation queue towards the remote.
pub struct SyncScheduler {
	queue: Arc<MutationQueue>,
	remote: SharedRemote,
	network: Arc<NetworkMonitor>,
	settings: SettingsRx,
	metrics: Arc<MetricsRegistry>,
	clock: SharedClock,
	signal: ChangeSignal,
	syncing: AtomicBool,
	auto_sync: AtomicBool,
	cycle_seq: AtomicU64,
	state: RwLock<SyncCycleState>,
	manual: Notify,
}

impl SyncScheduler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		queue: Arc<MutationQueue>,
		remote: SharedRemote,
		network: Arc<NetworkMonitor>,
		settings: SettingsRx,
		metrics: Arc<MetricsRegistry>,
		clock: SharedClock,
		signal: ChangeSignal,
	) -> Self {
		Self {
			queue,
			remote,
			network,
			settings,
			metrics,
			clock,
			signal,
			syncing: AtomicBool::new(false),
			auto_sync: AtomicBool::new(true),
			cycle_seq: AtomicU64::new(0),
			state: RwLock::new(SyncCycleState::default()),
			manual: Notify::new(),
		}
	}

	pub fn state(&self) -> SyncCycleState {
		self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
	}

	pub fn is_syncing(&self) -> bool {
		self.syncing.load(Ordering::Acquire)
	}

	/// Pause or resume the timer-driven triggers. Reconnects and manual
	/// requests still run cycles.
	pub fn set_auto_sync(&self, enabled: bool) {
		self.auto_sync.store(enabled, Ordering::Release);
		self.update_state(|s| s.auto_sync = enabled);
		info!("automatic sync {}", if enabled { "enabled" } else { "disabled" });
	}

	pub fn auto_sync(&self) -> bool {
		self.auto_sync.load(Ordering::Acquire)
	}

	/// Run a cycle now. `None` if one is already running or the device is
	/// offline.
	pub async fn sync_now(&self) -> Option<CycleReport> {
		self.run_cycle(CycleTrigger::Manual).await
	}

	/// Ask the driver loop to run a cycle without waiting for it.
	pub fn request_sync(&self) {
		self.manual.notify_one();
	}

	/// One pass over the queue. Entries enqueued after the pass started wait
	/// for the next one.
	pub async fn run_cycle(&self, trigger: CycleTrigger) -> Option<CycleReport> {
		if !self.network.is_online() {
			debug!("skipping {:?} sync: offline", trigger);
			return None;
		}
		if self
			.syncing
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			debug!("{:?} sync coalesced into the running cycle", trigger);
			return None;
		}
		let _guard = SyncingGuard(&self.syncing);

		let cycle_id = self.cycle_seq.fetch_add(1, Ordering::AcqRel) + 1;
		self.update_state(|s| {
			s.status = SyncStatus::Syncing;
			s.current_cycle_id = Some(cycle_id);
		});
		let started = Instant::now();
		debug!("sync cycle {} started ({:?})", cycle_id, trigger);

		let mut report = CycleReport::new(cycle_id, trigger);
		let outcome = self.drain(&mut report).await;

		self.metrics.sync_cycles_total.inc();
		self.metrics
			.sync_cycle_duration_seconds
			.observe(started.elapsed().as_secs_f64());
		if report.aborted_offline {
			self.metrics.sync_cycles_aborted_total.inc();
		}
		self.refresh_gauges().await;

		let now = self.clock.now();
		self.update_state(|s| {
			s.current_cycle_id = None;
			match &outcome {
				Err(e) => {
					s.status = SyncStatus::Error;
					s.last_error = Some(e.to_string());
				}
				Ok(()) if report.failed > 0 => {
					s.status = SyncStatus::Error;
				}
				Ok(()) if report.aborted_offline => {
					s.status = SyncStatus::Idle;
				}
				Ok(()) => {
					s.status = SyncStatus::Idle;
					s.last_success_at = Some(now);
					s.last_error = None;
				}
			}
		});

		match outcome {
			Err(e) => error!("sync cycle {} failed: {}", cycle_id, e),
			Ok(()) if report.attempted() > 0 || report.aborted_offline => info!(
				"sync cycle {} done: {} synced, {} duplicate, {} failed, {} dead-lettered{}",
				cycle_id,
				report.synced,
				report.duplicates,
				report.failed,
				report.dead_lettered,
				if report.aborted_offline { " (offline, aborted)" } else { "" }
			),
			Ok(()) => debug!("sync cycle {} done: queue empty", cycle_id),
		}
		Some(report)
	}

	async fn drain(&self, report: &mut CycleReport) -> SyncResult<()> {
		let (policy, item_delay) = {
			let s = self.settings.borrow();
			(RetryPolicy::from_settings(&s), s.item_process_delay())
		};
		let cutoff = self.queue.last_id().await;
		let mut attempted = HashSet::new();

		loop {
			if !attempted.is_empty() && !item_delay.is_zero() {
				sleep(item_delay).await;
			}
			if !self.network.is_online() {
				report.aborted_offline = true;
				break;
			}
			let Some(entry) = self.queue.next_eligible(cutoff, &attempted).await else {
				break;
			};
			attempted.insert(entry.id);
			self.attempt(&entry, &policy, report).await?;
		}
		Ok(())
	}

	async fn attempt(
		&self,
		entry: &MutationQueueEntry,
		policy: &RetryPolicy,
		report: &mut CycleReport,
	) -> SyncResult<()> {
		self.queue.mark_in_flight(entry.id).await?;
		let settled = self.settle(entry, policy, report).await;
		if settled.is_err() {
			self.queue.release_in_flight(entry.id).await;
		}
		settled
	}

	/// Send one in-flight entry and record the answer.
	async fn settle(
		&self,
		entry: &MutationQueueEntry,
		policy: &RetryPolicy,
		report: &mut CycleReport,
	) -> SyncResult<()> {
		match self.remote.apply(entry).await {
			Ok(ack) => {
				if let Some(server_id) = ack.server_id.as_deref() {
					if entry.operation == Operation::Create && is_local_id(&entry.entity_id) {
						report.remapped += self
							.queue
							.remap_entity(&entry.entity_type, &entry.entity_id, server_id)
							.await?;
					}
				}
				self.queue.mark_succeeded(entry.id).await?;
				if ack.duplicate {
					debug!("mutation #{} was already applied remotely", entry.id);
					report.duplicates += 1;
				} else {
					report.synced += 1;
				}
				self.metrics.mutations_synced_total.inc();
			}
			Err(e) => {
				report.failed += 1;
				self.metrics.mutations_failed_total.inc();
				let outcome = self
					.queue
					.mark_failed(entry.id, &e.to_string(), e.failure_kind(), policy)
					.await?;
				if outcome == FailureOutcome::DeadLettered {
					report.dead_lettered += 1;
					self.metrics.mutations_dead_lettered_total.inc();
				}
				self.update_state(|s| s.last_error = Some(e.to_string()));
			}
		}
		Ok(())
	}

	async fn refresh_gauges(&self) {
		let counts = self.queue.counts().await;
		self.metrics
			.queue_depth
			.set((counts.pending + counts.in_flight + counts.failed) as i64);
		self.metrics.dead_letter_depth.set(counts.dead as i64);
	}

	fn update_state(&self, f: impl FnOnce(&mut SyncCycleState)) {
		{
			let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
			f(&mut state);
		}
		self.signal.notify();
	}

	/// Trigger loop: startup delay, background interval while online and
	/// auto sync is on, every online transition, and manual requests.
	pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		let mut network = self.network.subscribe();
		let startup = sleep(self.settings.borrow().startup_delay());
		tokio::pin!(startup);
		let mut started = false;
		let mut next_tick = tokio::time::Instant::now();

		loop {
			tokio::select! {
				_ = &mut startup, if !started => {
					started = true;
					next_tick = tokio::time::Instant::now() + self.settings.borrow().background_interval();
					if self.auto_sync() {
						self.run_cycle(CycleTrigger::Startup).await;
					}
				}
				_ = sleep_until(next_tick), if started => {
					next_tick = tokio::time::Instant::now() + self.settings.borrow().background_interval();
					if self.auto_sync() {
						self.run_cycle(CycleTrigger::Interval).await;
					}
				}
				event = network.recv() => match event {
					Some(NetworkEvent::Online) => {
						self.run_cycle(CycleTrigger::Reconnect).await;
					}
					Some(NetworkEvent::Offline) => {
						warn!("offline: mutations stay queued until connectivity returns");
					}
					None => break,
				},
				_ = self.manual.notified() => {
					self.run_cycle(CycleTrigger::Manual).await;
				}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}
		}
		debug!("sync driver stopped");
	}
}
