//! Engine lifecycle: builds every component over one store, starts the
//! long-lived background tasks and publishes a read-only snapshot whenever
//! observable state moves.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::cache::{CacheManager, CachedValue};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{Settings, SettingsWatch};
use crate::error::SyncResult;
use crate::lan::{LanMessage, LanSubsystem, PeerConnection, SharedTransport, TcpLanTransport};
use crate::network::{NetworkEvent, NetworkMonitor, NetworkSubscription};
use crate::observability::MetricsRegistry;
use crate::queue::{EntryId, MutationQueue, MutationQueueEntry, NewMutation};
use crate::remote::{HttpRemoteClient, SharedRemote};
use crate::signal::ChangeSignal;
use crate::store::{SharedStore, SqliteStore};
use crate::sync::{CycleReport, SyncCycleState, SyncScheduler};
use crate::transfer::{NewTransfer, ReconciliationEngine, Transfer, VarianceReport};

/// Read-only view of the engine for UIs and the status surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
	pub online: bool,
	pub pending_count: usize,
	pub dead_letter_count: usize,
	pub sync: SyncCycleState,
	pub last_success_at: Option<DateTime<Utc>>,
	pub peers: Vec<PeerConnection>,
	pub variances: Vec<VarianceReport>,
}

impl Default for EngineSnapshot {
	fn default() -> Self {
		Self {
			online: false,
			pending_count: 0,
			dead_letter_count: 0,
			sync: SyncCycleState::default(),
			last_success_at: None,
			peers: Vec::new(),
			variances: Vec::new(),
		}
	}
}

/// External collaborators the engine is built over.
pub struct Collaborators {
	pub store: SharedStore,
	pub remote: SharedRemote,
	pub clock: SharedClock,
	pub transport: SharedTransport,
	/// Frames received by `transport`.
	pub lan_inbound: mpsc::Receiver<LanMessage>,
	/// TCP transport to accept inbound peer connections with, if any.
	pub lan_listener: Option<Arc<TcpLanTransport>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
	pub initially_online: bool,
	/// Drive the network monitor from periodic remote pings.
	pub probe_network: bool,
	/// Poll the configuration sources for changes.
	pub reload_config: bool,
}

impl Default for EngineOptions {
	fn default() -> Self {
		Self {
			initially_online: false,
			probe_network: true,
			reload_config: true,
		}
	}
}

pub struct Engine {
	settings: Arc<SettingsWatch>,
	options: EngineOptions,
	metrics: Arc<MetricsRegistry>,
	signal: ChangeSignal,
	remote: SharedRemote,
	queue: Arc<MutationQueue>,
	network: Arc<NetworkMonitor>,
	scheduler: Arc<SyncScheduler>,
	cache: Arc<CacheManager>,
	lan: Arc<LanSubsystem>,
	transfers: Arc<ReconciliationEngine>,
	lan_inbound: Mutex<Option<mpsc::Receiver<LanMessage>>>,
	lan_listener: Option<Arc<TcpLanTransport>>,
	snapshot: watch::Sender<EngineSnapshot>,
	shutdown: watch::Sender<bool>,
	started: AtomicBool,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
	/// Production wiring: SQLite store under `store_dir`, HTTP remote, TCP LAN
	/// transport and the system clock.
	pub async fn open(settings: Settings, metrics: Arc<MetricsRegistry>) -> anyhow::Result<Arc<Self>> {
		let store = SqliteStore::open(&settings.store_dir)
			.await
			.with_context(|| format!("failed to open store at {}", settings.store_dir))?;
		let remote: SharedRemote = Arc::new(HttpRemoteClient::from_settings(&settings));
		let (inbound_tx, inbound_rx) = mpsc::channel(256);
		let tcp = TcpLanTransport::new(inbound_tx);
		let collaborators = Collaborators {
			store: Arc::new(store),
			remote,
			clock: Arc::new(SystemClock),
			transport: tcp.clone(),
			lan_inbound: inbound_rx,
			lan_listener: Some(tcp),
		};
		Self::build(settings, collaborators, EngineOptions::default(), metrics).await
	}

	pub async fn build(
		settings: Settings,
		collaborators: Collaborators,
		options: EngineOptions,
		metrics: Arc<MetricsRegistry>,
	) -> anyhow::Result<Arc<Self>> {
		settings.validate().context("invalid settings")?;
		let settings = Arc::new(SettingsWatch::new(settings));
		let signal = ChangeSignal::new();
		let Collaborators {
			store,
			remote,
			clock,
			transport,
			lan_inbound,
			lan_listener,
		} = collaborators;

		let queue = Arc::new(
			MutationQueue::open(store.clone(), settings.subscribe(), clock.clone(), signal.clone())
				.await
				.context("failed to open mutation queue")?,
		);
		let network = Arc::new(NetworkMonitor::new(options.initially_online, signal.clone()));
		let scheduler = Arc::new(SyncScheduler::new(
			queue.clone(),
			remote.clone(),
			network.clone(),
			settings.subscribe(),
			metrics.clone(),
			clock.clone(),
			signal.clone(),
		));
		let cache = CacheManager::open(
			store.clone(),
			remote.clone(),
			network.clone(),
			settings.subscribe(),
			clock.clone(),
			metrics.clone(),
		)
		.await
		.context("failed to open cache")?;
		let lan = LanSubsystem::open(
			transport,
			store.clone(),
			settings.subscribe(),
			clock.clone(),
			metrics.clone(),
			signal.clone(),
		)
		.await
		.context("failed to open LAN registry")?;
		let transfers = Arc::new(
			ReconciliationEngine::open(store, queue.clone(), network.clone(), clock, metrics.clone(), signal.clone())
				.await
				.context("failed to load transfers")?,
		);

		let (snapshot, _) = watch::channel(EngineSnapshot::default());
		let (shutdown, _) = watch::channel(false);
		let engine = Arc::new(Self {
			settings,
			options,
			metrics,
			signal,
			remote,
			queue,
			network,
			scheduler,
			cache,
			lan,
			transfers,
			lan_inbound: Mutex::new(Some(lan_inbound)),
			lan_listener,
			snapshot,
			shutdown,
			started: AtomicBool::new(false),
			tasks: Mutex::new(Vec::new()),
		});
		engine.refresh_snapshot().await;
		Ok(engine)
	}

	/// Spawn the background tasks. Calling it twice is a no-op.
	pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
		if self.started.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		let mut tasks = self.tasks.lock().await;

		tasks.push(tokio::spawn(self.scheduler.clone().run(self.shutdown.subscribe())));
		tasks.push(tokio::spawn(self.cache.clone().run_refresh_loop(self.shutdown.subscribe())));

		if let Some(inbound) = self.lan_inbound.lock().await.take() {
			tasks.push(tokio::spawn(self.lan.clone().run(inbound, self.shutdown.subscribe())));
		}
		if let Some(tcp) = &self.lan_listener {
			let port = self.settings.current().lan_listen_port;
			let listener = TcpListener::bind(("0.0.0.0", port))
				.await
				.with_context(|| format!("failed to bind LAN listener on port {}", port))?;
			tasks.push(tokio::spawn(tcp.clone().listen(listener, self.shutdown.subscribe())));
		}

		if self.options.probe_network {
			let network = self.network.clone();
			let remote = self.remote.clone();
			let settings = self.settings.subscribe();
			let shutdown = self.shutdown.subscribe();
			tasks.push(tokio::spawn(async move {
				network.run_probe_loop(remote, settings, shutdown).await;
			}));
		}
		if self.options.reload_config {
			let settings = self.settings.clone();
			let shutdown = self.shutdown.subscribe();
			tasks.push(tokio::spawn(async move {
				settings.run_reload_loop(shutdown).await;
			}));
		}

		let network_events = self.network.subscribe();
		tasks.push(tokio::spawn(
			self.clone()
				.refresh_on_reconnect(network_events, self.shutdown.subscribe()),
		));
		tasks.push(tokio::spawn(self.clone().publish_snapshots(self.shutdown.subscribe())));

		info!("engine started with {} background tasks", tasks.len());
		Ok(())
	}

	/// Signal every background task to stop and wait for them.
	pub async fn shutdown(&self) {
		self.shutdown.send_replace(true);
		let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
		for task in tasks {
			if let Err(e) = task.await {
				warn!("background task ended abnormally: {}", e);
			}
		}
		self.refresh_snapshot().await;
		info!("engine stopped");
	}

	pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
		self.snapshot.subscribe()
	}

	pub fn snapshot(&self) -> EngineSnapshot {
		self.snapshot.borrow().clone()
	}

	/// Recompute and publish the snapshot now.
	pub async fn refresh_snapshot(&self) -> EngineSnapshot {
		let counts = self.queue.counts().await;
		let sync = self.scheduler.state();
		let online = self.network.is_online();
		let next = EngineSnapshot {
			online,
			pending_count: counts.pending + counts.in_flight + counts.failed,
			dead_letter_count: counts.dead,
			last_success_at: sync.last_success_at,
			sync,
			peers: self.lan.peers().await,
			variances: self.transfers.variance_summaries().await,
		};
		self.metrics.network_online.set(i64::from(online));
		self.snapshot.send_if_modified(|current| {
			if *current == next {
				false
			} else {
				*current = next.clone();
				true
			}
		});
		next
	}

	async fn publish_snapshots(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		loop {
			self.refresh_snapshot().await;
			tokio::select! {
				_ = self.signal.notified() => {}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}
		}
		debug!("snapshot publisher stopped");
	}

	async fn refresh_on_reconnect(
		self: Arc<Self>,
		mut network: NetworkSubscription,
		mut shutdown: watch::Receiver<bool>,
	) {
		loop {
			tokio::select! {
				event = network.recv() => match event {
					Some(NetworkEvent::Online) => {
						let refreshed = self.cache.refresh_all().await;
						debug!("refreshed {} cache entries after reconnect", refreshed);
					}
					Some(NetworkEvent::Offline) => {}
					None => break,
				},
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}
		}
	}

	/// Ping the remote once and record the result.
	pub async fn probe_network(&self) -> bool {
		let reachable = self.remote.ping().await.is_ok();
		self.network.set_online(reachable);
		reachable
	}

	pub async fn enqueue(&self, mutation: NewMutation) -> SyncResult<EntryId> {
		let id = self.queue.enqueue(mutation).await?;
		self.metrics.mutations_enqueued_total.inc();
		Ok(id)
	}

	pub async fn sync_now(&self) -> Option<CycleReport> {
		self.scheduler.sync_now().await
	}

	pub fn set_auto_sync(&self, enabled: bool) {
		self.scheduler.set_auto_sync(enabled);
	}

	pub async fn track(&self, id: EntryId) -> SyncResult<Option<MutationQueueEntry>> {
		self.queue.track(id).await
	}

	pub async fn dead_letters(&self) -> Vec<MutationQueueEntry> {
		self.queue.dead_letters().await
	}

	pub async fn requeue_dead(&self, id: EntryId) -> SyncResult<()> {
		self.queue.requeue_dead(id).await?;
		self.scheduler.request_sync();
		Ok(())
	}

	pub async fn purge_dead(&self, id: EntryId) -> SyncResult<MutationQueueEntry> {
		self.queue.purge_dead(id).await
	}

	pub async fn fetch(&self, resource_key: &str) -> SyncResult<CachedValue> {
		self.cache.get(resource_key).await
	}

	pub async fn create_transfer(&self, req: NewTransfer) -> SyncResult<Transfer> {
		self.transfers.create(req).await
	}

	pub async fn receive(
		&self,
		transfer_id: &str,
		received: &HashMap<String, f64>,
		notes: Option<&str>,
	) -> SyncResult<VarianceReport> {
		self.transfers.receive(transfer_id, received, notes).await
	}

	pub fn settings(&self) -> &SettingsWatch {
		&self.settings
	}

	pub fn metrics(&self) -> &Arc<MetricsRegistry> {
		&self.metrics
	}

	pub fn queue(&self) -> &Arc<MutationQueue> {
		&self.queue
	}

	pub fn network(&self) -> &Arc<NetworkMonitor> {
		&self.network
	}

	pub fn scheduler(&self) -> &Arc<SyncScheduler> {
		&self.scheduler
	}

	pub fn cache(&self) -> &Arc<CacheManager> {
		&self.cache
	}

	pub fn lan(&self) -> &Arc<LanSubsystem> {
		&self.lan
	}

	pub fn transfers(&self) -> &Arc<ReconciliationEngine> {
		&self.transfers
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use async_trait::async_trait;
	use serde_json::{Value, json};

	use super::*;
	use crate::clock::ManualClock;
	use crate::lan::LanError;
	use crate::queue::MutationQueueEntry;
	use crate::remote::{ApplyAck, RemoteDataClient, RemoteError};
	use crate::store::MemoryStore;

	struct AcceptAll;

	#[async_trait]
	impl RemoteDataClient for AcceptAll {
		async fn apply(&self, _entry: &MutationQueueEntry) -> Result<ApplyAck, RemoteError> {
			Ok(ApplyAck::applied())
		}

		async fn fetch(&self, _resource_key: &str) -> Result<Value, RemoteError> {
			Ok(json!([]))
		}

		async fn ping(&self) -> Result<(), RemoteError> {
			Ok(())
		}
	}

	struct NoTransport;

	#[async_trait]
	impl crate::lan::LanTransport for NoTransport {
		async fn connect(&self, peer_id: &str, _address: &str) -> Result<(), LanError> {
			Err(LanError::NotConnected(peer_id.to_string()))
		}

		async fn send(&self, peer_id: &str, _msg: &LanMessage) -> Result<(), LanError> {
			Err(LanError::NotConnected(peer_id.to_string()))
		}

		async fn disconnect(&self, _peer_id: &str) {}
	}

	async fn engine() -> Arc<Engine> {
		let (_tx, rx) = mpsc::channel(8);
		let collaborators = Collaborators {
			store: Arc::new(MemoryStore::new()),
			remote: Arc::new(AcceptAll),
			clock: Arc::new(ManualClock::default()),
			transport: Arc::new(NoTransport),
			lan_inbound: rx,
			lan_listener: None,
		};
		let options = EngineOptions {
			initially_online: false,
			probe_network: false,
			reload_config: false,
		};
		Engine::build(
			Settings::default(),
			collaborators,
			options,
			Arc::new(MetricsRegistry::new().unwrap()),
		)
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn snapshot_tracks_enqueues() {
		let engine = engine().await;
		assert_eq!(engine.snapshot().pending_count, 0);

		engine
			.enqueue(NewMutation::update("products", "p-1", json!({ "price": 3 })))
			.await
			.unwrap();
		let snap = engine.refresh_snapshot().await;
		assert_eq!(snap.pending_count, 1);
		assert!(!snap.online);
		assert_eq!(engine.metrics().mutations_enqueued_total.get(), 1);
	}

	#[tokio::test]
	async fn start_and_shutdown_are_clean() {
		let engine = engine().await;
		engine.start().await.unwrap();
		engine.start().await.unwrap();
		engine.shutdown().await;
		assert!(engine.tasks.lock().await.is_empty());
	}
}
