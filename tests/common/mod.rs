//! Common test utilities and helpers for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backoffice_sync::clock::{ManualClock, SharedClock};
use backoffice_sync::config::Settings;
use backoffice_sync::engine::{Collaborators, Engine, EngineOptions, EngineSnapshot};
use backoffice_sync::lan::{LanError, LanMessage, LanTransport};
use backoffice_sync::observability::MetricsRegistry;
use backoffice_sync::queue::{MutationQueueEntry, Operation, is_local_id};
use backoffice_sync::remote::{ApplyAck, RemoteDataClient, RemoteError};
use backoffice_sync::store::{MemoryStore, SharedStore};
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc, watch};

/// One mutation as the mock remote saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
	pub operation: Operation,
	pub entity_type: String,
	pub entity_id: String,
	pub payload: Value,
	pub idempotency_key: String,
}

/// In-process stand-in for the central data service.
#[derive(Default)]
pub struct MockRemote {
	reachable: AtomicBool,
	applied: Mutex<Vec<Applied>>,
	attempts: Mutex<HashMap<String, usize>>,
	/// Applied idempotency keys and the server id each create was given.
	seen_keys: Mutex<HashMap<String, Option<String>>>,
	/// Entity ids whose next successful apply loses its response.
	lost_acks: Mutex<HashSet<String>>,
	/// Scripted failures per entity id, consumed front to back.
	failures: Mutex<HashMap<String, VecDeque<RemoteError>>>,
	resources: Mutex<HashMap<String, Value>>,
	fetches: Mutex<HashMap<String, usize>>,
	next_server_id: AtomicUsize,
	/// When set, every fetch waits for a permit.
	fetch_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockRemote {
	pub fn new() -> Arc<Self> {
		let remote = Self::default();
		remote.reachable.store(true, Ordering::SeqCst);
		Arc::new(remote)
	}

	pub fn set_reachable(&self, reachable: bool) {
		self.reachable.store(reachable, Ordering::SeqCst);
	}

	pub fn applied(&self) -> Vec<Applied> {
		self.applied.lock().unwrap().clone()
	}

	pub fn applied_ids(&self) -> Vec<String> {
		self.applied().into_iter().map(|a| a.entity_id).collect()
	}

	/// Calls to `apply` for `entity_id`, failed ones included.
	pub fn attempts(&self, entity_id: &str) -> usize {
		self.attempts.lock().unwrap().get(entity_id).copied().unwrap_or(0)
	}

	pub fn fail_next(&self, entity_id: &str, err: RemoteError) {
		self.failures
			.lock()
			.unwrap()
			.entry(entity_id.to_string())
			.or_default()
			.push_back(err);
	}

	pub fn fail_always(&self, entity_id: &str, err: RemoteError, times: usize) {
		for _ in 0..times {
			self.fail_next(entity_id, err.clone());
		}
	}

	/// Apply the next write for `entity_id` but fail the call as if the
	/// response never arrived.
	pub fn lose_next_ack(&self, entity_id: &str) {
		self.lost_acks.lock().unwrap().insert(entity_id.to_string());
	}

	pub fn set_resource(&self, key: &str, value: Value) {
		self.resources.lock().unwrap().insert(key.to_string(), value);
	}

	pub fn fetch_count(&self, key: &str) -> usize {
		self.fetches.lock().unwrap().get(key).copied().unwrap_or(0)
	}

	/// Hold every subsequent fetch until the returned semaphore gets permits.
	pub fn gate_fetches(&self) -> Arc<Semaphore> {
		let gate = Arc::new(Semaphore::new(0));
		*self.fetch_gate.lock().unwrap() = Some(gate.clone());
		gate
	}
}

#[async_trait]
impl RemoteDataClient for MockRemote {
	async fn apply(&self, entry: &MutationQueueEntry) -> Result<ApplyAck, RemoteError> {
		if !self.reachable.load(Ordering::SeqCst) {
			return Err(RemoteError::Transient("connection refused".into()));
		}
		*self
			.attempts
			.lock()
			.unwrap()
			.entry(entry.entity_id.clone())
			.or_default() += 1;
		if let Some(err) = self
			.failures
			.lock()
			.unwrap()
			.get_mut(&entry.entity_id)
			.and_then(VecDeque::pop_front)
		{
			return Err(err);
		}
		if let Some(server_id) = self.seen_keys.lock().unwrap().get(&entry.idempotency_key).cloned() {
			return Ok(ApplyAck {
				server_id,
				duplicate: true,
			});
		}
		self.applied.lock().unwrap().push(Applied {
			operation: entry.operation,
			entity_type: entry.entity_type.clone(),
			entity_id: entry.entity_id.clone(),
			payload: entry.payload.clone(),
			idempotency_key: entry.idempotency_key.clone(),
		});
		let server_id = (entry.operation == Operation::Create && is_local_id(&entry.entity_id))
			.then(|| format!("srv-{}", self.next_server_id.fetch_add(1, Ordering::SeqCst) + 1));
		self.seen_keys
			.lock()
			.unwrap()
			.insert(entry.idempotency_key.clone(), server_id.clone());
		if self.lost_acks.lock().unwrap().remove(&entry.entity_id) {
			return Err(RemoteError::Transient("response lost".into()));
		}
		Ok(ApplyAck {
			server_id,
			duplicate: false,
		})
	}

	async fn fetch(&self, resource_key: &str) -> Result<Value, RemoteError> {
		let gate = self.fetch_gate.lock().unwrap().clone();
		if let Some(gate) = gate {
			gate.acquire().await.map_err(|e| RemoteError::Transient(e.to_string()))?.forget();
		}
		*self
			.fetches
			.lock()
			.unwrap()
			.entry(resource_key.to_string())
			.or_default() += 1;
		if !self.reachable.load(Ordering::SeqCst) {
			return Err(RemoteError::Transient("connection refused".into()));
		}
		self.resources
			.lock()
			.unwrap()
			.get(resource_key)
			.cloned()
			.ok_or_else(|| RemoteError::Rejected(format!("no resource {}", resource_key)))
	}

	async fn ping(&self) -> Result<(), RemoteError> {
		if self.reachable.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(RemoteError::Transient("unreachable".into()))
		}
	}
}

/// LAN transport that never reaches anyone.
pub struct IsolatedTransport;

#[async_trait]
impl LanTransport for IsolatedTransport {
	async fn connect(&self, peer_id: &str, _address: &str) -> Result<(), LanError> {
		Err(LanError::NotConnected(peer_id.to_string()))
	}

	async fn send(&self, peer_id: &str, _msg: &LanMessage) -> Result<(), LanError> {
		Err(LanError::NotConnected(peer_id.to_string()))
	}

	async fn disconnect(&self, _peer_id: &str) {}
}

/// Settings with timers short enough for tests and no startup cycle in the
/// way.
pub fn test_settings() -> Settings {
	Settings {
		device_id: "pos-test".to_string(),
		startup_delay_ms: 3_600_000,
		background_interval_ms: 3_600_000,
		item_process_delay_ms: 0,
		network_probe_interval_ms: 3_600_000,
		retry_backoff_delays_ms: vec![0, 0, 0],
		max_retries: 3,
		..Settings::default()
	}
}

pub struct TestEngine {
	pub engine: Arc<Engine>,
	pub remote: Arc<MockRemote>,
	pub store: SharedStore,
	pub clock: ManualClock,
	/// Keeps the LAN inbound channel open.
	pub lan_tx: mpsc::Sender<LanMessage>,
}

pub async fn engine_with(settings: Settings, store: SharedStore, remote: Arc<MockRemote>) -> TestEngine {
	let clock = ManualClock::default();
	let shared_clock: SharedClock = Arc::new(clock.clone());
	let (lan_tx, lan_rx) = mpsc::channel(16);
	let engine = Engine::build(
		settings,
		Collaborators {
			store: store.clone(),
			remote: remote.clone(),
			clock: shared_clock,
			transport: Arc::new(IsolatedTransport),
			lan_inbound: lan_rx,
			lan_listener: None,
		},
		EngineOptions {
			initially_online: false,
			probe_network: false,
			reload_config: false,
		},
		Arc::new(MetricsRegistry::new().unwrap()),
	)
	.await
	.unwrap();
	TestEngine {
		engine,
		remote,
		store,
		clock,
		lan_tx,
	}
}

pub async fn engine() -> TestEngine {
	engine_with(test_settings(), Arc::new(MemoryStore::new()), MockRemote::new()).await
}

/// Wait until the published snapshot satisfies `pred`, failing after five
/// seconds.
pub async fn wait_for_snapshot(
	rx: &mut watch::Receiver<EngineSnapshot>,
	pred: impl Fn(&EngineSnapshot) -> bool,
) -> EngineSnapshot {
	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			{
				let snap = rx.borrow_and_update();
				if pred(&snap) {
					return snap.clone();
				}
			}
			rx.changed().await.unwrap();
		}
	})
	.await
	.expect("snapshot condition not reached in time")
}
