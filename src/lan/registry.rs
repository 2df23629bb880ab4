use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};

use super::message::{LanMessage, LanMessageKind};
use super::peer::{PeerConnection, PeerPolicy, PeerState};
use super::transport::SharedTransport;
use super::{LanError, parse_peer_spec};
use crate::clock::SharedClock;
use crate::config::SettingsRx;
use crate::observability::MetricsRegistry;
use crate::signal::ChangeSignal;
use crate::store::{SharedStore, list_json, put_json};

const KEY_PREFIX: &str = "peers/";

/// Messages buffered per peer while it is unreachable; the oldest are
/// dropped beyond this.
pub const MAX_OUTBOX_PER_PEER: usize = 256;

/// Observable peer lifecycle and inbound application data.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
	Connected(String),
	Stale(String),
	Disconnected(String),
	Message(LanMessage),
}

fn peer_key(peer_id: &str) -> String {
	format!("{}{}", KEY_PREFIX, peer_id)
}

pub struct LanSubsystem {
	transport: SharedTransport,
	store: SharedStore,
	settings: SettingsRx,
	clock: SharedClock,
	metrics: Arc<MetricsRegistry>,
	signal: ChangeSignal,
	peers: RwLock<BTreeMap<String, PeerConnection>>,
	outbox: Mutex<HashMap<String, VecDeque<LanMessage>>>,
	events: broadcast::Sender<PeerEvent>,
}

impl LanSubsystem {
	/// Load persisted peers and merge in the statically configured ones.
	pub async fn open(
		transport: SharedTransport,
		store: SharedStore,
		settings: SettingsRx,
		clock: SharedClock,
		metrics: Arc<MetricsRegistry>,
		signal: ChangeSignal,
	) -> Result<Arc<Self>, LanError> {
		let now = clock.now();
		let mut peers: BTreeMap<String, PeerConnection> = list_json::<PeerConnection>(store.as_ref(), KEY_PREFIX)
			.await?
			.into_iter()
			.map(|(_, p)| (p.peer_id.clone(), p))
			.collect();

		// Connections do not survive a restart: everything known starts stale.
		for peer in peers.values_mut() {
			if peer.state == PeerState::Connected {
				peer.state = PeerState::Stale;
				peer.next_reconnect_at = Some(now);
			}
		}

		let configured = settings.borrow().lan_peers.clone();
		for spec in configured {
			match parse_peer_spec(&spec) {
				Ok((id, address)) => {
					peers
						.entry(id.clone())
						.and_modify(|p| p.address = Some(address.clone()))
						.or_insert_with(|| PeerConnection::configured(&id, &address, now));
				}
				Err(e) => warn!("ignoring LAN peer: {}", e),
			}
		}
		for peer in peers.values() {
			put_json(store.as_ref(), &peer_key(&peer.peer_id), peer).await?;
		}
		debug!("LAN registry opened with {} peers", peers.len());

		let (events, _) = broadcast::channel(64);
		Ok(Arc::new(Self {
			transport,
			store,
			settings,
			clock,
			metrics,
			signal,
			peers: RwLock::new(peers),
			outbox: Mutex::new(HashMap::new()),
			events,
		}))
	}

	pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
		self.events.subscribe()
	}

	pub async fn peers(&self) -> Vec<PeerConnection> {
		self.peers.read().await.values().cloned().collect()
	}

	pub async fn peer(&self, peer_id: &str) -> Option<PeerConnection> {
		self.peers.read().await.get(peer_id).cloned()
	}

	pub async fn outbox_len(&self, peer_id: &str) -> usize {
		self.outbox.lock().await.get(peer_id).map_or(0, VecDeque::len)
	}

	fn device_id(&self) -> String {
		self.settings.borrow().device_id.clone()
	}

	fn emit(&self, event: PeerEvent) {
		let _ = self.events.send(event);
		self.signal.notify();
	}

	async fn persist(&self, peer: &PeerConnection) {
		if let Err(e) = put_json(self.store.as_ref(), &peer_key(&peer.peer_id), peer).await {
			warn!("failed to persist LAN peer {}: {}", peer.peer_id, e);
		}
	}

	async fn forget(&self, peer_id: &str) {
		self.peers.write().await.remove(peer_id);
		self.outbox.lock().await.remove(peer_id);
		self.transport.disconnect(peer_id).await;
		if let Err(e) = self.store.delete(&peer_key(peer_id)).await {
			warn!("failed to delete LAN peer {}: {}", peer_id, e);
		}
		self.emit(PeerEvent::Disconnected(peer_id.to_string()));
	}

	async fn update_connected_gauge(&self) {
		let connected = self
			.peers
			.read()
			.await
			.values()
			.filter(|p| p.state == PeerState::Connected)
			.count();
		self.metrics.lan_peers_connected.set(connected as i64);
	}

	/// Apply one inbound frame.
	pub async fn handle_message(&self, msg: LanMessage) {
		let device_id = self.device_id();
		if msg.from == device_id {
			return;
		}
		if msg.to.as_deref().is_some_and(|to| to != device_id) {
			return;
		}

		if msg.kind == LanMessageKind::NodeDeregister {
			if self.peers.read().await.contains_key(&msg.from) {
				info!("LAN peer {} deregistered", msg.from);
				self.forget(&msg.from).await;
				self.update_connected_gauge().await;
			}
			return;
		}

		// Any frame from a peer is proof of life.
		let now = self.clock.now();
		let (snapshot, restored) = {
			let mut peers = self.peers.write().await;
			let is_new = !peers.contains_key(&msg.from);
			let peer = peers
				.entry(msg.from.clone())
				.or_insert_with(|| PeerConnection::discovered(&msg.from, None, now));
			// Configured addresses win over advertised ones.
			if let (None, Some(addr)) = (&peer.address, msg.advertised_address()) {
				peer.address = Some(addr.to_string());
			}
			let restored = peer.record_heartbeat(now) || is_new;
			(peer.clone(), restored)
		};
		self.persist(&snapshot).await;

		if restored {
			info!("LAN peer {} connected", snapshot.peer_id);
			self.emit(PeerEvent::Connected(snapshot.peer_id.clone()));
			self.update_connected_gauge().await;
			self.flush_outbox(&snapshot.peer_id).await;
		}
		if msg.kind == LanMessageKind::Data {
			self.emit(PeerEvent::Message(msg));
		}
	}

	/// Send application data to a peer. While the peer is not connected the
	/// message waits in its outbox and goes out on reconnection.
	pub async fn send(&self, peer_id: &str, payload: Value) -> Result<(), LanError> {
		let state = self
			.peers
			.read()
			.await
			.get(peer_id)
			.map(|p| p.state)
			.ok_or_else(|| LanError::UnknownPeer(peer_id.to_string()))?;
		let msg = LanMessage::data(&self.device_id(), peer_id, payload, self.clock.now());

		if state == PeerState::Connected {
			match self.transport.send(peer_id, &msg).await {
				Ok(()) => return Ok(()),
				Err(e) => {
					warn!("send to LAN peer {} failed, buffering: {}", peer_id, e);
					self.mark_stale(peer_id).await;
				}
			}
		}
		self.buffer(peer_id, msg).await;
		Ok(())
	}

	/// Send application data to every known peer.
	pub async fn broadcast(&self, payload: Value) -> usize {
		let ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
		let mut sent = 0;
		for id in ids {
			if self.send(&id, payload.clone()).await.is_ok() {
				sent += 1;
			}
		}
		sent
	}

	async fn buffer(&self, peer_id: &str, msg: LanMessage) {
		let mut outbox = self.outbox.lock().await;
		let queue = outbox.entry(peer_id.to_string()).or_default();
		if queue.len() >= MAX_OUTBOX_PER_PEER {
			queue.pop_front();
			warn!("LAN outbox for {} full, dropped oldest message", peer_id);
		}
		queue.push_back(msg);
	}

	async fn flush_outbox(&self, peer_id: &str) {
		let pending = self.outbox.lock().await.remove(peer_id).unwrap_or_default();
		if pending.is_empty() {
			return;
		}
		debug!("flushing {} buffered messages to {}", pending.len(), peer_id);
		let mut pending = pending.into_iter();
		while let Some(msg) = pending.next() {
			if let Err(e) = self.transport.send(peer_id, &msg).await {
				warn!("flush to {} interrupted: {}", peer_id, e);
				let mut outbox = self.outbox.lock().await;
				let queue = outbox.entry(peer_id.to_string()).or_default();
				let mut remaining: VecDeque<LanMessage> = std::iter::once(msg).chain(pending).collect();
				remaining.append(queue);
				*queue = remaining;
				drop(outbox);
				self.mark_stale(peer_id).await;
				return;
			}
		}
	}

	async fn mark_stale(&self, peer_id: &str) {
		let policy = PeerPolicy::from_settings(&self.settings.borrow());
		let now = self.clock.now();
		let snapshot = {
			let mut peers = self.peers.write().await;
			match peers.get_mut(peer_id) {
				Some(peer) if peer.state == PeerState::Connected => {
					peer.mark_stale(now, &policy);
					peer.clone()
				}
				_ => return,
			}
		};
		self.persist(&snapshot).await;
		self.emit(PeerEvent::Stale(peer_id.to_string()));
		self.update_connected_gauge().await;
	}

	/// Send a heartbeat to every connected peer.
	pub async fn send_heartbeats(&self) {
		let connected: Vec<String> = self
			.peers
			.read()
			.await
			.values()
			.filter(|p| p.state == PeerState::Connected)
			.map(|p| p.peer_id.clone())
			.collect();
		let msg = LanMessage::heartbeat(&self.device_id(), self.clock.now());
		for id in connected {
			if let Err(e) = self.transport.send(&id, &msg).await {
				debug!("heartbeat to {} failed: {}", id, e);
				self.mark_stale(&id).await;
			}
		}
	}

	/// Advance every peer's state machine: detect silence, attempt due
	/// reconnects, and drop peers whose reconnect budget is spent.
	pub async fn supervise(&self) {
		let policy = PeerPolicy::from_settings(&self.settings.borrow());
		let now = self.clock.now();

		let mut went_stale = Vec::new();
		let mut due = Vec::new();
		{
			let mut peers = self.peers.write().await;
			for peer in peers.values_mut() {
				if peer.check_stale(now, &policy) {
					went_stale.push(peer.clone());
				}
				if peer.reconnect_due(now) {
					due.push((peer.peer_id.clone(), peer.address.clone()));
				}
			}
		}
		for peer in went_stale {
			warn!("LAN peer {} went stale", peer.peer_id);
			self.persist(&peer).await;
			self.emit(PeerEvent::Stale(peer.peer_id));
		}

		for (peer_id, address) in due {
			self.reconnect(&peer_id, address.as_deref(), &policy).await;
		}
		self.update_connected_gauge().await;
	}

	async fn reconnect(&self, peer_id: &str, address: Option<&str>, policy: &PeerPolicy) {
		self.metrics.lan_reconnect_attempts_total.inc();
		let result = match address {
			Some(addr) => self.handshake(peer_id, addr).await,
			// Discovered without an address: only the peer can come back.
			None => Err(LanError::NotConnected(peer_id.to_string())),
		};
		let now = self.clock.now();

		let snapshot = {
			let mut peers = self.peers.write().await;
			let Some(peer) = peers.get_mut(peer_id) else {
				return;
			};
			match &result {
				Ok(()) => {
					peer.record_heartbeat(now);
				}
				Err(e) => {
					let state = peer.record_reconnect_failure(now, policy);
					debug!(
						"reconnect to {} failed ({}), attempt {}/{}",
						peer_id, e, peer.reconnect_attempts, policy.max_reconnect_attempts
					);
					if state == PeerState::Disconnected {
						drop(peers);
						warn!(
							"LAN peer {} disconnected after {} reconnect attempts",
							peer_id, policy.max_reconnect_attempts
						);
						self.forget(peer_id).await;
						return;
					}
				}
			}
			peer.clone()
		};
		self.persist(&snapshot).await;

		if result.is_ok() {
			info!("LAN peer {} reconnected", peer_id);
			self.emit(PeerEvent::Connected(peer_id.to_string()));
			self.flush_outbox(peer_id).await;
		}
	}

	async fn handshake(&self, peer_id: &str, address: &str) -> Result<(), LanError> {
		self.transport.connect(peer_id, address).await?;
		let (device_id, port) = {
			let s = self.settings.borrow();
			(s.device_id.clone(), s.lan_listen_port)
		};
		let register = LanMessage::register(&device_id, &format!("{}:{}", local_host(), port), self.clock.now());
		self.transport.send(peer_id, &register).await
	}

	/// Tell every connected peer this device is leaving.
	pub async fn deregister_all(&self) {
		let msg = LanMessage::deregister(&self.device_id(), self.clock.now());
		let ids: Vec<String> = self
			.peers
			.read()
			.await
			.values()
			.filter(|p| p.state == PeerState::Connected)
			.map(|p| p.peer_id.clone())
			.collect();
		for id in ids {
			let _ = self.transport.send(&id, &msg).await;
			self.transport.disconnect(&id).await;
		}
	}

	/// Heartbeat, supervision and inbound loops until shutdown.
	pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<LanMessage>, mut shutdown: watch::Receiver<bool>) {
		let mut next_heartbeat = tokio::time::Instant::now();
		let mut next_supervise = tokio::time::Instant::now() + supervise_tick(&self.settings.borrow());
		loop {
			tokio::select! {
				_ = tokio::time::sleep_until(next_heartbeat) => {
					self.send_heartbeats().await;
					next_heartbeat = tokio::time::Instant::now() + self.settings.borrow().lan_heartbeat_interval();
				}
				// Absolute deadline: inbound traffic must not postpone supervision.
				_ = tokio::time::sleep_until(next_supervise) => {
					self.supervise().await;
					next_supervise = tokio::time::Instant::now() + supervise_tick(&self.settings.borrow());
				}
				msg = inbound.recv() => match msg {
					Some(msg) => self.handle_message(msg).await,
					None => break,
				},
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}
		}
		self.deregister_all().await;
		debug!("LAN subsystem stopped");
	}
}

/// Supervision granularity: fine enough to honour the shortest reconnect
/// backoff.
fn supervise_tick(s: &crate::config::Settings) -> Duration {
	Duration::from_millis(s.lan_reconnect_backoff_base_ms.clamp(100, 1_000))
}

fn local_host() -> String {
	hostname::get()
		.ok()
		.and_then(|h| h.into_string().ok())
		.unwrap_or_else(|| "localhost".to_string())
}
