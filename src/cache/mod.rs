//! TTL read cache with stale-while-revalidate.
//!
//! A fresh entry is served without touching the remote. A stale entry is
//! served immediately while one background refetch replaces it. An
//! invalidated entry is refetched before the read returns.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, watch};

use crate::clock::SharedClock;
use crate::config::{Settings, SettingsRx};
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::observability::MetricsRegistry;
use crate::remote::SharedRemote;
use crate::store::{SharedStore, StoreError, list_json, put_json};

const KEY_PREFIX: &str = "cache/";

/// Resource keys in this class keep the longer orders-history TTL.
pub const ORDERS_CLASS_PREFIX: &str = "orders";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
	pub resource_key: String,
	pub payload: Value,
	pub fetched_at: DateTime<Utc>,
	pub ttl_ms: i64,
	#[serde(default)]
	pub invalidated: bool,
}

impl CacheEntry {
	pub fn ttl(&self) -> Duration {
		Duration::milliseconds(self.ttl_ms)
	}

	pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
		!self.invalidated && now - self.fetched_at < self.ttl()
	}
}

/// How a read was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
	/// Within its TTL.
	Fresh,
	/// Past its TTL; a background refetch is (or already was) scheduled.
	Stale,
	/// Fetched from the remote during this read.
	Fetched,
	/// Synchronous refetch failed; the previous payload was served.
	Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
	pub payload: Value,
	pub fetched_at: DateTime<Utc>,
	pub freshness: Freshness,
}

impl CachedValue {
	fn from_entry(entry: &CacheEntry, freshness: Freshness) -> Self {
		Self {
			payload: entry.payload.clone(),
			fetched_at: entry.fetched_at,
			freshness,
		}
	}
}

/// TTL class for a resource key.
pub fn ttl_for(settings: &Settings, resource_key: &str) -> Duration {
	let hours = if resource_key.starts_with(ORDERS_CLASS_PREFIX) {
		settings.cache_ttl_orders_hours
	} else {
		settings.cache_ttl_default_hours
	};
	i64::try_from(hours)
		.ok()
		.and_then(Duration::try_hours)
		.unwrap_or(Duration::MAX)
}

pub struct CacheManager {
	store: SharedStore,
	remote: SharedRemote,
	network: Arc<NetworkMonitor>,
	settings: SettingsRx,
	clock: SharedClock,
	metrics: Arc<MetricsRegistry>,
	entries: RwLock<HashMap<String, CacheEntry>>,
	refreshing: Mutex<HashSet<String>>,
}

fn entry_key(resource_key: &str) -> String {
	format!("{}{}", KEY_PREFIX, resource_key)
}

impl CacheManager {
	pub async fn open(
		store: SharedStore,
		remote: SharedRemote,
		network: Arc<NetworkMonitor>,
		settings: SettingsRx,
		clock: SharedClock,
		metrics: Arc<MetricsRegistry>,
	) -> Result<Arc<Self>, StoreError> {
		let entries: HashMap<String, CacheEntry> = list_json::<CacheEntry>(store.as_ref(), KEY_PREFIX)
			.await?
			.into_iter()
			.map(|(_, e)| (e.resource_key.clone(), e))
			.collect();
		debug!("cache opened with {} persisted entries", entries.len());

		Ok(Arc::new(Self {
			store,
			remote,
			network,
			settings,
			clock,
			metrics,
			entries: RwLock::new(entries),
			refreshing: Mutex::new(HashSet::new()),
		}))
	}

	pub async fn get(self: &Arc<Self>, resource_key: &str) -> SyncResult<CachedValue> {
		let now = self.clock.now();
		let cached = self.entries.read().await.get(resource_key).cloned();

		match cached {
			Some(entry) if entry.is_fresh(now) => {
				self.metrics.cache_hits_total.inc();
				Ok(CachedValue::from_entry(&entry, Freshness::Fresh))
			}
			Some(entry) if !entry.invalidated => {
				self.metrics.cache_hits_total.inc();
				if self.network.is_online() {
					self.spawn_refresh(resource_key);
				}
				Ok(CachedValue::from_entry(&entry, Freshness::Stale))
			}
			Some(entry) => {
				self.metrics.cache_misses_total.inc();
				if !self.network.is_online() {
					return Ok(CachedValue::from_entry(&entry, Freshness::Fallback));
				}
				match self.fetch_and_store(resource_key).await {
					Ok(fresh) => Ok(CachedValue::from_entry(&fresh, Freshness::Fetched)),
					Err(e) => {
						warn!("refetch of invalidated {} failed, serving previous payload: {}", resource_key, e);
						Ok(CachedValue::from_entry(&entry, Freshness::Fallback))
					}
				}
			}
			None => {
				self.metrics.cache_misses_total.inc();
				if !self.network.is_online() {
					return Err(SyncError::ConnectivityRequired);
				}
				let fresh = self.fetch_and_store(resource_key).await?;
				Ok(CachedValue::from_entry(&fresh, Freshness::Fetched))
			}
		}
	}

	/// Force the next read of `resource_key` to refetch before returning.
	pub async fn invalidate(&self, resource_key: &str) -> SyncResult<bool> {
		let mut entries = self.entries.write().await;
		let Some(entry) = entries.get_mut(resource_key) else {
			return Ok(false);
		};
		entry.invalidated = true;
		put_json(self.store.as_ref(), &entry_key(resource_key), &*entry).await?;
		debug!("cache entry {} invalidated", resource_key);
		Ok(true)
	}

	/// Refetch every known entry. Returns how many were refreshed.
	pub async fn refresh_all(&self) -> usize {
		if !self.network.is_online() {
			debug!("skipping cache refresh: offline");
			return 0;
		}
		let keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
		let mut refreshed = 0;
		for key in keys {
			match self.fetch_and_store(&key).await {
				Ok(_) => refreshed += 1,
				Err(e) => warn!("cache refresh of {} failed: {}", key, e),
			}
		}
		if refreshed > 0 {
			info!("refreshed {} cache entries", refreshed);
		}
		refreshed
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}

	pub async fn entry(&self, resource_key: &str) -> Option<CacheEntry> {
		self.entries.read().await.get(resource_key).cloned()
	}

	fn spawn_refresh(self: &Arc<Self>, resource_key: &str) {
		{
			let mut refreshing = self.refreshing.lock().unwrap_or_else(|p| p.into_inner());
			if !refreshing.insert(resource_key.to_string()) {
				return;
			}
		}
		let this = Arc::clone(self);
		let key = resource_key.to_string();
		tokio::spawn(async move {
			if let Err(e) = this.fetch_and_store(&key).await {
				warn!("background refresh of {} failed: {}", key, e);
			}
			this.refreshing
				.lock()
				.unwrap_or_else(|p| p.into_inner())
				.remove(&key);
		});
	}

	async fn fetch_and_store(&self, resource_key: &str) -> SyncResult<CacheEntry> {
		let fetched = self.remote.fetch(resource_key).await;
		let payload = match fetched {
			Ok(payload) => payload,
			Err(e) => {
				self.metrics.cache_refresh_failures_total.inc();
				return Err(e.into());
			}
		};

		let ttl = ttl_for(&self.settings.borrow(), resource_key);
		let entry = CacheEntry {
			resource_key: resource_key.to_string(),
			payload,
			fetched_at: self.clock.now(),
			ttl_ms: ttl.num_milliseconds(),
			invalidated: false,
		};
		put_json(self.store.as_ref(), &entry_key(resource_key), &entry).await?;
		self.entries
			.write()
			.await
			.insert(resource_key.to_string(), entry.clone());
		self.metrics.cache_refreshes_total.inc();
		debug!("cache entry {} refreshed", resource_key);
		Ok(entry)
	}

	/// Refresh everything every `cache_refresh_interval_hours` until shutdown.
	pub async fn run_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		loop {
			let wait = self.settings.borrow().cache_refresh_interval();
			tokio::select! {
				_ = tokio::time::sleep(wait) => {
					self.refresh_all().await;
				}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}
		}
		debug!("cache refresh loop stopped");
	}
}
