use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

const NAMESPACE: &str = "backoffice_sync";

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Sync scheduler
	pub sync_cycles_total: IntCounter,
	pub sync_cycles_aborted_total: IntCounter,
	pub sync_cycle_duration_seconds: Histogram,
	pub mutations_enqueued_total: IntCounter,
	pub mutations_synced_total: IntCounter,
	pub mutations_failed_total: IntCounter,
	pub mutations_dead_lettered_total: IntCounter,
	pub queue_depth: IntGauge,
	pub dead_letter_depth: IntGauge,
	pub network_online: IntGauge,

	// Cache manager
	pub cache_hits_total: IntCounter,
	pub cache_misses_total: IntCounter,
	pub cache_refreshes_total: IntCounter,
	pub cache_refresh_failures_total: IntCounter,

	// LAN peers
	pub lan_reconnect_attempts_total: IntCounter,
	pub lan_peers_connected: IntGauge,

	// Transfers
	pub transfers_received_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
	let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
	registry.register(Box::new(c.clone()))?;
	Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
	let g = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
	registry.register(Box::new(g.clone()))?;
	Ok(g)
}

impl MetricsRegistry {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let sync_cycle_duration_seconds = Histogram::with_opts(
			HistogramOpts::new("sync_cycle_duration_seconds", "Duration of sync cycles in seconds")
				.namespace(NAMESPACE)
				.buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0]),
		)?;
		registry.register(Box::new(sync_cycle_duration_seconds.clone()))?;

		Ok(Self {
			sync_cycles_total: counter(&registry, "sync_cycles_total", "Sync cycles run")?,
			sync_cycles_aborted_total: counter(
				&registry,
				"sync_cycles_aborted_total",
				"Sync cycles cut short by losing connectivity",
			)?,
			sync_cycle_duration_seconds,
			mutations_enqueued_total: counter(
				&registry,
				"mutations_enqueued_total",
				"Mutations accepted into the queue",
			)?,
			mutations_synced_total: counter(
				&registry,
				"mutations_synced_total",
				"Mutations confirmed by the remote",
			)?,
			mutations_failed_total: counter(
				&registry,
				"mutations_failed_total",
				"Failed mutation attempts",
			)?,
			mutations_dead_lettered_total: counter(
				&registry,
				"mutations_dead_lettered_total",
				"Mutations moved to the dead-letter set",
			)?,
			queue_depth: gauge(&registry, "queue_depth", "Mutations waiting to reach the remote")?,
			dead_letter_depth: gauge(&registry, "dead_letter_depth", "Mutations awaiting operator review")?,
			network_online: gauge(&registry, "network_online", "1 when the remote is reachable")?,
			cache_hits_total: counter(&registry, "cache_hits_total", "Cache reads served from a fresh entry")?,
			cache_misses_total: counter(&registry, "cache_misses_total", "Cache reads that had to fetch")?,
			cache_refreshes_total: counter(&registry, "cache_refreshes_total", "Cache entries refetched")?,
			cache_refresh_failures_total: counter(
				&registry,
				"cache_refresh_failures_total",
				"Cache refetches that failed",
			)?,
			lan_reconnect_attempts_total: counter(
				&registry,
				"lan_reconnect_attempts_total",
				"Reconnect attempts towards LAN peers",
			)?,
			lan_peers_connected: gauge(&registry, "lan_peers_connected", "LAN peers currently connected")?,
			transfers_received_total: counter(
				&registry,
				"transfers_received_total",
				"Transfers reconciled and received",
			)?,
			registry,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("Failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

/// Initialize the metrics registry
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()?))
}
