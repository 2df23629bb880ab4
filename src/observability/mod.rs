pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{MetricsRegistry, init_metrics};

use std::sync::Arc;

use log::{Level, info};

/// Observability handles shared by the engine and the status surface.
pub struct ObservabilityState {
	pub metrics: Arc<MetricsRegistry>,
}

/// Initialize logging at `level` and build the metrics registry.
pub fn init_observability(level: Level) -> anyhow::Result<ObservabilityState> {
	init_logging(level)?;
	let metrics = init_metrics()?;

	info!("observability initialized: logging at {}, prometheus metrics enabled", level);

	Ok(ObservabilityState { metrics })
}
