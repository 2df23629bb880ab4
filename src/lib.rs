pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lan;
pub mod network;
pub mod observability;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod signal;
pub mod status;
pub mod store;
pub mod sync;
pub mod transfer;

use anyhow::Context;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::engine::Engine;

/// Run the engine and its status surface until Ctrl-C.
pub async fn run(
	settings: config::Settings,
	metrics: std::sync::Arc<observability::MetricsRegistry>,
) -> anyhow::Result<()> {
	let addr = format!("{}:{}", settings.status_host, settings.status_port);
	info!(
		"starting sync engine for device {} against {}",
		settings.device_id, settings.remote_base_url
	);

	let engine = Engine::open(settings, metrics).await?;
	engine.start().await?;

	let listener = TcpListener::bind(&addr)
		.await
		.with_context(|| format!("failed to bind status surface on {}", addr))?;
	let (stop_tx, stop_rx) = watch::channel(false);
	let server = tokio::spawn(status::serve(engine.clone(), listener, stop_rx));

	tokio::signal::ctrl_c()
		.await
		.context("failed to listen for shutdown signal")?;
	info!("shutdown requested");

	stop_tx.send_replace(true);
	match server.await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => warn!("status surface failed: {}", e),
		Err(e) => warn!("status surface task ended abnormally: {}", e),
	}
	engine.shutdown().await;
	Ok(())
}
