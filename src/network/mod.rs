//! Network status monitor.

use std::sync::Mutex;

use log::{debug, info};
use tokio::sync::{broadcast, watch};

use crate::config::SettingsRx;
use crate::remote::SharedRemote;
use crate::signal::ChangeSignal;

/// Connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
	Online,
	Offline,
}

impl NetworkEvent {
	fn from_online(online: bool) -> Self {
		if online { Self::Online } else { Self::Offline }
	}
}

/// Receives one event per connectivity transition. Dropping it unsubscribes.
pub struct NetworkSubscription {
	rx: broadcast::Receiver<NetworkEvent>,
}

impl NetworkSubscription {
	/// Next transition, or `None` once the monitor is gone. A subscriber that
	/// fell behind skips to the newest transitions.
	pub async fn recv(&mut self) -> Option<NetworkEvent> {
		loop {
			match self.rx.recv().await {
				Ok(event) => return Some(event),
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					debug!("network subscriber lagged by {} events", skipped);
				}
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	}
}

pub struct NetworkMonitor {
	online: Mutex<bool>,
	events: broadcast::Sender<NetworkEvent>,
	signal: ChangeSignal,
}

impl NetworkMonitor {
	pub fn new(initially_online: bool, signal: ChangeSignal) -> Self {
		let (events, _) = broadcast::channel(16);
		Self {
			online: Mutex::new(initially_online),
			events,
			signal,
		}
	}

	pub fn is_online(&self) -> bool {
		*self.online.lock().unwrap_or_else(|p| p.into_inner())
	}

	pub fn subscribe(&self) -> NetworkSubscription {
		NetworkSubscription {
			rx: self.events.subscribe(),
		}
	}

	/// Record the observed connectivity. Returns `true` (and notifies
	/// subscribers) only when this changes the state.
	pub fn set_online(&self, online: bool) -> bool {
		let mut current = self.online.lock().unwrap_or_else(|p| p.into_inner());
		if *current == online {
			return false;
		}
		*current = online;
		// Sent under the lock so subscribers see transitions in order.
		let _ = self.events.send(NetworkEvent::from_online(online));
		drop(current);

		info!("network is now {}", if online { "online" } else { "offline" });
		self.signal.notify();
		true
	}

	/// Ping the remote every `network_probe_interval_ms` and feed the result
	/// into the monitor until shutdown.
	pub async fn run_probe_loop(
		&self,
		remote: SharedRemote,
		settings: SettingsRx,
		mut shutdown: watch::Receiver<bool>,
	) {
		loop {
			let reachable = remote.ping().await.is_ok();
			self.set_online(reachable);

			let wait = settings.borrow().network_probe_interval();
			tokio::select! {
				_ = tokio::time::sleep(wait) => {}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}
		}
		debug!("network probe stopped");
	}
}
