//! LAN peer subsystem: heartbeats, staleness detection and reconnection for
//! the other devices on the shop floor (kitchen displays, customer displays,
//! other tills). Runs independently of the sync scheduler.

pub mod message;
pub mod peer;
pub mod registry;
pub mod transport;

pub use message::{LanMessage, LanMessageKind};
pub use peer::{PeerConnection, PeerPolicy, PeerState};
pub use registry::{LanSubsystem, PeerEvent};
pub use transport::{LanTransport, SharedTransport, TcpLanTransport};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LanError {
	#[error("LAN I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("malformed LAN frame: {0}")]
	Decode(#[from] serde_json::Error),

	#[error("frame size {size} exceeds maximum {max}")]
	FrameTooLarge { size: usize, max: usize },

	#[error("connection to {0} timed out")]
	Timeout(String),

	#[error("peer {0} is not connected")]
	NotConnected(String),

	#[error("unknown peer {0}")]
	UnknownPeer(String),

	#[error("invalid peer spec {0:?}, expected id@host:port")]
	InvalidPeerSpec(String),

	#[error(transparent)]
	Store(#[from] crate::store::StoreError),
}

/// Parse a configured peer written as `id@host:port`.
pub fn parse_peer_spec(spec: &str) -> Result<(String, String), LanError> {
	let (id, address) = spec
		.trim()
		.split_once('@')
		.ok_or_else(|| LanError::InvalidPeerSpec(spec.to_string()))?;
	let valid_address = address
		.rsplit_once(':')
		.is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
	if id.is_empty() || !valid_address {
		return Err(LanError::InvalidPeerSpec(spec.to_string()));
	}
	Ok((id.to_string(), address.to_string()))
}
