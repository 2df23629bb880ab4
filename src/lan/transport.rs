use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};

use super::LanError;
use super::message::{LanMessage, read_frame, write_frame};

/// Moves frames between this device and its LAN peers. Inbound frames are
/// delivered on the channel handed to the transport at construction.
#[async_trait]
pub trait LanTransport: Send + Sync + 'static {
	/// Open (or reopen) a connection to `peer_id` at `address`.
	async fn connect(&self, peer_id: &str, address: &str) -> Result<(), LanError>;

	async fn send(&self, peer_id: &str, msg: &LanMessage) -> Result<(), LanError>;

	async fn disconnect(&self, peer_id: &str);
}

pub type SharedTransport = Arc<dyn LanTransport>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type PeerWriter = Arc<Mutex<OwnedWriteHalf>>;

/// TCP transport speaking length-prefixed JSON frames. Each peer has its own
/// writer lock, so one stalled socket never holds up the others.
pub struct TcpLanTransport {
	writers: Mutex<HashMap<String, PeerWriter>>,
	inbound: mpsc::Sender<LanMessage>,
	write_timeout: Duration,
}

impl TcpLanTransport {
	pub fn new(inbound: mpsc::Sender<LanMessage>) -> Arc<Self> {
		Self::with_write_timeout(inbound, WRITE_TIMEOUT)
	}

	pub fn with_write_timeout(inbound: mpsc::Sender<LanMessage>, write_timeout: Duration) -> Arc<Self> {
		Arc::new(Self {
			writers: Mutex::new(HashMap::new()),
			inbound,
			write_timeout,
		})
	}

	fn spawn_reader(&self, label: String, mut reader: tokio::net::tcp::OwnedReadHalf) {
		let inbound = self.inbound.clone();
		tokio::spawn(async move {
			loop {
				match read_frame(&mut reader).await {
					Ok(msg) => {
						if inbound.send(msg).await.is_err() {
							break;
						}
					}
					Err(LanError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
						debug!("LAN connection {} closed", label);
						break;
					}
					Err(e) => {
						warn!("dropping LAN connection {}: {}", label, e);
						break;
					}
				}
			}
		});
	}

	/// Accept inbound connections until shutdown. Each connection's frames go
	/// to the inbound channel; the registry learns who sent them from `from`.
	pub async fn listen(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
		if let Ok(addr) = listener.local_addr() {
			info!("LAN listener on {}", addr);
		}
		loop {
			tokio::select! {
				accepted = listener.accept() => match accepted {
					Ok((stream, remote)) => {
						let (reader, _writer) = stream.into_split();
						self.spawn_reader(remote.to_string(), reader);
					}
					Err(e) => warn!("LAN accept failed: {}", e),
				},
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
			}
		}
		debug!("LAN listener stopped");
	}
}

#[async_trait]
impl LanTransport for TcpLanTransport {
	async fn connect(&self, peer_id: &str, address: &str) -> Result<(), LanError> {
		let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
			.await
			.map_err(|_| LanError::Timeout(address.to_string()))??;
		stream.set_nodelay(true)?;
		let (reader, writer) = stream.into_split();
		self.spawn_reader(peer_id.to_string(), reader);
		self.writers
			.lock()
			.await
			.insert(peer_id.to_string(), Arc::new(Mutex::new(writer)));
		debug!("connected to LAN peer {} at {}", peer_id, address);
		Ok(())
	}

	async fn send(&self, peer_id: &str, msg: &LanMessage) -> Result<(), LanError> {
		let writer = self
			.writers
			.lock()
			.await
			.get(peer_id)
			.cloned()
			.ok_or_else(|| LanError::NotConnected(peer_id.to_string()))?;

		let written = {
			let mut w = writer.lock().await;
			match tokio::time::timeout(self.write_timeout, write_frame(&mut *w, msg)).await {
				Ok(result) => result,
				Err(_) => Err(LanError::Timeout(peer_id.to_string())),
			}
		};
		if let Err(e) = written {
			// A reconnect may already have replaced this writer.
			let mut writers = self.writers.lock().await;
			if writers.get(peer_id).is_some_and(|w| Arc::ptr_eq(w, &writer)) {
				writers.remove(peer_id);
			}
			return Err(e);
		}
		Ok(())
	}

	async fn disconnect(&self, peer_id: &str) {
		self.writers.lock().await.remove(peer_id);
	}
}
