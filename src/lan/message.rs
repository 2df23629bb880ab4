use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::LanError;

/// Maximum encoded frame size accepted on the wire (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanMessageKind {
	Heartbeat,
	NodeRegister,
	NodeDeregister,
	Data,
}

/// One frame exchanged between devices on the local network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanMessage {
	pub id: String,
	#[serde(rename = "type")]
	pub kind: LanMessageKind,
	pub from: String,
	/// Target device; `None` means broadcast.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub to: Option<String>,
	pub timestamp: DateTime<Utc>,
	#[serde(default)]
	pub payload: Value,
}

impl LanMessage {
	pub fn new(kind: LanMessageKind, from: &str, to: Option<&str>, payload: Value, now: DateTime<Utc>) -> Self {
		Self {
			id: format!("{}-{}-{:08x}", from, now.timestamp_millis(), rand::random::<u32>()),
			kind,
			from: from.to_string(),
			to: to.map(str::to_string),
			timestamp: now,
			payload,
		}
	}

	pub fn heartbeat(from: &str, now: DateTime<Utc>) -> Self {
		Self::new(LanMessageKind::Heartbeat, from, None, Value::Null, now)
	}

	/// Announce this device and the address it listens on.
	pub fn register(from: &str, address: &str, now: DateTime<Utc>) -> Self {
		Self::new(
			LanMessageKind::NodeRegister,
			from,
			None,
			serde_json::json!({ "address": address }),
			now,
		)
	}

	pub fn deregister(from: &str, now: DateTime<Utc>) -> Self {
		Self::new(LanMessageKind::NodeDeregister, from, None, Value::Null, now)
	}

	pub fn data(from: &str, to: &str, payload: Value, now: DateTime<Utc>) -> Self {
		Self::new(LanMessageKind::Data, from, Some(to), payload, now)
	}

	/// Listening address advertised in a `node_register` payload.
	pub fn advertised_address(&self) -> Option<&str> {
		self.payload.get("address").and_then(Value::as_str)
	}
}

/// Write one length-prefixed JSON frame (4-byte big-endian length).
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, msg: &LanMessage) -> Result<(), LanError> {
	let json = serde_json::to_vec(msg)?;
	let len = json.len();
	if len > MAX_FRAME_SIZE {
		return Err(LanError::FrameTooLarge {
			size: len,
			max: MAX_FRAME_SIZE,
		});
	}

	writer.write_all(&(len as u32).to_be_bytes()).await?;
	writer.write_all(&json).await?;
	writer.flush().await?;
	Ok(())
}

/// Read one frame written by [`write_frame`].
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<LanMessage, LanError> {
	let mut len_bytes = [0u8; 4];
	reader.read_exact(&mut len_bytes).await?;
	let len = u32::from_be_bytes(len_bytes) as usize;
	if len > MAX_FRAME_SIZE {
		return Err(LanError::FrameTooLarge {
			size: len,
			max: MAX_FRAME_SIZE,
		});
	}

	let mut buf = vec![0u8; len];
	reader.read_exact(&mut buf).await?;
	Ok(serde_json::from_slice(&buf)?)
}
