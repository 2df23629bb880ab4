//! Remote data service collaborator.
//!
//! The engine only ever talks to the central service through
//! [`RemoteDataClient`], so tests substitute an in-process double and the
//! binary plugs in [`http::HttpRemoteClient`].

pub mod http;

pub use http::HttpRemoteClient;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::queue::{FailureKind, MutationQueueEntry};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
	/// Timeouts, connection failures, 5xx. Retried on the backoff ladder.
	#[error("transient remote failure: {0}")]
	Transient(String),

	/// The remote holds a newer version of the entity.
	#[error("remote conflict: {0}")]
	Conflict(String),

	/// The remote refused the payload outright.
	#[error("remote rejected mutation: {0}")]
	Rejected(String),
}

impl RemoteError {
	pub fn failure_kind(&self) -> FailureKind {
		match self {
			RemoteError::Transient(_) => FailureKind::Transient,
			RemoteError::Conflict(_) => FailureKind::Conflict,
			RemoteError::Rejected(_) => FailureKind::Rejected,
		}
	}

	pub fn is_transient(&self) -> bool {
		matches!(self, RemoteError::Transient(_))
	}
}

/// Positive answer to an applied mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyAck {
	/// Id assigned by the remote to an entity created under a local id.
	pub server_id: Option<String>,
	/// The idempotency key had already been applied; nothing changed remotely.
	pub duplicate: bool,
}

impl ApplyAck {
	pub fn applied() -> Self {
		Self::default()
	}
}

#[async_trait]
pub trait RemoteDataClient: Send + Sync + 'static {
	/// Apply one queued mutation. Implementations must forward the entry's
	/// idempotency key.
	async fn apply(&self, entry: &MutationQueueEntry) -> Result<ApplyAck, RemoteError>;

	/// Read a resource for the cache.
	async fn fetch(&self, resource_key: &str) -> Result<Value, RemoteError>;

	/// Cheap reachability check used by the network probe.
	async fn ping(&self) -> Result<(), RemoteError>;
}

pub type SharedRemote = Arc<dyn RemoteDataClient>;
