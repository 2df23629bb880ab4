use thiserror::Error;

use crate::queue::EntryId;
use crate::store::StoreError;

/// Errors surfaced to callers of the engine.
///
/// Queued writes absorb transient network failures in the retry ladder; only
/// direct reads (a cold cache miss) report them as `TransientNetwork`.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("transient network error: {0}")]
	TransientNetwork(String),

	#[error("validation failed: {0}")]
	Validation(String),

	#[error("mutation queue full (max: {max})")]
	QueueFull { max: usize },

	#[error("remote conflict: {0}")]
	Conflict(String),

	#[error("mutation {id} exhausted its retry budget: {reason}")]
	DeadLetter { id: EntryId, reason: String },

	#[error("operation requires connectivity to the central store")]
	ConnectivityRequired,

	#[error("transfer {0} has already been received")]
	AlreadyReceived(String),

	#[error("invalid state: {0}")]
	InvalidState(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("store error: {0}")]
	Store(#[from] StoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl From<crate::remote::RemoteError> for SyncError {
	fn from(e: crate::remote::RemoteError) -> Self {
		use crate::remote::RemoteError;
		match e {
			RemoteError::Transient(msg) => SyncError::TransientNetwork(msg),
			RemoteError::Conflict(msg) => SyncError::Conflict(msg),
			RemoteError::Rejected(msg) => SyncError::Validation(msg),
		}
	}
}
