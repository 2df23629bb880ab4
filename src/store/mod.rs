//! Local durable key/value store.
//!
//! Queue entries, cache entries, peer state and transfers all live here under
//! a namespace prefix (`queue/`, `cache/`, `peers/`, `transfers/`). `list`
//! returns entries in key order, which the queue relies on for FIFO replay.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{
	SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tokio::sync::RwLock;

/// Database file created inside the configured store directory.
pub const STORE_FILE: &str = "backoffice-sync.db";

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("store I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("store database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("store record is corrupt at {key}: {source}")]
	Corrupt {
		key: String,
		#[source]
		source: serde_json::Error,
	},

	#[error("failed to encode record for {key}: {source}")]
	Encode {
		key: String,
		#[source]
		source: serde_json::Error,
	},
}

/// Trait abstraction for persistence so tests can substitute an in-memory
/// implementation.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
	async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
	async fn delete(&self, key: &str) -> Result<(), StoreError>;
	/// All entries whose key starts with `prefix`, ordered by key.
	async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
	/// Apply every put and delete, or none of them.
	async fn write_batch(
		&self,
		puts: Vec<(String, Vec<u8>)>,
		deletes: Vec<String>,
	) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn KvStore>;

pub async fn get_json<T: DeserializeOwned>(
	store: &dyn KvStore,
	key: &str,
) -> Result<Option<T>, StoreError> {
	match store.get(key).await? {
		Some(bytes) => serde_json::from_slice(&bytes)
			.map(Some)
			.map_err(|source| StoreError::Corrupt {
				key: key.to_string(),
				source,
			}),
		None => Ok(None),
	}
}

pub fn encode_json<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
	serde_json::to_vec(value).map_err(|source| StoreError::Encode {
		key: key.to_string(),
		source,
	})
}

pub async fn put_json<T: Serialize>(
	store: &dyn KvStore,
	key: &str,
	value: &T,
) -> Result<(), StoreError> {
	store.put(key, encode_json(key, value)?).await
}

pub async fn list_json<T: DeserializeOwned>(
	store: &dyn KvStore,
	prefix: &str,
) -> Result<Vec<(String, T)>, StoreError> {
	let mut out = Vec::new();
	for (key, bytes) in store.list(prefix).await? {
		let value = serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
			key: key.clone(),
			source,
		})?;
		out.push((key, value));
	}
	Ok(out)
}

/// In-process store. Nothing survives the process; used by tests and by the
/// CLI when no store directory is configured.
#[derive(Default)]
pub struct MemoryStore {
	entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl KvStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		Ok(self.entries.read().await.get(key).cloned())
	}

	async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
		self.entries.write().await.insert(key.to_string(), value);
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.entries.write().await.remove(key);
		Ok(())
	}

	async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
		let entries = self.entries.read().await;
		Ok(entries
			.range(prefix.to_string()..)
			.take_while(|(k, _)| k.starts_with(prefix))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect())
	}

	async fn write_batch(
		&self,
		puts: Vec<(String, Vec<u8>)>,
		deletes: Vec<String>,
	) -> Result<(), StoreError> {
		let mut entries = self.entries.write().await;
		for (key, value) in puts {
			entries.insert(key, value);
		}
		for key in deletes {
			entries.remove(&key);
		}
		Ok(())
	}
}

/// SQLite-backed store: one `kv` table keyed by the namespaced key. Runs in
/// WAL mode with full synchronous commits, so an acknowledged write survives
/// power loss.
pub struct SqliteStore {
	pool: SqlitePool,
}

impl SqliteStore {
	/// Open (creating if needed) the database inside `dir`.
	pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
		let dir = dir.as_ref();
		tokio::fs::create_dir_all(dir).await?;
		let path = dir.join(STORE_FILE);
		let options = SqliteConnectOptions::new()
			.filename(&path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Full);
		let pool = SqlitePoolOptions::new()
			.max_connections(4)
			.connect_with(options)
			.await?;
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY NOT NULL, value BLOB NOT NULL)",
		)
		.execute(&pool)
		.await?;
		debug!("sqlite store opened at {}", path.display());
		Ok(Self { pool })
	}

	pub async fn close(&self) {
		self.pool.close().await;
	}
}

const UPSERT: &str =
	"INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value";

#[async_trait]
impl KvStore for SqliteStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?1")
			.bind(key)
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.map(|(value,)| value))
	}

	async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
		sqlx::query(UPSERT)
			.bind(key)
			.bind(value)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM kv WHERE key = ?1")
			.bind(key)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
		let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
			"SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
		)
		.bind(prefix)
		.fetch_all(&self.pool)
		.await?;
		Ok(rows)
	}

	async fn write_batch(
		&self,
		puts: Vec<(String, Vec<u8>)>,
		deletes: Vec<String>,
	) -> Result<(), StoreError> {
		let mut tx = self.pool.begin().await?;
		for (key, value) in puts {
			sqlx::query(UPSERT).bind(key).bind(value).execute(&mut *tx).await?;
		}
		for key in deletes {
			sqlx::query("DELETE FROM kv WHERE key = ?1")
				.bind(key)
				.execute(&mut *tx)
				.await?;
		}
		tx.commit().await?;
		Ok(())
	}
}
