mod common;

use std::sync::Arc;

use backoffice_sync::error::SyncError;
use backoffice_sync::queue::{EntryStatus, NewMutation, Operation};
use backoffice_sync::remote::RemoteError;
use backoffice_sync::store::{SharedStore, SqliteStore};
use backoffice_sync::sync::SyncStatus;
use serde_json::json;

use common::{MockRemote, engine, engine_with, test_settings, wait_for_snapshot};

/// Mutations made offline stay queued and drain in one cycle, in order, once
/// connectivity returns.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_offline_mutations_drain_on_reconnect() {
	let t = engine().await;
	t.engine.start().await.unwrap();
	let mut snapshots = t.engine.subscribe();

	t.engine
		.enqueue(NewMutation::create("orders", "LOCAL-1", json!({ "total": 12.5 })))
		.await
		.unwrap();
	t.engine
		.enqueue(NewMutation::update("products", "p-1", json!({ "stock": 4 })))
		.await
		.unwrap();
	t.engine
		.enqueue(NewMutation::update("tables", "t-3", json!({ "status": "occupied" })))
		.await
		.unwrap();

	let snap = wait_for_snapshot(&mut snapshots, |s| s.pending_count == 3).await;
	assert!(!snap.online);
	assert!(snap.last_success_at.is_none());
	assert!(t.engine.sync_now().await.is_none());
	assert!(t.remote.applied().is_empty());

	t.engine.network().set_online(true);
	let snap = wait_for_snapshot(&mut snapshots, |s| {
		s.pending_count == 0 && s.last_success_at.is_some()
	})
	.await;

	assert_eq!(snap.sync.status, SyncStatus::Idle);
	assert_eq!(t.remote.applied_ids(), vec!["LOCAL-1", "p-1", "t-3"]);
	assert!(t.engine.queue().is_empty().await);
	assert_eq!(t.engine.metrics().sync_cycles_total.get(), 1);
	assert_eq!(t.engine.metrics().mutations_synced_total.get(), 3);

	t.engine.shutdown().await;
}

/// A failing mutation holds back later mutations of the same entity but not
/// those of other entities.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_same_entity_order_survives_transient_failure() {
	let t = engine().await;
	t.engine.network().set_online(true);
	t.remote.fail_next("p-1", RemoteError::Transient("timeout".into()));

	for (id, v) in [("p-1", 1), ("p-1", 2), ("p-2", 1)] {
		t.engine
			.enqueue(NewMutation::update("products", id, json!({ "v": v })))
			.await
			.unwrap();
	}

	let first = t.engine.sync_now().await.unwrap();
	assert_eq!(first.synced, 1);
	assert_eq!(first.failed, 1);
	assert_eq!(t.remote.applied_ids(), vec!["p-2"]);
	assert_eq!(t.engine.scheduler().state().status, SyncStatus::Error);
	assert!(t.engine.scheduler().state().last_success_at.is_none());

	let second = t.engine.sync_now().await.unwrap();
	assert_eq!(second.synced, 2);
	let p1: Vec<_> = t
		.remote
		.applied()
		.into_iter()
		.filter(|a| a.entity_id == "p-1")
		.map(|a| a.payload["v"].clone())
		.collect();
	assert_eq!(p1, vec![json!(1), json!(2)]);
	assert!(t.engine.scheduler().state().last_success_at.is_some());
}

/// Follow-up mutations on a locally created record reach the remote under the
/// server-assigned id.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_local_ids_are_remapped() {
	let t = engine().await;
	t.engine
		.enqueue(NewMutation::create("orders", "LOCAL-7", json!({ "total": 3 })))
		.await
		.unwrap();
	t.engine
		.enqueue(NewMutation::update("orders", "LOCAL-7", json!({ "status": "paid" })))
		.await
		.unwrap();
	t.engine.network().set_online(true);

	let report = t.engine.sync_now().await.unwrap();
	assert_eq!(report.synced, 2);
	assert_eq!(report.remapped, 1);

	let applied = t.remote.applied();
	assert_eq!(applied[0].operation, Operation::Create);
	assert_eq!(applied[0].entity_id, "LOCAL-7");
	assert_eq!(applied[1].operation, Operation::Update);
	assert_eq!(applied[1].entity_id, "srv-1");
}

/// A create whose response was lost is redelivered under the same key; the
/// replay still names the server row, so follow-ups land on it.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_lost_create_ack_still_remaps() {
	let t = engine().await;
	t.engine.network().set_online(true);
	t.remote.lose_next_ack("LOCAL-5");
	t.engine
		.enqueue(NewMutation::create("orders", "LOCAL-5", json!({ "total": 8 })))
		.await
		.unwrap();
	t.engine
		.enqueue(NewMutation::update("orders", "LOCAL-5", json!({ "status": "paid" })))
		.await
		.unwrap();

	let first = t.engine.sync_now().await.unwrap();
	assert_eq!(first.failed, 1);
	assert_eq!(first.synced, 0);
	assert_eq!(t.remote.applied_ids(), vec!["LOCAL-5"]);

	let second = t.engine.sync_now().await.unwrap();
	assert_eq!(second.duplicates, 1);
	assert_eq!(second.remapped, 1);
	assert_eq!(second.synced, 1);
	assert_eq!(t.remote.applied_ids(), vec!["LOCAL-5", "srv-1"]);
	assert!(t.engine.queue().is_empty().await);
}

/// An entry that keeps failing is dead-lettered exactly once and never
/// attempted again.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_dead_letter_exactly_once() {
	let t = engine().await;
	t.engine.network().set_online(true);
	t.remote
		.fail_always("p-9", RemoteError::Transient("503".into()), 10);
	let id = t
		.engine
		.enqueue(NewMutation::update("products", "p-9", json!({ "price": 1 })))
		.await
		.unwrap();

	// max_retries = 3: two rescheduled failures, the third is fatal.
	for _ in 0..6 {
		t.engine.sync_now().await.unwrap();
	}

	assert_eq!(t.remote.attempts("p-9"), 3);
	let dead = t.engine.dead_letters().await;
	assert_eq!(dead.len(), 1);
	assert_eq!(dead[0].id, id);
	assert_eq!(dead[0].status, EntryStatus::Dead);
	assert_eq!(dead[0].retry_count, 3);
	assert_eq!(t.engine.metrics().mutations_dead_lettered_total.get(), 1);

	let snap = t.engine.refresh_snapshot().await;
	assert_eq!(snap.dead_letter_count, 1);
	assert_eq!(snap.pending_count, 0);
}

/// Conflicts are not retried automatically; the operator can requeue or
/// purge the dead letter.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_conflict_dead_letters_then_requeue() {
	let t = engine().await;
	t.engine.network().set_online(true);
	t.remote
		.fail_next("c-1", RemoteError::Conflict("newer version on server".into()));
	let id = t
		.engine
		.enqueue(NewMutation::update("customers", "c-1", json!({ "phone": "0812" })))
		.await
		.unwrap();

	let report = t.engine.sync_now().await.unwrap();
	assert_eq!(report.dead_lettered, 1);
	assert_eq!(t.remote.attempts("c-1"), 1);

	t.engine.sync_now().await.unwrap();
	assert_eq!(t.remote.attempts("c-1"), 1);

	assert!(matches!(
		t.engine.purge_dead(id + 100).await,
		Err(SyncError::NotFound(_))
	));
	t.engine.requeue_dead(id).await.unwrap();
	assert!(matches!(
		t.engine.requeue_dead(id).await,
		Err(SyncError::InvalidState(_))
	));

	t.engine.sync_now().await.unwrap();
	assert_eq!(t.remote.applied_ids(), vec!["c-1"]);
	assert!(t.engine.dead_letters().await.is_empty());
}

/// The queue bound rejects new writes without touching queued ones.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_queue_full_rejects_new_writes() {
	let mut settings = test_settings();
	settings.max_queue_size = 2;
	let t = engine_with(
		settings,
		Arc::new(backoffice_sync::store::MemoryStore::new()),
		MockRemote::new(),
	)
	.await;

	for n in 0..2 {
		t.engine
			.enqueue(NewMutation::update("products", format!("p-{}", n), json!({})))
			.await
			.unwrap();
	}
	let err = t
		.engine
		.enqueue(NewMutation::update("products", "p-2", json!({})))
		.await
		.unwrap_err();
	assert!(matches!(err, SyncError::QueueFull { max: 2 }));
	assert_eq!(t.engine.queue().len().await, 2);
}

/// Queued writes survive a restart and replay in their original order.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_queue_survives_restart() {
	let dir = tempfile::tempdir().unwrap();
	{
		let store: SharedStore = Arc::new(SqliteStore::open(dir.path()).await.unwrap());
		let t = engine_with(test_settings(), store, MockRemote::new()).await;
		for id in ["a", "b", "c"] {
			t.engine
				.enqueue(NewMutation::update("products", id, json!({ "id": id })))
				.await
				.unwrap();
		}
	}

	let store: SharedStore = Arc::new(SqliteStore::open(dir.path()).await.unwrap());
	let remote = MockRemote::new();
	let t = engine_with(test_settings(), store, remote.clone()).await;
	assert_eq!(t.engine.refresh_snapshot().await.pending_count, 3);

	t.engine.network().set_online(true);
	t.engine.sync_now().await.unwrap();
	assert_eq!(remote.applied_ids(), vec!["a", "b", "c"]);
	assert!(t.engine.queue().is_empty().await);
}
