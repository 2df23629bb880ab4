mod common;

use std::collections::HashMap;
use std::sync::Arc;

use backoffice_sync::error::SyncError;
use backoffice_sync::queue::Operation;
use backoffice_sync::store::{MemoryStore, SharedStore};
use backoffice_sync::transfer::{NewTransfer, NewTransferItem, TransferStatus};
use serde_json::json;

use common::{MockRemote, engine, engine_with, test_settings};

fn flour_and_sugar() -> NewTransfer {
	NewTransfer {
		from_location: "central-warehouse".into(),
		to_location: "outlet-kemang".into(),
		responsible_person: "Rina".into(),
		transfer_date: None,
		notes: Some("weekly restock".into()),
		send_directly: true,
		items: vec![
			NewTransferItem {
				product_id: "flour".into(),
				quantity: 500.0,
				unit: "kg".into(),
			},
			NewTransferItem {
				product_id: "sugar".into(),
				quantity: 120.0,
				unit: "kg".into(),
			},
		],
	}
}

fn counted(flour: f64, sugar: f64) -> HashMap<String, f64> {
	HashMap::from([("flour".to_string(), flour), ("sugar".to_string(), sugar)])
}

/// A short delivery needs notes; once given, the transfer closes with the
/// variance recorded per item.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_short_delivery_requires_notes() {
	let t = engine().await;
	t.engine.network().set_online(true);
	let transfer = t.engine.create_transfer(flour_and_sugar()).await.unwrap();
	assert_eq!(transfer.status, TransferStatus::Pending);
	assert!(transfer.transfer_number.starts_with("TR-"));

	let err = t
		.engine
		.receive(&transfer.id, &counted(500.0, 115.0), None)
		.await
		.unwrap_err();
	assert!(matches!(err, SyncError::Validation(_)));
	let unchanged = t.engine.transfers().get(&transfer.id).await.unwrap();
	assert_eq!(unchanged.status, TransferStatus::Pending);
	assert_eq!(t.engine.queue().len().await, 3);

	let report = t
		.engine
		.receive(&transfer.id, &counted(500.0, 115.0), Some("5kg damaged in transit"))
		.await
		.unwrap();
	let variances: Vec<f64> = report.items.iter().map(|i| i.variance).collect();
	assert_eq!(variances, vec![0.0, -5.0]);
	assert_eq!(report.total_variance, -5.0);
	assert!(report.has_variance);

	let received = t.engine.transfers().get(&transfer.id).await.unwrap();
	assert_eq!(received.status, TransferStatus::Received);
	assert!(received.approved_at.is_some());
	assert_eq!(
		received.notes.as_deref(),
		Some("weekly restock\n[Reception]: 5kg damaged in transit")
	);

	let snap = t.engine.refresh_snapshot().await;
	assert_eq!(snap.variances.len(), 1);
	assert_eq!(snap.variances[0].transfer_id, transfer.id);
	assert_eq!(t.engine.metrics().transfers_received_total.get(), 1);
}

/// The reception reaches the remote as item updates, paired stock movements
/// and finally the transfer's own status change.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_reception_syncs_stock_movements() {
	let t = engine().await;
	t.engine.network().set_online(true);
	let transfer = t.engine.create_transfer(flour_and_sugar()).await.unwrap();
	t.engine
		.receive(&transfer.id, &counted(500.0, 115.0), Some("5kg damaged in transit"))
		.await
		.unwrap();

	let report = t.engine.sync_now().await.unwrap();
	assert_eq!(report.synced, 10);

	let applied = t.remote.applied();
	let movements: Vec<_> = applied
		.iter()
		.filter(|a| a.entity_type == "stock_movements")
		.collect();
	assert_eq!(movements.len(), 4);
	let quantities: Vec<_> = movements.iter().map(|m| m.payload["quantity"].clone()).collect();
	assert_eq!(
		quantities,
		vec![json!(-500.0), json!(500.0), json!(-115.0), json!(115.0)]
	);
	assert_eq!(movements[0].payload["location_id"], "central-warehouse");
	assert_eq!(movements[1].payload["location_id"], "outlet-kemang");
	assert_eq!(movements[0].payload["reference_type"], "transfer");

	let last = applied.last().unwrap();
	assert_eq!(last.entity_type, "internal_transfers");
	assert_eq!(last.operation, Operation::Update);
	assert_eq!(last.payload["status"], "received");
}

/// Reception is refused offline and for transfers already closed.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_reception_guards() {
	let t = engine().await;
	let transfer = t.engine.create_transfer(flour_and_sugar()).await.unwrap();

	assert!(matches!(
		t.engine.receive(&transfer.id, &counted(500.0, 120.0), None).await,
		Err(SyncError::ConnectivityRequired)
	));

	t.engine.network().set_online(true);
	assert!(matches!(
		t.engine.receive("missing", &counted(500.0, 120.0), None).await,
		Err(SyncError::NotFound(_))
	));
	t.engine
		.receive(&transfer.id, &counted(500.0, 120.0), None)
		.await
		.unwrap();
	assert!(matches!(
		t.engine.receive(&transfer.id, &counted(500.0, 120.0), None).await,
		Err(SyncError::AlreadyReceived(_))
	));
}

/// Draft transfers walk the lifecycle one step at a time.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_draft_lifecycle() {
	let t = engine().await;
	t.engine.network().set_online(true);
	let mut req = flour_and_sugar();
	req.send_directly = false;
	let transfer = t.engine.create_transfer(req).await.unwrap();
	assert_eq!(transfer.status, TransferStatus::Draft);

	assert!(matches!(
		t.engine.receive(&transfer.id, &counted(500.0, 120.0), None).await,
		Err(SyncError::InvalidState(_))
	));

	let transfers = t.engine.transfers();
	transfers.submit(&transfer.id).await.unwrap();
	let in_transit = transfers.dispatch(&transfer.id).await.unwrap();
	assert_eq!(in_transit.status, TransferStatus::InTransit);

	let report = t
		.engine
		.receive(&transfer.id, &counted(500.0, 120.0), None)
		.await
		.unwrap();
	assert!(!report.has_variance);
	assert_eq!(report.total_variance, 0.0);
}

/// Received transfers and their variance summaries are reloaded on restart.
#[tokio::test]
#[cfg(feature = "unit-tests")]
async fn test_transfers_survive_restart() {
	let store: SharedStore = Arc::new(MemoryStore::new());
	let id = {
		let t = engine_with(test_settings(), store.clone(), MockRemote::new()).await;
		t.engine.network().set_online(true);
		let transfer = t.engine.create_transfer(flour_and_sugar()).await.unwrap();
		t.engine
			.receive(&transfer.id, &counted(498.5, 120.0), Some("bag split"))
			.await
			.unwrap();
		transfer.id
	};

	let t = engine_with(test_settings(), store, MockRemote::new()).await;
	let reloaded = t.engine.transfers().get(&id).await.unwrap();
	assert_eq!(reloaded.status, TransferStatus::Received);
	let snap = t.engine.refresh_snapshot().await;
	assert_eq!(snap.variances.len(), 1);
	assert_eq!(snap.variances[0].items[0].variance, -1.5);
	assert_eq!(snap.pending_count, 10);
}
