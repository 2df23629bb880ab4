//! Stock transfers between locations and their variance-aware reception.
//!
//! Every change to a transfer reaches the central ledger through the
//! mutation queue; the engine never writes stock directly. A reception is
//! validated completely before anything is queued, so abandoning one leaves
//! no trace.

pub mod model;

pub use model::{
	ItemVariance, MovementType, NewTransfer, NewTransferItem, StockMovement, Transfer, TransferItem,
	TransferStatus, VarianceReport,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::clock::SharedClock;
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkMonitor;
use crate::observability::MetricsRegistry;
use crate::queue::{MutationQueue, NewMutation};
use crate::signal::ChangeSignal;
use crate::store::{SharedStore, StoreError, list_json, put_json};
use model::{generate_transfer_id, generate_transfer_number, quantities_differ};

const KEY_PREFIX: &str = "transfers/";

pub const TRANSFERS_ENTITY: &str = "internal_transfers";
pub const TRANSFER_ITEMS_ENTITY: &str = "transfer_items";
pub const STOCK_MOVEMENTS_ENTITY: &str = "stock_movements";

/// Variance summaries kept for the snapshot, newest last.
const MAX_VARIANCE_REPORTS: usize = 50;

fn transfer_key(id: &str) -> String {
	format!("{}{}", KEY_PREFIX, id)
}

pub struct ReconciliationEngine {
	store: SharedStore,
	queue: Arc<MutationQueue>,
	network: Arc<NetworkMonitor>,
	clock: SharedClock,
	metrics: Arc<MetricsRegistry>,
	signal: ChangeSignal,
	transfers: RwLock<BTreeMap<String, Transfer>>,
	variances: RwLock<Vec<VarianceReport>>,
	/// Held from load to save by every status change.
	commit: Mutex<()>,
}

impl ReconciliationEngine {
	pub async fn open(
		store: SharedStore,
		queue: Arc<MutationQueue>,
		network: Arc<NetworkMonitor>,
		clock: SharedClock,
		metrics: Arc<MetricsRegistry>,
		signal: ChangeSignal,
	) -> Result<Self, StoreError> {
		let transfers: BTreeMap<String, Transfer> = list_json::<Transfer>(store.as_ref(), KEY_PREFIX)
			.await?
			.into_iter()
			.map(|(_, t)| (t.id.clone(), t))
			.collect();

		let mut variances: Vec<VarianceReport> = transfers
			.values()
			.filter(|t| t.status == TransferStatus::Received)
			.filter_map(Transfer::variance_report)
			.collect();
		variances.sort_by_key(|v| v.received_at);
		let excess = variances.len().saturating_sub(MAX_VARIANCE_REPORTS);
		variances.drain(..excess);

		debug!("loaded {} transfers", transfers.len());
		Ok(Self {
			store,
			queue,
			network,
			clock,
			metrics,
			signal,
			transfers: RwLock::new(transfers),
			variances: RwLock::new(variances),
			commit: Mutex::new(()),
		})
	}

	pub async fn get(&self, id: &str) -> Option<Transfer> {
		self.transfers.read().await.get(id).cloned()
	}

	pub async fn list(&self) -> Vec<Transfer> {
		self.transfers.read().await.values().cloned().collect()
	}

	pub async fn variance_summaries(&self) -> Vec<VarianceReport> {
		self.variances.read().await.clone()
	}

	/// Open a transfer as draft, or as pending when `send_directly` is set.
	pub async fn create(&self, req: NewTransfer) -> SyncResult<Transfer> {
		validate_new(&req)?;
		let now = self.clock.now();
		let id = generate_transfer_id();
		let items: Vec<TransferItem> = req
			.items
			.iter()
			.enumerate()
			.map(|(n, i)| TransferItem {
				item_id: format!("{}-{}", id, n + 1),
				product_id: i.product_id.clone(),
				quantity_requested: i.quantity,
				quantity_received: 0.0,
				unit: i.unit.clone(),
			})
			.collect();
		let transfer = Transfer {
			transfer_number: generate_transfer_number(now),
			from_location: req.from_location,
			to_location: req.to_location,
			status: if req.send_directly {
				TransferStatus::Pending
			} else {
				TransferStatus::Draft
			},
			transfer_date: req.transfer_date.unwrap_or_else(|| now.date_naive()),
			responsible_person: req.responsible_person,
			notes: req.notes.filter(|n| !n.trim().is_empty()),
			approved_at: None,
			created_at: now,
			updated_at: now,
			items,
			id,
		};

		let mut batch = vec![NewMutation::create(
			TRANSFERS_ENTITY,
			&transfer.id,
			json!({
				"id": transfer.id,
				"transfer_number": transfer.transfer_number,
				"from_location_id": transfer.from_location,
				"to_location_id": transfer.to_location,
				"responsible_person": transfer.responsible_person,
				"transfer_date": transfer.transfer_date,
				"status": transfer.status,
				"notes": transfer.notes,
			}),
		)];
		for item in &transfer.items {
			batch.push(NewMutation::create(
				TRANSFER_ITEMS_ENTITY,
				&item.item_id,
				json!({
					"id": item.item_id,
					"transfer_id": transfer.id,
					"product_id": item.product_id,
					"quantity_requested": item.quantity_requested,
					"quantity_received": 0,
					"unit": item.unit,
				}),
			));
		}
		let ids = self.queue.enqueue_batch(batch).await?;
		self.metrics.mutations_enqueued_total.inc_by(ids.len() as u64);
		self.save(&transfer).await?;
		info!(
			"transfer {} created ({} -> {}, {} items, {})",
			transfer.transfer_number,
			transfer.from_location,
			transfer.to_location,
			transfer.items.len(),
			transfer.status.as_str()
		);
		Ok(transfer)
	}

	/// draft -> pending
	pub async fn submit(&self, id: &str) -> SyncResult<Transfer> {
		self.transition(id, TransferStatus::Pending).await
	}

	/// pending -> in_transit
	pub async fn dispatch(&self, id: &str) -> SyncResult<Transfer> {
		self.transition(id, TransferStatus::InTransit).await
	}

	pub async fn cancel(&self, id: &str) -> SyncResult<Transfer> {
		self.transition(id, TransferStatus::Cancelled).await
	}

	async fn transition(&self, id: &str, next: TransferStatus) -> SyncResult<Transfer> {
		let _commit = self.commit.lock().await;
		let current = self.load(id).await?;
		if current.status == TransferStatus::Received {
			return Err(SyncError::AlreadyReceived(current.transfer_number));
		}
		if !current.status.can_transition_to(next) {
			return Err(SyncError::InvalidState(format!(
				"transfer {} cannot move from {} to {}",
				current.transfer_number,
				current.status.as_str(),
				next.as_str()
			)));
		}

		let now = self.clock.now();
		let mut updated = current;
		updated.status = next;
		updated.updated_at = now;
		self.queue
			.enqueue(NewMutation::update(
				TRANSFERS_ENTITY,
				&updated.id,
				json!({ "status": next, "updated_at": now }),
			))
			.await?;
		self.metrics.mutations_enqueued_total.inc();
		self.save(&updated).await?;
		info!("transfer {} is now {}", updated.transfer_number, next.as_str());
		Ok(updated)
	}

	/// Reconcile what actually arrived against what was requested and close
	/// the transfer. `received` maps product id to the counted quantity and
	/// must cover every item. Any variance requires explanatory notes.
	pub async fn receive(
		&self,
		id: &str,
		received: &HashMap<String, f64>,
		notes: Option<&str>,
	) -> SyncResult<VarianceReport> {
		let _commit = self.commit.lock().await;
		let transfer = self.load(id).await?;
		match transfer.status {
			TransferStatus::Pending | TransferStatus::InTransit => {}
			TransferStatus::Received => return Err(SyncError::AlreadyReceived(transfer.transfer_number)),
			other => {
				return Err(SyncError::InvalidState(format!(
					"cannot receive transfer {} with status {}",
					transfer.transfer_number,
					other.as_str()
				)));
			}
		}

		if !self.network.is_online() {
			return Err(SyncError::ConnectivityRequired);
		}

		for (product, qty) in received {
			if !qty.is_finite() || *qty < 0.0 {
				return Err(SyncError::Validation(format!(
					"received quantity for {} must be a non-negative number",
					product
				)));
			}
			if transfer.item_for(product).is_none() {
				return Err(SyncError::Validation(format!(
					"product {} is not part of transfer {}",
					product, transfer.transfer_number
				)));
			}
		}
		if let Some(missing) = transfer.items.iter().find(|i| !received.contains_key(&i.product_id)) {
			return Err(SyncError::Validation(format!(
				"no received quantity for product {}",
				missing.product_id
			)));
		}

		let notes = notes.map(str::trim).filter(|n| !n.is_empty());
		let has_variance = transfer
			.items
			.iter()
			.any(|i| quantities_differ(received[&i.product_id], i.quantity_requested));
		if has_variance && notes.is_none() {
			return Err(SyncError::Validation(
				"received quantities differ from requested; notes are required".into(),
			));
		}

		let now = self.clock.now();
		let mut updated = transfer.clone();
		for item in &mut updated.items {
			item.quantity_received = received[&item.product_id];
		}
		updated.status = TransferStatus::Received;
		updated.approved_at = Some(now);
		updated.updated_at = now;
		if let Some(n) = notes {
			updated.notes = Some(transfer.notes_with_reception(n));
		}

		let mut batch = Vec::with_capacity(updated.items.len() * 3 + 1);
		for item in &updated.items {
			batch.push(NewMutation::update(
				TRANSFER_ITEMS_ENTITY,
				&item.item_id,
				json!({ "quantity_received": item.quantity_received }),
			));
		}
		for movement in updated.stock_movements() {
			let payload = serde_json::to_value(&movement)
				.map_err(|e| SyncError::Validation(format!("unencodable stock movement: {}", e)))?;
			batch.push(NewMutation::create(STOCK_MOVEMENTS_ENTITY, &movement.id, payload));
		}
		batch.push(NewMutation::update(
			TRANSFERS_ENTITY,
			&updated.id,
			json!({
				"status": TransferStatus::Received,
				"approved_at": now,
				"notes": updated.notes,
				"updated_at": now,
			}),
		));

		// The whole commit is queued before the aggregate is frozen.
		let ids = self.queue.enqueue_batch(batch).await?;
		self.metrics.mutations_enqueued_total.inc_by(ids.len() as u64);
		self.save(&updated).await?;

		let report = updated
			.variance_report()
			.ok_or_else(|| SyncError::InvalidState("received transfer without approval time".into()))?;
		{
			let mut variances = self.variances.write().await;
			variances.push(report.clone());
			let excess = variances.len().saturating_sub(MAX_VARIANCE_REPORTS);
			variances.drain(..excess);
		}
		self.metrics.transfers_received_total.inc();
		self.signal.notify();
		info!(
			"transfer {} received{}",
			updated.transfer_number,
			if report.has_variance { " with variance" } else { "" }
		);
		Ok(report)
	}

	async fn load(&self, id: &str) -> SyncResult<Transfer> {
		self.get(id)
			.await
			.ok_or_else(|| SyncError::NotFound(format!("transfer {}", id)))
	}

	async fn save(&self, transfer: &Transfer) -> SyncResult<()> {
		put_json(self.store.as_ref(), &transfer_key(&transfer.id), transfer).await?;
		self.transfers
			.write()
			.await
			.insert(transfer.id.clone(), transfer.clone());
		self.signal.notify();
		Ok(())
	}
}

fn validate_new(req: &NewTransfer) -> SyncResult<()> {
	if req.from_location.trim().is_empty() || req.to_location.trim().is_empty() {
		return Err(SyncError::Validation("source and destination are required".into()));
	}
	if req.from_location == req.to_location {
		return Err(SyncError::Validation("source and destination must differ".into()));
	}
	if req.items.is_empty() {
		return Err(SyncError::Validation("a transfer needs at least one item".into()));
	}
	let mut seen = HashSet::new();
	for item in &req.items {
		if !item.quantity.is_finite() || item.quantity <= 0.0 {
			return Err(SyncError::Validation(format!(
				"requested quantity for {} must be positive",
				item.product_id
			)));
		}
		if !seen.insert(item.product_id.as_str()) {
			return Err(SyncError::Validation(format!(
				"product {} listed twice",
				item.product_id
			)));
		}
	}
	Ok(())
}
