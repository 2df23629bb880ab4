use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Quantities closer than this are considered equal.
pub const QUANTITY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
	Draft,
	Pending,
	InTransit,
	Received,
	Cancelled,
}

impl TransferStatus {
	pub fn is_terminal(self) -> bool {
		matches!(self, TransferStatus::Received | TransferStatus::Cancelled)
	}

	/// Forward-only lifecycle; cancellation from any non-terminal state.
	pub fn can_transition_to(self, next: TransferStatus) -> bool {
		use TransferStatus::*;
		matches!(
			(self, next),
			(Draft, Pending)
				| (Pending, InTransit)
				| (Pending, Received)
				| (InTransit, Received)
				| (Draft | Pending | InTransit, Cancelled)
		)
	}

	pub fn as_str(self) -> &'static str {
		match self {
			TransferStatus::Draft => "draft",
			TransferStatus::Pending => "pending",
			TransferStatus::InTransit => "in_transit",
			TransferStatus::Received => "received",
			TransferStatus::Cancelled => "cancelled",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferItem {
	pub item_id: String,
	pub product_id: String,
	pub quantity_requested: f64,
	pub quantity_received: f64,
	pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
	pub id: String,
	pub transfer_number: String,
	pub from_location: String,
	pub to_location: String,
	pub status: TransferStatus,
	pub transfer_date: NaiveDate,
	pub responsible_person: String,
	pub notes: Option<String>,
	pub approved_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub items: Vec<TransferItem>,
}

/// Request to open a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransfer {
	pub from_location: String,
	pub to_location: String,
	pub responsible_person: String,
	#[serde(default)]
	pub transfer_date: Option<NaiveDate>,
	#[serde(default)]
	pub notes: Option<String>,
	/// Skip the draft stage and open the transfer as pending.
	#[serde(default)]
	pub send_directly: bool,
	pub items: Vec<NewTransferItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransferItem {
	pub product_id: String,
	pub quantity: f64,
	pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemVariance {
	pub product_id: String,
	pub requested: f64,
	pub received: f64,
	/// `received - requested`; negative means short.
	pub variance: f64,
}

/// Per-transfer reconciliation summary published in the engine snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceReport {
	pub transfer_id: String,
	pub transfer_number: String,
	pub items: Vec<ItemVariance>,
	pub total_variance: f64,
	pub has_variance: bool,
	pub notes: Option<String>,
	pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
	In,
	Out,
}

/// Downstream stock-ledger row produced by a reception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMovement {
	pub id: String,
	pub product_id: String,
	pub location_id: String,
	pub movement_type: MovementType,
	/// Signed: negative for the OUT leg.
	pub quantity: f64,
	pub unit: String,
	pub reference_type: String,
	pub reference_id: String,
	pub notes: String,
}

pub fn quantities_differ(a: f64, b: f64) -> bool {
	(a - b).abs() > QUANTITY_EPSILON
}

/// `TR-YYYYMMDD-XXXX`, the suffix drawn from uppercase base-36.
pub fn generate_transfer_number(now: DateTime<Utc>) -> String {
	const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
	let mut rng = rand::thread_rng();
	let suffix: String = (0..4)
		.map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
		.collect();
	format!("TR-{}-{}", now.format("%Y%m%d"), suffix)
}

pub fn generate_transfer_id() -> String {
	format!("{:032x}", rand::random::<u128>())
}

impl Transfer {
	pub fn item_for(&self, product_id: &str) -> Option<&TransferItem> {
		self.items.iter().find(|i| i.product_id == product_id)
	}

	/// Existing notes with a reception remark appended.
	pub fn notes_with_reception(&self, reception: &str) -> String {
		format!("{}\n[Reception]: {}", self.notes.as_deref().unwrap_or(""), reception)
			.trim()
			.to_string()
	}

	/// OUT leg from the source and IN leg to the destination for every item
	/// that actually moved.
	pub fn stock_movements(&self) -> Vec<StockMovement> {
		let mut out = Vec::with_capacity(self.items.len() * 2);
		for item in self.items.iter().filter(|i| i.quantity_received > QUANTITY_EPSILON) {
			for (movement_type, location, sign, leg) in [
				(MovementType::Out, &self.from_location, -1.0, "out"),
				(MovementType::In, &self.to_location, 1.0, "in"),
			] {
				out.push(StockMovement {
					id: format!("{}-{}-{}", self.id, item.item_id, leg),
					product_id: item.product_id.clone(),
					location_id: location.clone(),
					movement_type,
					quantity: sign * item.quantity_received.abs(),
					unit: item.unit.clone(),
					reference_type: "transfer".to_string(),
					reference_id: self.id.clone(),
					notes: format!("Transfer {} - {}", self.transfer_number, leg.to_uppercase()),
				});
			}
		}
		out
	}

	pub fn variance_report(&self) -> Option<VarianceReport> {
		let received_at = self.approved_at?;
		let items: Vec<ItemVariance> = self
			.items
			.iter()
			.map(|i| ItemVariance {
				product_id: i.product_id.clone(),
				requested: i.quantity_requested,
				received: i.quantity_received,
				variance: i.quantity_received - i.quantity_requested,
			})
			.collect();
		let total_variance = items.iter().map(|i| i.variance).sum();
		let has_variance = items.iter().any(|i| quantities_differ(i.variance, 0.0));
		Some(VarianceReport {
			transfer_id: self.id.clone(),
			transfer_number: self.transfer_number.clone(),
			items,
			total_variance,
			has_variance,
			notes: self.notes.clone(),
			received_at,
		})
	}
}
