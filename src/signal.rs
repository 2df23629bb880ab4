use std::sync::Arc;

use tokio::sync::Notify;

/// Wakes the snapshot publisher when any component's observable state moved.
/// Multiple notifications before the publisher runs collapse into one.
#[derive(Clone, Default)]
pub struct ChangeSignal {
	inner: Arc<Notify>,
}

impl ChangeSignal {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn notify(&self) {
		self.inner.notify_one();
	}

	pub async fn notified(&self) {
		self.inner.notified().await;
	}
}
