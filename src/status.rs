use std::sync::Arc;

use anyhow::{Context, bail};
use axum::{
	Json, Router,
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::info;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Settings;
use crate::engine::Engine;
use crate::error::SyncError;
use crate::queue::{EntryId, MutationQueueEntry};

/// Application state passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
	pub engine: Arc<Engine>,
}

impl IntoResponse for SyncError {
	fn into_response(self) -> Response {
		let status = match &self {
			SyncError::NotFound(_) => StatusCode::NOT_FOUND,
			SyncError::DeadLetter { .. } => StatusCode::GONE,
			SyncError::InvalidState(_) | SyncError::Conflict(_) | SyncError::AlreadyReceived(_) => {
				StatusCode::CONFLICT
			}
			SyncError::Validation(_) => StatusCode::BAD_REQUEST,
			SyncError::QueueFull { .. } | SyncError::ConnectivityRequired | SyncError::TransientNetwork(_) => {
				StatusCode::SERVICE_UNAVAILABLE
			}
			SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		(status, Json(json!({ "error": self.to_string() }))).into_response()
	}
}

/// Liveness. Always 200; the body names the connectivity state.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
	let online = state.engine.network().is_online();
	(StatusCode::OK, if online { "OK online" } else { "OK offline" }).into_response()
}

/// Current engine snapshot as JSON.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
	Json(state.engine.snapshot())
}

/// Ping the remote, then answer with the refreshed snapshot.
pub async fn probe(State(state): State<AppState>) -> impl IntoResponse {
	state.engine.probe_network().await;
	Json(state.engine.refresh_snapshot().await)
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
	let metrics_text = state.engine.metrics().encode();
	(StatusCode::OK, metrics_text).into_response()
}

pub async fn dead_letters(State(state): State<AppState>) -> Json<Vec<MutationQueueEntry>> {
	Json(state.engine.dead_letters().await)
}

/// 200 with the entry while queued, 404 once it left the queue, 410 while
/// dead-lettered.
pub async fn mutation(
	State(state): State<AppState>,
	Path(id): Path<EntryId>,
) -> Result<Json<MutationQueueEntry>, SyncError> {
	state
		.engine
		.track(id)
		.await?
		.map(Json)
		.ok_or_else(|| SyncError::NotFound(format!("queue entry {}", id)))
}

pub async fn requeue(State(state): State<AppState>, Path(id): Path<EntryId>) -> Result<StatusCode, SyncError> {
	state.engine.requeue_dead(id).await?;
	Ok(StatusCode::NO_CONTENT)
}

pub async fn purge(
	State(state): State<AppState>,
	Path(id): Path<EntryId>,
) -> Result<Json<MutationQueueEntry>, SyncError> {
	Ok(Json(state.engine.purge_dead(id).await?))
}

pub fn router(engine: Arc<Engine>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/status", get(status))
		.route("/probe", post(probe))
		.route("/metrics", get(metrics_handler))
		.route("/dead-letters", get(dead_letters))
		.route("/mutations/{id}", get(mutation))
		.route("/requeue/{id}", post(requeue))
		.route("/purge/{id}", post(purge))
		.with_state(AppState { engine })
}

/// Serve the status routes on `listener` until `shutdown` flips to `true`.
pub async fn serve(
	engine: Arc<Engine>,
	listener: TcpListener,
	mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
	if let Ok(addr) = listener.local_addr() {
		info!("status surface on http://{}", addr);
	}
	axum::serve(listener, router(engine))
		.with_graceful_shutdown(async move {
			while shutdown.changed().await.is_ok() {
				if *shutdown.borrow() {
					break;
				}
			}
		})
		.await
}

/// Operator commands talk to the running daemon over its status surface so
/// that the daemon stays the only owner of the store.
pub struct StatusClient {
	base: String,
	client: Client<hyper_util::client::legacy::connect::HttpConnector, Empty<Bytes>>,
}

impl StatusClient {
	pub fn new(addr: impl Into<String>) -> Self {
		Self {
			base: format!("http://{}", addr.into()),
			client: Client::builder(TokioExecutor::new()).build_http(),
		}
	}

	/// Address of the local daemon; wildcard binds are reached on loopback.
	pub fn from_settings(settings: &Settings) -> Self {
		let host = match settings.status_host.as_str() {
			"0.0.0.0" | "::" | "[::]" => "127.0.0.1",
			h => h,
		};
		Self::new(format!("{}:{}", host, settings.status_port))
	}

	pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
		self.call(Method::GET, path).await
	}

	pub async fn post<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
		self.call(Method::POST, path).await
	}

	/// POST where the daemon answers without a body.
	pub async fn post_empty(&self, path: &str) -> anyhow::Result<()> {
		self.send(Method::POST, path).await.map(|_| ())
	}

	async fn call<T: DeserializeOwned>(&self, method: Method, path: &str) -> anyhow::Result<T> {
		let body = self.send(method, path).await?;
		serde_json::from_slice(&body).with_context(|| format!("unexpected response from {}", path))
	}

	async fn send(&self, method: Method, path: &str) -> anyhow::Result<Bytes> {
		let uri = format!("{}{}", self.base, path);
		let req = Request::builder()
			.method(method)
			.uri(&uri)
			.body(Empty::new())
			.context("invalid request")?;
		let res = self
			.client
			.request(req)
			.await
			.with_context(|| format!("is the daemon running? could not reach {}", uri))?;
		let status = res.status();
		let body = res.into_body().collect().await?.to_bytes();
		if !status.is_success() {
			let reason = serde_json::from_slice::<serde_json::Value>(&body)
				.ok()
				.and_then(|v| v["error"].as_str().map(str::to_string))
				.unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
			bail!("{} ({})", reason, status);
		}
		Ok(body)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use async_trait::async_trait;
	use http_body_util::{BodyExt, Empty};
	use hyper::body::Bytes;
	use hyper_util::client::legacy::Client;
	use hyper_util::rt::TokioExecutor;
	use serde_json::{Value, json};
	use tokio::sync::mpsc;

	use super::*;
	use crate::clock::ManualClock;
	use crate::engine::{Collaborators, EngineOptions};
	use crate::lan::{LanError, LanMessage, LanTransport};
	use crate::observability::MetricsRegistry;
	use crate::queue::{EntryStatus, FailureKind, NewMutation};
	use crate::remote::{ApplyAck, RemoteDataClient, RemoteError};
	use crate::retry::RetryPolicy;
	use crate::store::MemoryStore;

	struct Unreachable;

	#[async_trait]
	impl RemoteDataClient for Unreachable {
		async fn apply(&self, _entry: &MutationQueueEntry) -> Result<ApplyAck, RemoteError> {
			Err(RemoteError::Transient("offline".into()))
		}

		async fn fetch(&self, _resource_key: &str) -> Result<Value, RemoteError> {
			Err(RemoteError::Transient("offline".into()))
		}

		async fn ping(&self) -> Result<(), RemoteError> {
			Err(RemoteError::Transient("offline".into()))
		}
	}

	struct NoTransport;

	#[async_trait]
	impl LanTransport for NoTransport {
		async fn connect(&self, peer_id: &str, _address: &str) -> Result<(), LanError> {
			Err(LanError::NotConnected(peer_id.to_string()))
		}

		async fn send(&self, peer_id: &str, _msg: &LanMessage) -> Result<(), LanError> {
			Err(LanError::NotConnected(peer_id.to_string()))
		}

		async fn disconnect(&self, _peer_id: &str) {}
	}

	async fn get_body(addr: &str, path: &str) -> (u16, String) {
		let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
		let res = client
			.get(format!("http://{}{}", addr, path).parse().unwrap())
			.await
			.unwrap();
		let status = res.status().as_u16();
		let body = res.into_body().collect().await.unwrap().to_bytes();
		(status, String::from_utf8(body.to_vec()).unwrap())
	}

	async fn offline_engine() -> (Arc<Engine>, mpsc::Sender<LanMessage>) {
		let (tx, rx) = mpsc::channel(8);
		let engine = Engine::build(
			Settings::default(),
			Collaborators {
				store: Arc::new(MemoryStore::new()),
				remote: Arc::new(Unreachable),
				clock: Arc::new(ManualClock::default()),
				transport: Arc::new(NoTransport),
				lan_inbound: rx,
				lan_listener: None,
			},
			EngineOptions {
				initially_online: false,
				probe_network: false,
				reload_config: false,
			},
			Arc::new(MetricsRegistry::new().unwrap()),
		)
		.await
		.unwrap();
		(engine, tx)
	}

	async fn spawn_server(
		engine: Arc<Engine>,
	) -> (String, watch::Sender<bool>, tokio::task::JoinHandle<std::io::Result<()>>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap().to_string();
		let (stop_tx, stop_rx) = watch::channel(false);
		let server = tokio::spawn(serve(engine, listener, stop_rx));
		(addr, stop_tx, server)
	}

	#[tokio::test]
	async fn routes_report_engine_state() {
		let (engine, _tx) = offline_engine().await;
		engine
			.enqueue(NewMutation::create("orders", "LOCAL-1", json!({ "total": 12 })))
			.await
			.unwrap();
		engine.refresh_snapshot().await;
		let (addr, stop_tx, server) = spawn_server(engine).await;

		let (code, body) = get_body(&addr, "/health").await;
		assert_eq!(code, 200);
		assert_eq!(body, "OK offline");

		let (code, body) = get_body(&addr, "/status").await;
		assert_eq!(code, 200);
		let snap: Value = serde_json::from_str(&body).unwrap();
		assert_eq!(snap["pending_count"], 1);
		assert_eq!(snap["online"], false);

		let (_, body) = get_body(&addr, "/metrics").await;
		assert!(body.contains("backoffice_sync_mutations_enqueued_total 1"));

		stop_tx.send(true).unwrap();
		server.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn operator_commands_act_on_the_running_engine() {
		let (engine, _tx) = offline_engine().await;
		let id = engine
			.enqueue(NewMutation::update("customers", "c-1", json!({ "phone": "0812" })))
			.await
			.unwrap();
		engine
			.queue()
			.mark_failed(id, "newer version on server", FailureKind::Conflict, &RetryPolicy::default())
			.await
			.unwrap();
		let (addr, stop_tx, server) = spawn_server(engine.clone()).await;
		let client = StatusClient::new(addr.clone());

		let dead: Vec<MutationQueueEntry> = client.get("/dead-letters").await.unwrap();
		assert_eq!(dead.len(), 1);
		assert_eq!(dead[0].id, id);

		let (code, body) = get_body(&addr, &format!("/mutations/{}", id)).await;
		assert_eq!(code, 410);
		assert!(body.contains("newer version on server"));

		client.post_empty(&format!("/requeue/{}", id)).await.unwrap();
		assert_eq!(engine.queue().get(id).await.unwrap().status, EntryStatus::Pending);
		let err = client.post_empty(&format!("/requeue/{}", id)).await.unwrap_err();
		assert!(err.to_string().contains("409"));

		let (code, _) = get_body(&addr, &format!("/mutations/{}", id)).await;
		assert_eq!(code, 200);

		engine
			.queue()
			.mark_failed(id, "still conflicting", FailureKind::Conflict, &RetryPolicy::default())
			.await
			.unwrap();
		let purged: MutationQueueEntry = client.post(&format!("/purge/{}", id)).await.unwrap();
		assert_eq!(purged.entity_id, "c-1");
		assert!(engine.queue().is_empty().await);
		assert!(engine.dead_letters().await.is_empty());

		let err = client.post_empty(&format!("/purge/{}", id)).await.unwrap_err();
		assert!(err.to_string().contains("404"));
		let (code, _) = get_body(&addr, &format!("/mutations/{}", id)).await;
		assert_eq!(code, 404);

		stop_tx.send(true).unwrap();
		server.await.unwrap().unwrap();
	}
}
