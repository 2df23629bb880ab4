use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::debug;
use serde_json::Value;
use url::Url;

use super::{ApplyAck, RemoteDataClient, RemoteError};
use crate::config::Settings;
use crate::queue::{MutationQueueEntry, Operation};

/// Header carrying the mutation's idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
/// Set by the remote when it recognised an already-applied key.
pub const REPLAYED_HEADER: &str = "Idempotency-Replayed";

/// REST adapter for the central data service. One attempt per call; retries
/// belong to the queue's backoff ladder, not to the transport.
pub struct HttpRemoteClient {
	base_url: Url,
	timeout: Duration,
	client: Client<HttpConnector, Full<Bytes>>,
}

struct RawResponse {
	status: StatusCode,
	replayed: bool,
	body: Bytes,
}

impl HttpRemoteClient {
	pub fn new(base_url: Url, timeout: Duration) -> Self {
		let client = Client::builder(TokioExecutor::new()).build_http();
		Self {
			base_url,
			timeout,
			client,
		}
	}

	pub fn from_settings(settings: &Settings) -> Self {
		Self::new(settings.remote_base_url.clone(), settings.remote_timeout())
	}

	fn url_for(&self, path: &str) -> Result<Url, RemoteError> {
		self.base_url
			.join(path)
			.map_err(|e| RemoteError::Rejected(format!("invalid resource path {}: {}", path, e)))
	}

	/// Collection URL for creates, row filter (`id=eq.<id>`) otherwise. The id
	/// is query-encoded.
	fn entity_url(&self, entry: &MutationQueueEntry) -> Result<Url, RemoteError> {
		let mut url = self.url_for(&entry.entity_type)?;
		if entry.operation != Operation::Create {
			url.query_pairs_mut()
				.append_pair("id", &format!("eq.{}", entry.entity_id));
		}
		Ok(url)
	}

	async fn execute_once(
		&self,
		method: Method,
		uri: Uri,
		idempotency_key: Option<&str>,
		body: Option<Vec<u8>>,
	) -> Result<RawResponse, RemoteError> {
		let mut req = Request::builder()
			.method(method)
			.uri(uri)
			.header("Accept", "application/json");
		if let Some(key) = idempotency_key {
			req = req
				.header(IDEMPOTENCY_HEADER, key)
				.header("Prefer", "return=representation");
		}

		let request = match body {
			Some(b) => req
				.header("Content-Type", "application/json")
				.body(Full::new(Bytes::from(b))),
			None => req.body(Full::new(Bytes::new())),
		}
		.map_err(|e| RemoteError::Rejected(format!("invalid request: {}", e)))?;

		let response = match tokio::time::timeout(self.timeout, self.client.request(request)).await {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => return Err(RemoteError::Transient(e.to_string())),
			Err(_) => return Err(RemoteError::Transient("request timeout".into())),
		};

		let status = response.status();
		let replayed = response
			.headers()
			.get(REPLAYED_HEADER)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.eq_ignore_ascii_case("true"));
		let body = response
			.into_body()
			.collect()
			.await
			.map_err(|e| RemoteError::Transient(e.to_string()))?
			.to_bytes();

		Ok(RawResponse {
			status,
			replayed,
			body,
		})
	}
}

fn to_uri(url: &Url) -> Result<Uri, RemoteError> {
	url.as_str()
		.parse::<Uri>()
		.map_err(|e| RemoteError::Rejected(format!("invalid uri {}: {}", url, e)))
}

/// Map a non-success status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &[u8]) -> RemoteError {
	let detail = format!("{} {}", status, String::from_utf8_lossy(body).trim());
	if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
		RemoteError::Conflict(detail)
	} else if status.is_server_error()
		|| status == StatusCode::TOO_MANY_REQUESTS
		|| status == StatusCode::REQUEST_TIMEOUT
	{
		RemoteError::Transient(detail)
	} else {
		RemoteError::Rejected(detail)
	}
}

/// Pull the created row's id out of a PostgREST-style representation, which
/// is either an object or a one-element array.
fn server_id_from(body: &[u8]) -> Option<String> {
	let value: Value = serde_json::from_slice(body).ok()?;
	let row = match &value {
		Value::Array(rows) => rows.first()?,
		other => other,
	};
	match row.get("id")? {
		Value::String(s) => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

#[async_trait]
impl RemoteDataClient for HttpRemoteClient {
	async fn apply(&self, entry: &MutationQueueEntry) -> Result<ApplyAck, RemoteError> {
		let method = match entry.operation {
			Operation::Create => Method::POST,
			Operation::Update => Method::PATCH,
			Operation::Delete => Method::DELETE,
		};
		let body = match entry.operation {
			Operation::Delete => None,
			_ => Some(
				serde_json::to_vec(&entry.payload)
					.map_err(|e| RemoteError::Rejected(format!("unencodable payload: {}", e)))?,
			),
		};
		let uri = to_uri(&self.entity_url(entry)?)?;
		debug!("{} {} (key {})", method, uri, entry.idempotency_key);

		let resp = self
			.execute_once(method, uri, Some(&entry.idempotency_key), body)
			.await?;
		if !resp.status.is_success() {
			return Err(classify_status(resp.status, &resp.body));
		}
		// A replayed create still names the row it created the first time.
		let server_id = match entry.operation {
			Operation::Create => server_id_from(&resp.body),
			_ => None,
		};
		Ok(ApplyAck {
			server_id,
			duplicate: resp.replayed,
		})
	}

	async fn fetch(&self, resource_key: &str) -> Result<Value, RemoteError> {
		let uri = to_uri(&self.url_for(resource_key)?)?;
		let resp = self.execute_once(Method::GET, uri, None, None).await?;
		if !resp.status.is_success() {
			return Err(classify_status(resp.status, &resp.body));
		}
		serde_json::from_slice(&resp.body)
			.map_err(|e| RemoteError::Rejected(format!("malformed response for {}: {}", resource_key, e)))
	}

	async fn ping(&self) -> Result<(), RemoteError> {
		let uri = to_uri(&self.url_for("")?)?;
		let resp = self.execute_once(Method::HEAD, uri, None, None).await?;
		// Any answer short of a server failure means the service is reachable.
		if resp.status.is_server_error() {
			return Err(classify_status(resp.status, &resp.body));
		}
		Ok(())
	}
}
