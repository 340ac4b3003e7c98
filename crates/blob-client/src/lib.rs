//! Async HTTP client for the per-node blob store contract: `heartbeat`,
//! `put`, `get`, `delete`. Every operation is a thin, bounded-timeout wrapper
//! around a single HTTP call; none of them retry or propagate a transport
//! error as a Rust `Err` — the orchestrator's erasure-coded redundancy is the
//! retry mechanism, not this client.

#![deny(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const PUT_GET_TIMEOUT: Duration = Duration::from_secs(30);
const DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// The per-node blob store contract. One instance addresses one node URL.
///
/// Implementations must never raise on a transport failure: every method
/// collapses failure to the boolean/`Option` its signature promises, logging
/// the underlying cause at `warn` for operability.
#[async_trait]
pub trait BlobStoreClient: Send + Sync {
    /// Returns `true` if the node answered within the heartbeat timeout.
    async fn heartbeat(&self) -> bool;
    /// Store `bytes` under `id`, overwriting any existing blob with that id.
    async fn put(&self, id: &str, bytes: Vec<u8>) -> bool;
    /// Fetch the blob stored under `id`, or `None` on any failure.
    async fn get(&self, id: &str) -> Option<Vec<u8>>;
    /// Delete the blob stored under `id`. Deleting an absent id is reported
    /// as `false` but is not treated as fatal by callers.
    async fn delete(&self, id: &str) -> bool;
}

/// [`BlobStoreClient`] backed by the HTTP contract in the workspace's
/// external-interface specification: `GET /heartbeat`, `POST /upload/{id}`
/// (multipart `file`), `GET /download/{id}`, `DELETE /delete/{id}`.
#[derive(Debug, Clone)]
pub struct HttpBlobStoreClient {
    base_url: String,
    client: Client,
}

impl HttpBlobStoreClient {
    /// Build a client addressing `base_url` (e.g. `http://localhost:8001`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
        }
    }

    /// The node URL this client was constructed with.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BlobStoreClient for HttpBlobStoreClient {
    async fn heartbeat(&self) -> bool {
        let url = format!("{}/heartbeat", self.base_url);
        match self.client.get(&url).timeout(HEARTBEAT_TIMEOUT).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(err) => {
                tracing::warn!(node = %self.base_url, error = %err, "heartbeat failed");
                false
            }
        }
    }

    async fn put(&self, id: &str, bytes: Vec<u8>) -> bool {
        let url = format!("{}/upload/{id}", self.base_url);
        let part = match Part::bytes(bytes).file_name(id.to_string()).mime_str("application/octet-stream") {
            Ok(part) => part,
            Err(err) => {
                tracing::warn!(node = %self.base_url, shard = id, error = %err, "put rejected: bad multipart part");
                return false;
            }
        };
        let form = Form::new().part("file", part);

        match self
            .client
            .post(&url)
            .timeout(PUT_GET_TIMEOUT)
            .multipart(form)
            .send()
            .await
        {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                tracing::warn!(node = %self.base_url, shard = id, status = %resp.status(), "put failed");
                false
            }
            Err(err) => {
                tracing::warn!(node = %self.base_url, shard = id, error = %err, "put failed");
                false
            }
        }
    }

    async fn get(&self, id: &str) -> Option<Vec<u8>> {
        let url = format!("{}/download/{id}", self.base_url);
        match self.client.get(&url).timeout(PUT_GET_TIMEOUT).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => match resp.bytes().await {
                Ok(bytes) => Some(bytes.to_vec()),
                Err(err) => {
                    tracing::warn!(node = %self.base_url, shard = id, error = %err, "get failed reading body");
                    None
                }
            },
            Ok(resp) => {
                tracing::warn!(node = %self.base_url, shard = id, status = %resp.status(), "get failed");
                None
            }
            Err(err) => {
                tracing::warn!(node = %self.base_url, shard = id, error = %err, "get failed");
                None
            }
        }
    }

    async fn delete(&self, id: &str) -> bool {
        let url = format!("{}/delete/{id}", self.base_url);
        match self.client.delete(&url).timeout(DELETE_TIMEOUT).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) => {
                tracing::warn!(node = %self.base_url, shard = id, status = %resp.status(), "delete failed");
                false
            }
            Err(err) => {
                tracing::warn!(node = %self.base_url, shard = id, error = %err, "delete failed");
                false
            }
        }
    }
}
