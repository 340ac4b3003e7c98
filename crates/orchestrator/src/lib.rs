//! The distributed orchestrator: atomic upload of erasure-coded shards
//! across a pool of nodes with all-or-nothing rollback, node health
//! polling, per-filename mutual exclusion, and tolerant reconstruction on
//! download with an end-to-end file-integrity gate.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blob_client::{BlobStoreClient, HttpBlobStoreClient};
use dashmap::DashMap;
use futures_util::future::join_all;
use metadata_vault::{Manifest, MetadataVault, ShardRecord, VaultError};
use storage_core::{shard_identifier, Key, K_REQUIRED, M_TOTAL};
use storage_engine::{sha256_hex, EngineError, StorageEngine};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Errors raised by an [`Orchestrator`] operation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Reading the local file to upload, or writing the reconstructed file, failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The storage engine failed to encrypt/shard or verify/decrypt.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The metadata vault failed to save or load a manifest.
    #[error(transparent)]
    Vault(#[from] VaultError),
    /// Fewer healthy nodes are available than shards to distribute.
    #[error("insufficient healthy nodes: {healthy} online, {required} required")]
    InsufficientHealthyNodes {
        /// Number of nodes that answered `heartbeat` successfully.
        healthy: usize,
        /// Number of shards that need a node (`m_total`).
        required: usize,
    },
    /// Fewer shards were retrieved on download than `k_required`.
    #[error("insufficient shards retrieved: {have} available, {need} required")]
    InsufficientShards {
        /// Number of shards successfully retrieved.
        have: usize,
        /// Minimum number of shards required to reconstruct.
        need: usize,
    },
    /// One or more shard uploads failed; the upload was rolled back.
    #[error("upload transaction aborted: {cause}")]
    TransactionAborted {
        /// Human-readable description of the triggering failure.
        cause: String,
    },
    /// The reconstructed plaintext's hash did not match the manifest's recorded hash.
    #[error("file integrity check failed: expected {expected}, got {actual}")]
    FileIntegrityMismatch {
        /// Hash recorded in the manifest at upload time.
        expected: String,
        /// Hash actually computed from the reconstructed plaintext.
        actual: String,
    },
}

/// Guards an in-flight shard assignment: unless [`RollbackGuard::disarm`] is
/// called, dropping the guard spawns a detached cleanup task that deletes
/// every assigned shard.
///
/// This covers the case SPEC_FULL.md requires but a plain `if failed { delete
/// }` does not: the caller dropping the `upload_file` future mid-flight (task
/// abort, a `select!` losing the race, an enclosing timeout). The per-shard
/// `put`s themselves run as detached [`tokio::spawn`] tasks, so cancelling
/// the *awaiting* future never cancels a request already in flight on the
/// wire; the guard's `Drop` then picks up wherever the cancellation landed
/// and issues rollback deletes for the full assignment set, exactly as the
/// explicit failure path below does.
struct RollbackGuard {
    targets: Vec<(String, Arc<dyn BlobStoreClient>)>,
    armed: bool,
}

impl RollbackGuard {
    fn new(targets: Vec<(String, Arc<dyn BlobStoreClient>)>) -> Self {
        Self {
            targets,
            armed: false,
        }
    }

    /// Call once the transaction's outcome (commit or explicit rollback) is
    /// fully handled, so the guard's `Drop` does not issue a redundant delete.
    fn disarm(&mut self) {
        self.armed = true;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if self.armed || self.targets.is_empty() {
            return;
        }
        let targets = std::mem::take(&mut self.targets);
        warn!(
            shard_count = targets.len(),
            "upload dropped mid-flight, spawning detached rollback"
        );
        tokio::spawn(async move {
            for (shard_id, client) in &targets {
                if !client.delete(shard_id).await {
                    warn!(shard = %shard_id, "cancellation rollback delete failed, shard orphaned");
                }
            }
        });
    }
}

/// Construct the default node set: one [`HttpBlobStoreClient`] per URL.
fn default_nodes(node_urls: &[String]) -> Vec<(String, Arc<dyn BlobStoreClient>)> {
    node_urls
        .iter()
        .map(|url| {
            let client: Arc<dyn BlobStoreClient> = Arc::new(HttpBlobStoreClient::new(url.clone()));
            (url.clone(), client)
        })
        .collect()
}

/// Coordinates distributed storage across a pool of blob-store nodes:
/// encrypt-and-shard, atomic distribution with rollback, envelope-encrypted
/// manifest persistence, and tolerant reconstruction on download.
pub struct Orchestrator {
    nodes: Vec<(String, Arc<dyn BlobStoreClient>)>,
    vault: MetadataVault,
    metadata_dir: PathBuf,
    download_dir: PathBuf,
    upload_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    /// Construct an orchestrator over `node_urls`, using [`HttpBlobStoreClient`]
    /// for each and loading the master key from the environment (see
    /// [`MetadataVault::from_env`]).
    pub fn new(node_urls: Vec<String>, metadata_dir: PathBuf, download_dir: PathBuf) -> Self {
        Self::with_nodes(default_nodes(&node_urls), MetadataVault::from_env(), metadata_dir, download_dir)
    }

    /// Construct an orchestrator from an explicit node list and vault,
    /// primarily for tests that substitute an in-process fake blob store.
    pub fn with_nodes(
        nodes: Vec<(String, Arc<dyn BlobStoreClient>)>,
        vault: MetadataVault,
        metadata_dir: PathBuf,
        download_dir: PathBuf,
    ) -> Self {
        info!(node_count = nodes.len(), "orchestrator initialized");
        for (i, (url, _)) in nodes.iter().enumerate() {
            info!(index = i, node_url = %url, "configured node");
        }
        Self {
            nodes,
            vault,
            metadata_dir,
            download_dir,
            upload_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, filename: &str) -> Arc<Mutex<()>> {
        self.upload_locks
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn client_for(&self, node_url: &str) -> Arc<dyn BlobStoreClient> {
        self.nodes
            .iter()
            .find(|(url, _)| url == node_url)
            .map(|(_, client)| client.clone())
            .unwrap_or_else(|| Arc::new(HttpBlobStoreClient::new(node_url.to_string())))
    }

    /// Query a single node's liveness, independent of any upload/download flow.
    #[instrument(skip(self))]
    pub async fn check_node_health(&self, node_url: &str) -> bool {
        self.client_for(node_url).heartbeat().await
    }

    /// Upload a local file: encrypt, erasure-code, distribute shards across
    /// healthy nodes, and persist the encrypted manifest. All shards land or
    /// none remain — a failed upload rolls itself back before returning.
    ///
    /// Serialized per filename: two concurrent uploads of the same name run
    /// one after the other under this orchestrator instance.
    pub async fn upload_file(&self, path: &Path) -> Result<PathBuf, OrchestratorError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());

        let lock = self.lock_for(&filename);
        let _guard = lock.lock().await;
        self.upload_file_locked(path, &filename).await
    }

    #[instrument(skip(self, path), fields(filename = %filename))]
    async fn upload_file_locked(&self, path: &Path, filename: &str) -> Result<PathBuf, OrchestratorError> {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename)
            .to_string();

        let plaintext = tokio::fs::read(path).await?;
        let file_hash = sha256_hex(&plaintext);
        info!(file_size = plaintext.len(), %file_hash, "read file for upload");

        let engine = StorageEngine::generate();
        let sharded = engine.encrypt_and_shard(&plaintext)?;
        let data_key = engine.data_key().clone();

        info!("polling node health");
        let heartbeats = join_all(self.nodes.iter().map(|(url, client)| {
            let client = client.clone();
            async move { (url.clone(), client.heartbeat().await) }
        }))
        .await;

        let healthy: Vec<String> = heartbeats
            .into_iter()
            .filter_map(|(url, ok)| ok.then_some(url))
            .collect();
        info!(healthy = healthy.len(), total = self.nodes.len(), "health poll complete");

        if healthy.len() < M_TOTAL {
            return Err(OrchestratorError::InsufficientHealthyNodes {
                healthy: healthy.len(),
                required: M_TOTAL,
            });
        }

        let assignments: Vec<(usize, String, String)> = (0..M_TOTAL)
            .map(|i| (i, healthy[i].clone(), shard_identifier(&stem, i)))
            .collect();

        info!(shard_count = assignments.len(), "distributing shards");

        // The guard is armed with every shard this transaction is about to
        // assign *before* any put is issued. If this function's future is
        // dropped before the transaction resolves one way or the other
        // (caller cancellation, an enclosing timeout), the guard's `Drop`
        // schedules the same rollback the explicit failure path below
        // performs — see `RollbackGuard`'s doc comment.
        let mut rollback = RollbackGuard::new(
            assignments
                .iter()
                .map(|(_, node_url, shard_id)| (shard_id.clone(), self.client_for(node_url)))
                .collect(),
        );

        // Each put runs as a detached task so that cancelling the future
        // awaiting them here never cancels a request already in flight on
        // the wire — only the observation of its result is cancellable.
        let put_handles: Vec<_> = assignments
            .iter()
            .map(|(index, node_url, shard_id)| {
                let client = self.client_for(node_url);
                let bytes = sharded.shards[*index].clone();
                let shard_id = shard_id.clone();
                tokio::spawn(async move { client.put(&shard_id, bytes).await })
            })
            .collect();
        let put_results: Vec<bool> = join_all(put_handles)
            .await
            .into_iter()
            .map(|res| res.unwrap_or(false))
            .collect();

        if put_results.iter().any(|ok| !*ok) {
            let failed = put_results.iter().filter(|ok| !**ok).count();
            warn!(failed, "transaction failed, rolling back");

            let deletes = join_all(assignments.iter().map(|(_, node_url, shard_id)| {
                let client = self.client_for(node_url);
                let shard_id = shard_id.clone();
                async move { (shard_id.clone(), client.delete(&shard_id).await) }
            }))
            .await;
            let deleted = deletes.iter().filter(|(_, ok)| *ok).count();
            for (shard_id, ok) in &deletes {
                if !*ok {
                    warn!(shard = %shard_id, "rollback delete failed, shard orphaned");
                }
            }
            info!(deleted, attempted = assignments.len(), "rollback complete");
            rollback.disarm();

            return Err(OrchestratorError::TransactionAborted {
                cause: format!("{failed} of {} shard uploads failed", assignments.len()),
            });
        }

        info!("all shards uploaded, writing manifest");
        rollback.disarm();

        let shard_metadata: HashMap<usize, ShardRecord> = assignments
            .iter()
            .map(|(index, node_url, shard_id)| {
                (
                    *index,
                    ShardRecord {
                        hash: sharded.shard_hashes[index].clone(),
                        node_url: node_url.clone(),
                        shard_identifier: shard_id.clone(),
                    },
                )
            })
            .collect();

        let manifest = Manifest {
            filename: filename.to_string(),
            file_hash,
            file_size: plaintext.len() as u64,
            encryption_key: data_key,
            k_required: K_REQUIRED,
            m_total: M_TOTAL,
            ciphertext_len: sharded.ciphertext_len,
            shard_metadata,
        };

        let manifest_path = self.metadata_dir.join(format!("{stem}.metadata.json"));
        self.vault.save(&manifest, &manifest_path).await?;
        info!(path = %manifest_path.display(), "manifest written");

        Ok(manifest_path)
    }

    /// Reconstruct a file from its encrypted manifest: decrypt the manifest,
    /// fetch whatever shards are reachable, verify and decode, then check the
    /// reconstructed plaintext against the manifest's recorded file hash
    /// before anything is written to disk.
    #[instrument(skip(self, output_path))]
    pub async fn download_file(
        &self,
        manifest_path: &Path,
        output_path: Option<PathBuf>,
    ) -> Result<PathBuf, OrchestratorError> {
        let manifest = self.vault.load(manifest_path).await?;
        info!(filename = %manifest.filename, "manifest loaded");

        let engine = StorageEngine::new(manifest.encryption_key.clone());

        let mut entries: Vec<(usize, ShardRecord)> = manifest.shard_metadata.clone().into_iter().collect();
        entries.sort_by_key(|(index, _)| *index);

        info!(shard_count = entries.len(), "fetching shards");
        let fetched = join_all(entries.iter().map(|(index, record)| {
            let client = self.client_for(&record.node_url);
            let shard_id = record.shard_identifier.clone();
            let index = *index;
            async move { (index, client.get(&shard_id).await) }
        }))
        .await;

        let mut successful: Vec<(usize, Vec<u8>)> = Vec::new();
        let mut expected_hashes: HashMap<usize, String> = HashMap::new();
        for (index, bytes) in fetched {
            match bytes {
                Some(bytes) => {
                    if let Some(record) = manifest.shard_metadata.get(&index) {
                        expected_hashes.insert(index, record.hash.clone());
                    }
                    successful.push((index, bytes));
                }
                None => warn!(shard_index = index, "shard unavailable, skipping"),
            }
        }
        info!(retrieved = successful.len(), required = manifest.k_required, "fetch complete");

        if successful.len() < manifest.k_required {
            return Err(OrchestratorError::InsufficientShards {
                have: successful.len(),
                need: manifest.k_required,
            });
        }

        let plaintext = engine.verify_and_decrypt(&successful, &expected_hashes, manifest.ciphertext_len)?;

        let actual_hash = sha256_hex(&plaintext);
        if actual_hash != manifest.file_hash {
            return Err(OrchestratorError::FileIntegrityMismatch {
                expected: manifest.file_hash.clone(),
                actual: actual_hash,
            });
        }
        info!(%actual_hash, "file integrity verified");

        let output = output_path.unwrap_or_else(|| self.download_dir.join(&manifest.filename));
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&output, &plaintext).await?;
        info!(path = %output.display(), "file written");

        Ok(output)
    }
}
