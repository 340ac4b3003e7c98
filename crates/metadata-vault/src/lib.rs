//! Envelope encryption and durable persistence of the per-file [`Manifest`].
//!
//! A manifest is never written to disk in plaintext: [`MetadataVault::save`]
//! encrypts the canonical JSON serialization under the process-wide master
//! key before any bytes touch the filesystem, and the write itself is made
//! atomic (temp file + fsync + rename + directory fsync) so a crash never
//! leaves a torn manifest visible to a concurrent reader.
//!
//! `save`/`load` are `async` and go through `tokio::fs`, which dispatches
//! every blocking syscall (including the fsyncs) to tokio's blocking thread
//! pool, so a manifest write or read never stalls an executor thread the way
//! a direct `std::fs` call from async code would.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::env;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use storage_core::Key;
use storage_engine::{AuthenticatedCipher, CipherError, FernetCipher};
use thiserror::Error;

/// Environment variable carrying the base64-encoded master key.
pub const MASTER_VAULT_KEY_ENV: &str = "MASTER_VAULT_KEY";

/// One entry of [`Manifest::shard_metadata`]: where a shard lives and the
/// hash it must verify against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardRecord {
    /// SHA-256 hex digest of the shard's ciphertext bytes as produced by the encoder.
    pub hash: String,
    /// Base URL of the node this shard was assigned to.
    pub node_url: String,
    /// Externally visible blob key used by the node's `BlobStore`.
    pub shard_identifier: String,
}

/// The per-file bookkeeping record. The only form ever persisted is its
/// [`MetadataVault`]-encrypted envelope; this struct is the plaintext shape
/// encrypted into and decrypted out of that envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// Original file name (with extension).
    pub filename: String,
    /// SHA-256 hex digest of the original plaintext.
    pub file_hash: String,
    /// Size in bytes of the original plaintext.
    pub file_size: u64,
    /// The per-file data key, base64 serialized.
    pub encryption_key: Key,
    /// Minimum number of shards required to reconstruct the file.
    pub k_required: usize,
    /// Total number of shards produced for the file.
    pub m_total: usize,
    /// Exact ciphertext length before zero-padding to a multiple of `k_required`.
    ///
    /// Recorded so reconstruction can truncate to the original length
    /// instead of trimming trailing zero bytes heuristically.
    pub ciphertext_len: usize,
    /// Per-shard placement and integrity record, keyed by shard index.
    pub shard_metadata: HashMap<usize, ShardRecord>,
}

/// Errors raised while saving or loading an encrypted manifest.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Filesystem I/O failed while reading, writing, or renaming the manifest.
    #[error("manifest I/O error: {0}")]
    Io(#[from] io::Error),
    /// The plaintext manifest could not be serialized to JSON.
    #[error("manifest serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The manifest envelope failed to decrypt: wrong master key or a corrupt file.
    #[error("metadata decrypt error: {0}")]
    MetadataDecryptError(String),
}

impl From<CipherError> for VaultError {
    fn from(err: CipherError) -> Self {
        Self::MetadataDecryptError(err.to_string())
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Envelope encryption of [`Manifest`]s under a single process-wide master key.
pub struct MetadataVault<C = FernetCipher> {
    master_key: Key,
    cipher: C,
}

impl MetadataVault<FernetCipher> {
    /// Construct a vault from an explicit master key (e.g. loaded by the caller).
    pub fn new(master_key: Key) -> Self {
        Self {
            master_key,
            cipher: FernetCipher,
        }
    }

    /// Load the master key from [`MASTER_VAULT_KEY_ENV`], or generate a fresh
    /// one and emit a warning that previously persisted manifests will be
    /// unreadable for the remainder of this process's lifetime.
    pub fn from_env() -> Self {
        match env::var(MASTER_VAULT_KEY_ENV) {
            Ok(encoded) => match Key::from_b64(&encoded) {
                Ok(key) => {
                    tracing::info!("master vault key loaded from environment");
                    Self::new(key)
                }
                Err(err) => {
                    tracing::error!(error = %err, "invalid MASTER_VAULT_KEY, generating ephemeral key");
                    Self::new(Key::generate())
                }
            },
            Err(_) => {
                let key = Key::generate();
                tracing::warn!(
                    "MASTER_VAULT_KEY not set; generated an ephemeral key for this process. \
                     Metadata written this run will not be recoverable after restart."
                );
                Self::new(key)
            }
        }
    }
}

impl<C: AuthenticatedCipher> MetadataVault<C> {
    /// Construct a vault from an explicit master key and cipher implementation.
    pub fn with_cipher(master_key: Key, cipher: C) -> Self {
        Self { master_key, cipher }
    }

    /// Serialize `manifest` to canonical JSON, encrypt it under the master
    /// key, and write the ciphertext atomically to `path`.
    ///
    /// The encrypted bytes are written to a sibling temp file, fsync'd,
    /// renamed into place, and the containing directory is fsync'd after the
    /// rename — a concurrent reader never observes a partially written file,
    /// and the rename survives a crash.
    pub async fn save(&self, manifest: &Manifest, path: &Path) -> Result<(), VaultError> {
        let plaintext = serde_json::to_vec(manifest)?;
        let envelope = self.cipher.encrypt(&self.master_key, &plaintext);

        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await?;

        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_name = format!(
            ".{}.tmp.{}.{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("manifest"),
            std::process::id(),
            n
        );
        let tmp_path = dir.join(tmp_name);

        tokio::fs::write(&tmp_path, &envelope).await?;
        tokio::fs::File::open(&tmp_path).await?.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await?;
        if let Ok(dir_handle) = tokio::fs::File::open(dir).await {
            let _ = dir_handle.sync_all().await;
        }

        Ok(())
    }

    /// Read the ciphertext at `path`, decrypt it under the master key, and
    /// parse the resulting JSON into a [`Manifest`].
    pub async fn load(&self, path: &Path) -> Result<Manifest, VaultError> {
        let envelope = tokio::fs::read(path).await?;
        let plaintext = self.cipher.decrypt(&self.master_key, &envelope)?;
        let manifest = serde_json::from_slice(&plaintext)
            .map_err(|err| VaultError::MetadataDecryptError(err.to_string()))?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        let mut shard_metadata = HashMap::new();
        for i in 0..5 {
            shard_metadata.insert(
                i,
                ShardRecord {
                    hash: format!("hash-{i}"),
                    node_url: format!("http://localhost:800{i}"),
                    shard_identifier: format!("report_shard_{i}"),
                },
            );
        }
        Manifest {
            filename: "report.txt".into(),
            file_hash: "deadbeef".repeat(8),
            file_size: 72,
            encryption_key: Key::generate(),
            k_required: 3,
            m_total: 5,
            ciphertext_len: 96,
            shard_metadata,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.metadata.json");
        let vault = MetadataVault::new(Key::generate());
        let manifest = sample_manifest();

        vault.save(&manifest, &path).await.unwrap();
        let loaded = vault.load(&path).await.unwrap();
        assert_eq!(loaded.filename, manifest.filename);
        assert_eq!(loaded.shard_metadata, manifest.shard_metadata);
    }

    #[tokio::test]
    async fn on_disk_bytes_do_not_contain_the_key_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.metadata.json");
        let vault = MetadataVault::new(Key::generate());
        let manifest = sample_manifest();
        vault.save(&manifest, &path).await.unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        let needle = manifest.encryption_key.to_b64();
        let haystack = String::from_utf8_lossy(&on_disk);
        assert!(!haystack.contains(needle.as_str()));
    }

    #[tokio::test]
    async fn wrong_master_key_fails_to_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.metadata.json");
        let vault = MetadataVault::new(Key::generate());
        vault.save(&sample_manifest(), &path).await.unwrap();

        let other_vault = MetadataVault::new(Key::generate());
        let err = other_vault.load(&path).await.unwrap_err();
        assert!(matches!(err, VaultError::MetadataDecryptError(_)));
    }

    #[tokio::test]
    async fn corrupt_file_fails_to_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.metadata.json");
        std::fs::write(&path, b"not a valid envelope").unwrap();

        let vault = MetadataVault::new(Key::generate());
        let err = vault.load(&path).await.unwrap_err();
        assert!(matches!(err, VaultError::MetadataDecryptError(_)));
    }

    #[tokio::test]
    async fn no_stray_temp_files_survive_a_successful_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.metadata.json");
        let vault = MetadataVault::new(Key::generate());
        vault.save(&sample_manifest(), &path).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
