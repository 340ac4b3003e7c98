//! Composition of the cipher, codec, and hasher into the per-file storage pipeline.

use crate::cipher::{AuthenticatedCipher, CipherError, FernetCipher};
use crate::codec::{CodecError, ErasureCodec, ZfecCodec};
use crate::hash::sha256_hex;
use std::collections::HashMap;
use storage_core::{Key, K_REQUIRED, M_TOTAL};
use thiserror::Error;

/// Errors raised while encrypting/sharding or reconstructing/decrypting a file.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The authenticated cipher rejected the ciphertext.
    #[error("authentication failed: {0}")]
    AuthError(#[from] CipherError),
    /// The erasure codec failed to encode or decode.
    #[error("{0}")]
    DecodeError(#[from] CodecError),
    /// A shard's computed hash did not match its recorded hash, and too few
    /// verified shards remained to proceed.
    #[error("integrity violation on shard {index}")]
    IntegrityViolation {
        /// Index of the shard that failed verification.
        index: usize,
    },
    /// No recorded hash exists for a shard index that was presented for verification.
    #[error("missing expected hash for shard {index}")]
    MissingShardHash {
        /// Index of the shard missing a recorded hash.
        index: usize,
    },
    /// Fewer than `k_required` shards were supplied.
    #[error("insufficient shards: have {have}, need {need}")]
    InsufficientShards {
        /// Number of shards actually supplied.
        have: usize,
        /// Minimum number of shards required.
        need: usize,
    },
}

/// The output of [`StorageEngine::encrypt_and_shard`].
#[derive(Debug, Clone)]
pub struct ShardedFile {
    /// The `m` erasure-coded shards, in index order.
    pub shards: Vec<Vec<u8>>,
    /// SHA-256 hex digest of each shard, keyed by index.
    pub shard_hashes: HashMap<usize, String>,
    /// Length in bytes of the ciphertext before zero-padding to a multiple of `k`.
    ///
    /// Recorded so `verify_and_decrypt` can truncate the decoded buffer to
    /// its exact original length instead of trimming trailing zero bytes
    /// (the hardened padding policy adopted over the reference's heuristic).
    pub ciphertext_len: usize,
}

/// Composes an [`AuthenticatedCipher`], an [`ErasureCodec`], and the hasher
/// into the per-file encrypt-and-shard / verify-and-decrypt pipeline.
///
/// Generic over the cipher and codec implementations so callers needing a
/// non-default construction (e.g. tests exercising codec failure paths) can
/// substitute their own; [`StorageEngine::new`] and [`StorageEngine::generate`]
/// construct the default `FernetCipher` + `ZfecCodec` combination.
pub struct StorageEngine<C = FernetCipher, D = ZfecCodec> {
    data_key: Key,
    cipher: C,
    codec: D,
}

impl StorageEngine<FernetCipher, ZfecCodec> {
    /// Construct an engine using an existing data key (e.g. loaded from a manifest).
    pub fn new(data_key: Key) -> Self {
        Self {
            data_key,
            cipher: FernetCipher,
            codec: ZfecCodec,
        }
    }

    /// Construct an engine with a freshly generated data key, for a new upload.
    pub fn generate() -> Self {
        Self::new(Key::generate())
    }
}

impl<C: AuthenticatedCipher, D: ErasureCodec> StorageEngine<C, D> {
    /// Construct an engine from explicit cipher/codec implementations.
    pub fn with_components(data_key: Key, cipher: C, codec: D) -> Self {
        Self {
            data_key,
            cipher,
            codec,
        }
    }

    /// The per-file data key this engine was constructed with.
    pub fn data_key(&self) -> &Key {
        &self.data_key
    }

    /// Encrypt `plaintext`, pad it to a multiple of `k_required`, and
    /// erasure-code it into `m_total` shards with per-shard integrity hashes.
    pub fn encrypt_and_shard(&self, plaintext: &[u8]) -> Result<ShardedFile, EngineError> {
        let ciphertext = self.cipher.encrypt(&self.data_key, plaintext);
        let ciphertext_len = ciphertext.len();

        let pad = (K_REQUIRED - ciphertext_len % K_REQUIRED) % K_REQUIRED;
        let mut padded = ciphertext;
        padded.extend(std::iter::repeat(0u8).take(pad));

        let shards = self.codec.encode(&padded, K_REQUIRED, M_TOTAL)?;
        let shard_hashes = shards
            .iter()
            .enumerate()
            .map(|(i, shard)| (i, sha256_hex(shard)))
            .collect();

        Ok(ShardedFile {
            shards,
            shard_hashes,
            ciphertext_len,
        })
    }

    /// Verify shard integrity and reconstruct the original plaintext.
    ///
    /// `shards` pairs each available shard with its claimed index.
    /// `expected_hashes` is the manifest's recorded per-index hash map.
    /// `ciphertext_len` is the pre-pad ciphertext length recorded at encode time.
    ///
    /// Integrity verification is unconditional and happens before any decode
    /// work. A shard whose hash disagrees with the recorded hash is excluded
    /// from the candidate set and decoding is retried with the remaining
    /// verified shards if at least `k_required` remain (the resilient
    /// reconstruction-fallback policy; see the crate's governing design notes).
    pub fn verify_and_decrypt(
        &self,
        shards: &[(usize, Vec<u8>)],
        expected_hashes: &HashMap<usize, String>,
        ciphertext_len: usize,
    ) -> Result<Vec<u8>, EngineError> {
        if shards.len() < K_REQUIRED {
            return Err(EngineError::InsufficientShards {
                have: shards.len(),
                need: K_REQUIRED,
            });
        }

        let mut verified: Vec<(usize, Vec<u8>)> = Vec::with_capacity(shards.len());
        let mut first_violation: Option<usize> = None;

        for (index, shard) in shards {
            let expected = expected_hashes
                .get(index)
                .ok_or(EngineError::MissingShardHash { index: *index })?;
            let actual = sha256_hex(shard);
            if &actual != expected {
                tracing::warn!(
                    shard_index = *index,
                    "integrity violation on shard, excluding from reconstruction"
                );
                if first_violation.is_none() {
                    first_violation = Some(*index);
                }
                continue;
            }
            verified.push((*index, shard.clone()));
        }

        if verified.len() < K_REQUIRED {
            return Err(match first_violation {
                Some(index) => EngineError::IntegrityViolation { index },
                None => EngineError::InsufficientShards {
                    have: verified.len(),
                    need: K_REQUIRED,
                },
            });
        }

        let chosen = &verified[..K_REQUIRED];
        let indices: Vec<usize> = chosen.iter().map(|(i, _)| *i).collect();
        let bufs: Vec<Vec<u8>> = chosen.iter().map(|(_, s)| s.clone()).collect();

        let padded = self.codec.decode(&bufs, &indices, K_REQUIRED, M_TOTAL)?;
        let take = ciphertext_len.min(padded.len());
        let ciphertext = &padded[..take];

        let plaintext = self.cipher.decrypt(&self.data_key, ciphertext)?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn sample() -> Vec<u8> {
        b"CONFIDENTIAL: User financial records and PII data that must be protected".to_vec()
    }

    #[test]
    fn encrypt_and_shard_produces_five_equal_shards() {
        let engine = StorageEngine::generate();
        let sharded = engine.encrypt_and_shard(&sample()).unwrap();
        assert_eq!(sharded.shards.len(), M_TOTAL);
        assert_eq!(sharded.shard_hashes.len(), M_TOTAL);
        let len0 = sharded.shards[0].len();
        assert!(sharded.shards.iter().all(|s| s.len() == len0));
    }

    #[test]
    fn round_trip_any_k_of_m_subset() {
        let engine = StorageEngine::generate();
        let plaintext = sample();
        let sharded = engine.encrypt_and_shard(&plaintext).unwrap();

        for combo in (0..M_TOTAL).combinations(K_REQUIRED) {
            let shards: Vec<(usize, Vec<u8>)> = combo
                .iter()
                .map(|&i| (i, sharded.shards[i].clone()))
                .collect();
            let recovered = engine
                .verify_and_decrypt(&shards, &sharded.shard_hashes, sharded.ciphertext_len)
                .unwrap();
            assert_eq!(recovered, plaintext);
        }
    }

    #[test]
    fn tamper_detected_before_decode() {
        let engine = StorageEngine::generate();
        let plaintext = sample();
        let sharded = engine.encrypt_and_shard(&plaintext).unwrap();

        let mut tampered = sharded.shards[2].clone();
        tampered[0..13].copy_from_slice(b"TAMPERED_DATA");

        let shards = vec![
            (0, sharded.shards[0].clone()),
            (2, tampered),
            (4, sharded.shards[4].clone()),
        ];
        let err = engine
            .verify_and_decrypt(&shards, &sharded.shard_hashes, sharded.ciphertext_len)
            .unwrap_err();
        assert!(matches!(err, EngineError::IntegrityViolation { index: 2 }));
    }

    #[test]
    fn insufficient_shards_rejected() {
        let engine = StorageEngine::generate();
        let plaintext = sample();
        let sharded = engine.encrypt_and_shard(&plaintext).unwrap();

        let shards = vec![(0, sharded.shards[0].clone()), (1, sharded.shards[1].clone())];
        let err = engine
            .verify_and_decrypt(&shards, &sharded.shard_hashes, sharded.ciphertext_len)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientShards { have: 2, need: 3 }
        ));
    }

    #[test]
    fn reconstruction_fallback_survives_one_bad_shard_with_enough_redundancy() {
        let engine = StorageEngine::generate();
        let plaintext = sample();
        let sharded = engine.encrypt_and_shard(&plaintext).unwrap();

        let mut tampered = sharded.shards[1].clone();
        tampered[0] ^= 0xFF;

        // All five presented; one is bad, four verified remain >= k=3.
        let shards = vec![
            (0, sharded.shards[0].clone()),
            (1, tampered),
            (2, sharded.shards[2].clone()),
            (3, sharded.shards[3].clone()),
            (4, sharded.shards[4].clone()),
        ];
        let recovered = engine
            .verify_and_decrypt(&shards, &sharded.shard_hashes, sharded.ciphertext_len)
            .unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn swapped_shard_hashes_fail_final_hash_gate_not_shard_check() {
        // Swapping two shards' recorded hashes with each other means each
        // shard's *own* SHA-256 check against the swapped entry also fails,
        // demonstrating shard-level verification alone catches this; the
        // orchestrator's file-hash gate is the second, independent layer
        // exercised in the orchestrator integration tests.
        let engine = StorageEngine::generate();
        let plaintext = sample();
        let sharded = engine.encrypt_and_shard(&plaintext).unwrap();

        let mut swapped_hashes = sharded.shard_hashes.clone();
        let h0 = swapped_hashes[&0].clone();
        let h1 = swapped_hashes[&1].clone();
        swapped_hashes.insert(0, h1);
        swapped_hashes.insert(1, h0);

        let shards = vec![
            (0, sharded.shards[0].clone()),
            (1, sharded.shards[1].clone()),
            (2, sharded.shards[2].clone()),
        ];
        let err = engine
            .verify_and_decrypt(&shards, &swapped_hashes, sharded.ciphertext_len)
            .unwrap_err();
        assert!(matches!(err, EngineError::IntegrityViolation { .. }));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // A small, representative sample of (plaintext, k-of-m subset) pairs
        // round-trip, rather than the exhaustive k-choose-m sweep in `tests`.
        #[test]
        fn round_trip_holds_for_arbitrary_plaintext_and_subset(
            plaintext in prop::collection::vec(any::<u8>(), 0..512),
            subset_seed in 0usize..10,
        ) {
            let engine = StorageEngine::generate();
            let sharded = engine.encrypt_and_shard(&plaintext).unwrap();

            let chosen_indices: Vec<usize> = (0..M_TOTAL)
                .cycle()
                .skip(subset_seed)
                .take(K_REQUIRED)
                .collect();

            let shards: Vec<(usize, Vec<u8>)> = chosen_indices
                .iter()
                .map(|&i| (i, sharded.shards[i].clone()))
                .collect();
            let recovered = engine
                .verify_and_decrypt(&shards, &sharded.shard_hashes, sharded.ciphertext_len)
                .unwrap();
            prop_assert_eq!(recovered, plaintext);
        }
    }
}
