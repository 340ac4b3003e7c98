//! Erasure coding: the `zfec` convention (systematic Reed–Solomon).

use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::HashSet;
use thiserror::Error;

/// Errors raised by an [`ErasureCodec`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encode/decode preconditions were violated, or the underlying coder failed.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Split-and-reconstruct over fixed-size byte chunks, parameterized by `(k, m)`.
pub trait ErasureCodec {
    /// Encode `padded_input` (whose length must be divisible by `k`) into `m`
    /// shards, the first `k` of which are systematic (identity) chunks.
    fn encode(&self, padded_input: &[u8], k: usize, m: usize) -> Result<Vec<Vec<u8>>, CodecError>;

    /// Reconstruct the padded input from exactly `k` shards and their indices.
    fn decode(
        &self,
        shards: &[Vec<u8>],
        indices: &[usize],
        k: usize,
        m: usize,
    ) -> Result<Vec<u8>, CodecError>;
}

/// Reed–Solomon over GF(2^8), systematic convention: shards `[0, k)` are the
/// identity chunks of the input, shards `[k, m)` are parity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZfecCodec;

impl ErasureCodec for ZfecCodec {
    fn encode(&self, padded_input: &[u8], k: usize, m: usize) -> Result<Vec<Vec<u8>>, CodecError> {
        if k == 0 || k > m {
            return Err(CodecError::DecodeError(format!("invalid (k={k}, m={m})")));
        }
        if padded_input.len() % k != 0 {
            return Err(CodecError::DecodeError(
                "input length not divisible by k".into(),
            ));
        }
        let chunk_len = padded_input.len() / k;
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(m);
        for i in 0..k {
            shards.push(padded_input[i * chunk_len..(i + 1) * chunk_len].to_vec());
        }
        for _ in k..m {
            shards.push(vec![0u8; chunk_len]);
        }

        let rs = ReedSolomon::new(k, m - k)
            .map_err(|e| CodecError::DecodeError(format!("reed-solomon setup: {e}")))?;
        rs.encode(&mut shards)
            .map_err(|e| CodecError::DecodeError(format!("reed-solomon encode: {e}")))?;
        Ok(shards)
    }

    fn decode(
        &self,
        shards: &[Vec<u8>],
        indices: &[usize],
        k: usize,
        m: usize,
    ) -> Result<Vec<u8>, CodecError> {
        if shards.len() != k || indices.len() != k {
            return Err(CodecError::DecodeError(format!(
                "expected exactly {k} shards, got {}",
                shards.len()
            )));
        }
        let mut seen = HashSet::with_capacity(k);
        for &idx in indices {
            if idx >= m {
                return Err(CodecError::DecodeError(format!(
                    "shard index {idx} out of range [0, {m})"
                )));
            }
            if !seen.insert(idx) {
                return Err(CodecError::DecodeError(format!("duplicate shard index {idx}")));
            }
        }
        let shard_len = shards[0].len();
        if shards.iter().any(|s| s.len() != shard_len) {
            return Err(CodecError::DecodeError("shard lengths disagree".into()));
        }

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; m];
        for (&idx, shard) in indices.iter().zip(shards) {
            slots[idx] = Some(shard.clone());
        }

        let rs = ReedSolomon::new(k, m - k)
            .map_err(|e| CodecError::DecodeError(format!("reed-solomon setup: {e}")))?;
        rs.reconstruct(&mut slots)
            .map_err(|e| CodecError::DecodeError(format!("reed-solomon reconstruct: {e}")))?;

        let mut out = Vec::with_capacity(k * shard_len);
        for slot in slots.into_iter().take(k) {
            out.extend_from_slice(&slot.expect("reconstruct fills every slot"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_systematic_subset() {
        let codec = ZfecCodec;
        let data = b"0123456789ab".to_vec(); // 12 bytes, divisible by k=3
        let shards = codec.encode(&data, 3, 5).unwrap();
        assert_eq!(shards.len(), 5);
        // Systematic shards equal the input chunks directly.
        assert_eq!(shards[0], data[0..4]);
        assert_eq!(shards[1], data[4..8]);
        assert_eq!(shards[2], data[8..12]);

        let chosen = vec![shards[0].clone(), shards[2].clone(), shards[4].clone()];
        let idxs = vec![0, 2, 4];
        let decoded = codec.decode(&chosen, &idxs, 3, 5).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn round_trips_with_parity_only() {
        let codec = ZfecCodec;
        let data = b"abcdefghijkl".to_vec();
        let shards = codec.encode(&data, 3, 5).unwrap();
        let chosen = vec![shards[1].clone(), shards[3].clone(), shards[4].clone()];
        let idxs = vec![1, 3, 4];
        let decoded = codec.decode(&chosen, &idxs, 3, 5).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn rejects_wrong_shard_count() {
        let codec = ZfecCodec;
        let data = b"abcdefghijkl".to_vec();
        let shards = codec.encode(&data, 3, 5).unwrap();
        let chosen = vec![shards[0].clone(), shards[1].clone()];
        assert!(codec.decode(&chosen, &[0, 1], 3, 5).is_err());
    }

    #[test]
    fn rejects_duplicate_indices() {
        let codec = ZfecCodec;
        let data = b"abcdefghijkl".to_vec();
        let shards = codec.encode(&data, 3, 5).unwrap();
        let chosen = vec![shards[0].clone(), shards[0].clone(), shards[1].clone()];
        assert!(codec.decode(&chosen, &[0, 0, 1], 3, 5).is_err());
    }

    #[test]
    fn rejects_out_of_range_index() {
        let codec = ZfecCodec;
        let data = b"abcdefghijkl".to_vec();
        let shards = codec.encode(&data, 3, 5).unwrap();
        let chosen = vec![shards[0].clone(), shards[1].clone(), shards[2].clone()];
        assert!(codec.decode(&chosen, &[0, 1, 9], 3, 5).is_err());
    }

    #[test]
    fn rejects_input_not_divisible_by_k() {
        let codec = ZfecCodec;
        assert!(codec.encode(b"12345", 3, 5).is_err());
    }
}
