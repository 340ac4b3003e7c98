//! The cryptographic storage engine: authenticated encryption, erasure
//! coding, content hashing, and their composition into per-file
//! encrypt-and-shard / verify-and-decrypt operations.

#![deny(unsafe_code)]

mod cipher;
mod codec;
mod engine;
mod hash;

pub use cipher::{AuthenticatedCipher, CipherError, FernetCipher};
pub use codec::{CodecError, ErasureCodec, ZfecCodec};
pub use engine::{EngineError, ShardedFile, StorageEngine};
pub use hash::sha256_hex;
