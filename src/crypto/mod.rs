//! Encryption at rest and for sync.
//!
//! - [cipher]: AES-256-GCM and Argon2 key derivation.
//! - [hash]: canonical integrity hashes.
//! - [keys]: persisted key descriptors.
//! - [store::EncryptedStore]: sealed key-value access, key lifecycle and rotation.
//! - [migration]: schema version gate.

pub mod cipher;
pub mod hash;
pub mod keys;
pub mod migration;
pub mod store;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length {0}, expected 32 bytes")]
    InvalidKeyLength(usize),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: wrong key or corrupted ciphertext")]
    Decrypt,
    #[error("malformed sealed data: {0}")]
    Malformed(String),
    #[error("no key material for key id {0}")]
    UnknownKey(String),
    #[error("key derivation cost {0:?} is above the accepted limit")]
    KdfTooCostly(cipher::KdfParams),
    #[error("integrity hash mismatch (expected {expected}, got {actual})")]
    IntegrityMismatch { expected: String, actual: String },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Failures of the encrypted store that can't be degraded into empty data.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key material is derived from a passphrase but no passphrase was configured")]
    PassphraseRequired,
    #[error("configured passphrase does not match the stored key")]
    WrongPassphrase,
    #[error("descriptor for active key {0} is missing, stored data can't be decrypted")]
    MissingKey(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
