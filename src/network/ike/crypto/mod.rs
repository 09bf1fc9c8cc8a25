//! Crypto primitives keyed by IANA transform id: fixed-width keyed MACs,
//! PRF/PRF+, CBC/GCM ciphers, and Diffie-Hellman key exchange (spec §4.1).

pub mod algorithms;
pub mod cipher;
pub mod dh;
pub mod integrity;
pub mod prf;
pub mod rng;

pub use algorithms::{DhGroupId, EncryptionAlgorithmId, IntegrityAlgorithmId, PrfId};

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported algorithm for this operation")]
    UnsupportedAlgorithm,
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid nonce/IV length")]
    InvalidNonce,
    #[error("AEAD seal/open failed")]
    AeadFailure,
    #[error("MAC verification failed")]
    MacMismatch,
    #[error("DH computation failed")]
    DhFailure,
}

/// Key material that must never outlive its owning SA record and must never
/// be copied into a log line (spec §9). Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        SecretBytes(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes({} bytes, redacted)", self.0.len())
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        SecretBytes(bytes)
    }
}
