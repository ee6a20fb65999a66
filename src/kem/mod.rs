//! Key wrapping for key access objects
//!
//! Two algorithms are supported: a custodian-held AES-256 key-encryption key
//! (`A256GCMKW`) and ephemeral-static P-256 ECDH with HKDF-SHA256 and
//! AES-256-GCM (`ECDH-ES+A256GCM`). The latter is also used to rewrap a
//! released key to a client session key.

use crate::crypto::EncryptionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod aes_kw;
mod ec;

pub use aes_kw::AesGcmKeyWrap;
pub use ec::{ecdh_x_coordinate, parse_public_key, public_key_bytes, EcdhKem};

/// KEM-related errors
#[derive(Debug, Error)]
pub enum KemError {
    #[error("Key wrapping failed: {0}")]
    WrapError(String),

    #[error("Key unwrapping failed: {0}")]
    UnwrapError(String),

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid private key")]
    InvalidPrivateKey,

    #[error("Key derivation failed")]
    KeyDerivationFailed,

    #[error("No key material for algorithm {0}")]
    MissingKey(WrapAlgorithm),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}

impl KemError {
    pub fn error_code(&self) -> &'static str {
        match self {
            KemError::WrapError(_) => "CTDF_E_KEM_WRAP",
            KemError::UnwrapError(_) => "CTDF_E_KEM_UNWRAP",
            KemError::InvalidPublicKey => "CTDF_E_KEM_PUBLIC_KEY",
            KemError::InvalidPrivateKey => "CTDF_E_KEM_PRIVATE_KEY",
            KemError::KeyDerivationFailed => "CTDF_E_KEM_KDF",
            KemError::MissingKey(_) => "CTDF_E_KEM_MISSING_KEY",
            KemError::Encryption(e) => e.error_code(),
        }
    }
}

/// Algorithm a key access object was wrapped with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WrapAlgorithm {
    #[serde(rename = "A256GCMKW")]
    A256GcmKw,
    #[serde(rename = "ECDH-ES+A256GCM")]
    EcdhEsA256Gcm,
}

impl fmt::Display for WrapAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WrapAlgorithm::A256GcmKw => "A256GCMKW",
            WrapAlgorithm::EcdhEsA256Gcm => "ECDH-ES+A256GCM",
        })
    }
}

/// Trait for key encapsulation mechanisms
pub trait KeyEncapsulation {
    /// Material needed to wrap
    type PublicKey;

    /// Material needed to unwrap
    type PrivateKey;

    /// Wrap a symmetric key
    fn wrap(&self, key: &[u8], public_key: &Self::PublicKey) -> Result<Vec<u8>, KemError>;

    /// Unwrap a symmetric key
    fn unwrap(&self, wrapped: &[u8], private_key: &Self::PrivateKey) -> Result<Vec<u8>, KemError>;
}
