//! Custodian key-encryption material

use crate::config::{load_json, ConfigError};
use crate::crypto::AesKey;
use crate::kem::{AesGcmKeyWrap, EcdhKem, KemError, KeyEncapsulation, WrapAlgorithm};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::pkcs8::DecodePrivateKey;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use serde::Deserialize;
use std::fmt;
use std::path::Path;

/// What a producer needs to wrap a key for one custodian
#[derive(Clone)]
pub enum WrappingKey {
    /// Shared KEK; only for producers co-located with the custodian
    Symmetric(AesKey),
    EcPublic(PublicKey),
}

impl WrappingKey {
    pub fn algorithm(&self) -> WrapAlgorithm {
        match self {
            WrappingKey::Symmetric(_) => WrapAlgorithm::A256GcmKw,
            WrappingKey::EcPublic(_) => WrapAlgorithm::EcdhEsA256Gcm,
        }
    }

    pub fn wrap(&self, key: &AesKey) -> Result<Vec<u8>, KemError> {
        match self {
            WrappingKey::Symmetric(kek) => AesGcmKeyWrap.wrap(key.as_slice(), kek),
            WrappingKey::EcPublic(public) => {
                EcdhKem::for_key_access().wrap(key.as_slice(), public)
            }
        }
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappingKey({})", self.algorithm())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyringFile {
    #[serde(default)]
    kek: Option<String>,
    #[serde(default)]
    ec_private_key_pem: Option<String>,
}

/// Unwrapping keys held by one custodian
#[derive(Clone, Default)]
pub struct CustodianKeyring {
    kek: Option<AesKey>,
    ec: Option<SecretKey>,
}

impl CustodianKeyring {
    pub fn new(kek: Option<AesKey>, ec: Option<SecretKey>) -> Self {
        Self { kek, ec }
    }

    /// Fresh keys for both algorithms
    pub fn generate() -> Self {
        Self {
            kek: Some(AesKey::generate()),
            ec: Some(SecretKey::random(&mut OsRng)),
        }
    }

    /// Load `{"kek": "<base64>", "ecPrivateKeyPem": "..."}`
    ///
    /// The PEM may be PKCS#8 or SEC1. Any unreadable key is a startup error.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file: KeyringFile = load_json(path)?;
        let mut problems = Vec::new();

        let kek = match file.kek.as_deref().map(|b64| BASE64.decode(b64.trim())) {
            None => None,
            Some(Ok(bytes)) => match AesKey::from_slice(&bytes) {
                Ok(key) => Some(key),
                Err(e) => {
                    problems.push(format!("keyring kek: {}", e));
                    None
                }
            },
            Some(Err(e)) => {
                problems.push(format!("keyring kek: {}", e));
                None
            }
        };

        let ec = match file.ec_private_key_pem.as_deref() {
            None => None,
            Some(pem) => match SecretKey::from_pkcs8_pem(pem).or_else(|_| SecretKey::from_sec1_pem(pem)) {
                Ok(key) => Some(key),
                Err(_) => {
                    problems.push("keyring ecPrivateKeyPem: not a P-256 private key".to_string());
                    None
                }
            },
        };

        if kek.is_none() && ec.is_none() && problems.is_empty() {
            problems.push("keyring holds no keys".to_string());
        }
        if !problems.is_empty() {
            return Err(ConfigError::Invalid(problems));
        }
        Ok(Self { kek, ec })
    }

    pub fn supports(&self, algorithm: WrapAlgorithm) -> bool {
        match algorithm {
            WrapAlgorithm::A256GcmKw => self.kek.is_some(),
            WrapAlgorithm::EcdhEsA256Gcm => self.ec.is_some(),
        }
    }

    pub fn ec_public_key(&self) -> Option<PublicKey> {
        self.ec.as_ref().map(SecretKey::public_key)
    }

    /// Material a producer uses to wrap for this custodian
    pub fn wrapping_key(&self, algorithm: WrapAlgorithm) -> Result<WrappingKey, KemError> {
        match algorithm {
            WrapAlgorithm::A256GcmKw => self
                .kek
                .clone()
                .map(WrappingKey::Symmetric)
                .ok_or(KemError::MissingKey(algorithm)),
            WrapAlgorithm::EcdhEsA256Gcm => self
                .ec_public_key()
                .map(WrappingKey::EcPublic)
                .ok_or(KemError::MissingKey(algorithm)),
        }
    }

    pub fn unwrap(&self, algorithm: WrapAlgorithm, wrapped: &[u8]) -> Result<AesKey, KemError> {
        let bytes = match algorithm {
            WrapAlgorithm::A256GcmKw => {
                let kek = self.kek.as_ref().ok_or(KemError::MissingKey(algorithm))?;
                AesGcmKeyWrap.unwrap(wrapped, kek)?
            }
            WrapAlgorithm::EcdhEsA256Gcm => {
                let ec = self.ec.as_ref().ok_or(KemError::MissingKey(algorithm))?;
                EcdhKem::for_key_access().unwrap(wrapped, ec)?
            }
        };
        Ok(AesKey::from_slice(&bytes)?)
    }
}

impl fmt::Debug for CustodianKeyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustodianKeyring")
            .field("kek", &self.kek.is_some())
            .field("ec", &self.ec.is_some())
            .finish()
    }
}
