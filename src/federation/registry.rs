//! Trust registry of known custodians
//!
//! Readers take an `Arc` to the current snapshot and never block a reload.
//! A reload parses and validates the whole file before swapping; on any
//! error the previous snapshot stays in force.

use p256::ecdsa::VerifyingKey;
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error reading trust registry: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Trust registry is not valid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid registry entry {custodian_id}: {reason}")]
    InvalidEntry {
        custodian_id: String,
        reason: String,
    },

    #[error("Custodian listed twice: {0}")]
    DuplicateCustodian(String),

    #[error("Registry has no backing file to reload from")]
    NoSource,
}

impl RegistryError {
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::IoError(_) => "CTDF_E_REGISTRY_IO",
            RegistryError::JsonError(_) => "CTDF_E_REGISTRY_PARSE",
            RegistryError::InvalidEntry { .. } => "CTDF_E_REGISTRY_INVALID_ENTRY",
            RegistryError::DuplicateCustodian(_) => "CTDF_E_REGISTRY_DUPLICATE",
            RegistryError::NoSource => "CTDF_E_REGISTRY_NO_SOURCE",
        }
    }
}

/// How a peer custodian authenticates on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "mutualTls")]
    MutualTls,
    #[serde(rename = "signedToken")]
    SignedToken,
    #[serde(rename = "sharedKey")]
    SharedKey,
    #[serde(rename = "delegatedOAuth")]
    DelegatedOAuth,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMethod::MutualTls => "mutualTls",
            AuthMethod::SignedToken => "signedToken",
            AuthMethod::SharedKey => "sharedKey",
            AuthMethod::DelegatedOAuth => "delegatedOAuth",
        })
    }
}

/// Ordered from most to least trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustTier {
    Full,
    Partner,
    Limited,
    /// Listed but not to be contacted or accepted
    Suspended,
}

#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRegistryEntry {
    pub custodian_id: String,
    pub endpoint: String,
    pub auth_method: AuthMethod,
    pub trust_tier: TrustTier,
    /// Credential issuers whose attributes this custodian honours; empty = any
    #[serde(default)]
    pub recognized_domains: BTreeSet<String>,
    /// Pairwise secret for `sharedKey`
    #[serde_as(as = "Option<Base64>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_key: Option<Vec<u8>>,
    /// ES256 verification key: the peer's own for `signedToken`, its
    /// authorization server's for `delegatedOAuth`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
}

impl fmt::Debug for TrustRegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustRegistryEntry")
            .field("custodian_id", &self.custodian_id)
            .field("endpoint", &self.endpoint)
            .field("auth_method", &self.auth_method)
            .field("trust_tier", &self.trust_tier)
            .field("recognized_domains", &self.recognized_domains)
            .field("shared_key", &self.shared_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TrustRegistryEntry {
    pub fn new(
        custodian_id: impl Into<String>,
        endpoint: impl Into<String>,
        auth_method: AuthMethod,
        trust_tier: TrustTier,
    ) -> Self {
        Self {
            custodian_id: custodian_id.into(),
            endpoint: endpoint.into(),
            auth_method,
            trust_tier,
            recognized_domains: BTreeSet::new(),
            shared_key: None,
            public_key_pem: None,
        }
    }

    pub fn with_recognized_domains(
        mut self,
        domains: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.recognized_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shared_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.shared_key = Some(key.into());
        self
    }

    pub fn with_public_key_pem(mut self, pem: impl Into<String>) -> Self {
        self.public_key_pem = Some(pem.into());
        self
    }

    pub fn is_suspended(&self) -> bool {
        self.trust_tier == TrustTier::Suspended
    }

    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        self.public_key_pem
            .as_deref()
            .and_then(|pem| VerifyingKey::from_public_key_pem(pem).ok())
    }

    /// Whether this custodian honours credentials from `issuer`
    ///
    /// Matches the full issuer or its host component.
    pub fn recognizes_issuer(&self, issuer: &str) -> bool {
        if self.recognized_domains.is_empty() || self.recognized_domains.contains(issuer) {
            return true;
        }
        let host = issuer
            .split_once("://")
            .map_or(issuer, |(_, rest)| rest)
            .split(|c: char| c == '/' || c == ':')
            .next()
            .unwrap_or_default();
        self.recognized_domains.contains(host)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidEntry {
            custodian_id: self.custodian_id.clone(),
            reason: reason.to_string(),
        };
        if self.custodian_id.trim().is_empty() {
            return Err(invalid("empty custodian id"));
        }
        if !(self.endpoint.starts_with("https://") || self.endpoint.starts_with("http://")) {
            return Err(invalid("endpoint must be an http(s) URL"));
        }
        match self.auth_method {
            AuthMethod::SharedKey if self.shared_key.as_ref().map_or(true, |k| k.len() < 16) => {
                Err(invalid("sharedKey needs a key of at least 16 bytes"))
            }
            AuthMethod::SignedToken if self.verifying_key().is_none() => {
                Err(invalid("signedToken needs a P-256 publicKeyPem"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct RegistryFile {
    custodians: Vec<TrustRegistryEntry>,
}

/// Immutable view of the registry at one generation
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    entries: HashMap<String, TrustRegistryEntry>,
}

impl RegistrySnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, custodian_id: &str) -> Option<&TrustRegistryEntry> {
        self.entries.get(custodian_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TrustRegistryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct TrustRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    generation: AtomicU64,
    source: Option<PathBuf>,
}

impl TrustRegistry {
    pub fn from_entries(entries: Vec<TrustRegistryEntry>) -> Result<Self, RegistryError> {
        let snapshot = build_snapshot(entries, 1)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
            source: None,
        })
    }

    /// Load from a JSON file `{"custodians": [...]}`; any error is fatal
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let entries = read_entries(path)?;
        let mut registry = Self::from_entries(entries)?;
        registry.source = Some(path.to_path_buf());
        info!(path = %path.display(), custodians = registry.snapshot().len(), "trust registry loaded");
        Ok(registry)
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, custodian_id: &str) -> Option<TrustRegistryEntry> {
        self.snapshot().get(custodian_id).cloned()
    }

    /// Swap in a new set of entries; returns the new generation
    pub fn replace(&self, entries: Vec<TrustRegistryEntry>) -> Result<u64, RegistryError> {
        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let snapshot = build_snapshot(entries, generation)?;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.store(generation, Ordering::SeqCst);
        *current = Arc::new(snapshot);
        Ok(generation)
    }

    /// Re-read the backing file, keeping the current snapshot on error
    pub fn reload(&self) -> Result<u64, RegistryError> {
        let path = self.source.as_deref().ok_or(RegistryError::NoSource)?;
        let result = read_entries(path).and_then(|entries| self.replace(entries));
        match &result {
            Ok(generation) => info!(generation, "trust registry reloaded"),
            Err(e) => error!(error = %e, "trust registry reload failed; keeping previous snapshot"),
        }
        result
    }
}

fn read_entries(path: &Path) -> Result<Vec<TrustRegistryEntry>, RegistryError> {
    let content = std::fs::read_to_string(path)?;
    let file: RegistryFile = serde_json::from_str(&content)?;
    Ok(file.custodians)
}

fn build_snapshot(
    entries: Vec<TrustRegistryEntry>,
    generation: u64,
) -> Result<RegistrySnapshot, RegistryError> {
    let mut map = HashMap::with_capacity(entries.len());
    for entry in entries {
        entry.validate()?;
        let id = entry.custodian_id.clone();
        if map.insert(id.clone(), entry).is_some() {
            return Err(RegistryError::DuplicateCustodian(id));
        }
    }
    Ok(RegistrySnapshot {
        generation,
        entries: map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::{EncodePublicKey, LineEnding};
    use rand::rngs::OsRng;
    use std::io::Write;

    fn shared(id: &str) -> TrustRegistryEntry {
        TrustRegistryEntry::new(
            id,
            format!("https://{}.example", id),
            AuthMethod::SharedKey,
            TrustTier::Partner,
        )
        .with_shared_key(vec![9u8; 32])
    }

    #[test]
    fn test_entry_wire_format() {
        let json = r#"{
            "custodianId": "gbr",
            "endpoint": "https://kas.gbr.example",
            "authMethod": "delegatedOAuth",
            "trustTier": "full",
            "recognizedDomains": ["idp.gbr.example"]
        }"#;
        let entry: TrustRegistryEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.auth_method, AuthMethod::DelegatedOAuth);
        assert_eq!(entry.trust_tier, TrustTier::Full);
        assert!(entry.recognizes_issuer("https://idp.gbr.example/realms/mod"));
        assert!(!entry.recognizes_issuer("https://idp.usa.example"));
    }

    #[test]
    fn test_validation() {
        assert!(TrustRegistry::from_entries(vec![shared("usa")]).is_ok());

        let no_key = TrustRegistryEntry::new("fra", "https://fra", AuthMethod::SharedKey, TrustTier::Full);
        assert!(matches!(
            TrustRegistry::from_entries(vec![no_key]),
            Err(RegistryError::InvalidEntry { .. })
        ));

        let bad_url = TrustRegistryEntry::new("fra", "ftp://fra", AuthMethod::MutualTls, TrustTier::Full);
        assert!(TrustRegistry::from_entries(vec![bad_url]).is_err());

        assert!(matches!(
            TrustRegistry::from_entries(vec![shared("usa"), shared("usa")]),
            Err(RegistryError::DuplicateCustodian(_))
        ));

        let key = SigningKey::random(&mut OsRng);
        let pem = VerifyingKey::from(&key)
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let signed = TrustRegistryEntry::new("deu", "https://deu", AuthMethod::SignedToken, TrustTier::Limited)
            .with_public_key_pem(pem);
        assert!(TrustRegistry::from_entries(vec![signed]).is_ok());
    }

    #[test]
    fn test_reload_swaps_snapshot_and_keeps_old_on_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let body = serde_json::to_string(&RegistryFile {
            custodians: vec![shared("usa")],
        })
        .unwrap();
        file.write_all(body.as_bytes()).unwrap();

        let registry = TrustRegistry::load(file.path()).unwrap();
        let before = registry.snapshot();
        assert_eq!(before.generation(), 1);

        let body = serde_json::to_string(&RegistryFile {
            custodians: vec![shared("usa"), shared("gbr")],
        })
        .unwrap();
        std::fs::write(file.path(), body).unwrap();
        assert_eq!(registry.reload().unwrap(), 2);
        assert_eq!(registry.snapshot().len(), 2);
        // readers holding the old snapshot are unaffected
        assert_eq!(before.len(), 1);

        std::fs::write(file.path(), "{ not json").unwrap();
        assert!(registry.reload().is_err());
        assert_eq!(registry.snapshot().generation(), 2);
        assert!(registry.get("gbr").is_some());
    }
}
