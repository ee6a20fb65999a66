//! Protected object structure
//!
//! A protected object is `{manifest, policy, payload}`. The policy section
//! carries the label and its SHA-256; the payload carries the AEAD chunks,
//! each with its own hash, and one key access object per custodian.

use crate::integrity::sha256_hex;
use crate::kem::WrapAlgorithm;
use crate::policy::SecurityPolicyLabel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub object_id: String,
    /// Bumped on every policy update
    pub version: u32,
    pub owner: String,
    pub content_type: String,
    /// Plaintext size in bytes
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Hex SHA-256 over the other manifest fields
    pub hash: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDigestInput<'a> {
    object_id: &'a str,
    version: u32,
    owner: &'a str,
    content_type: &'a str,
    size: u64,
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

impl Manifest {
    pub fn digest_hex(&self) -> Result<String, serde_json::Error> {
        let input = ManifestDigestInput {
            object_id: &self.object_id,
            version: self.version,
            owner: &self.owner,
            content_type: &self.content_type,
            size: self.size,
            created_at: &self.created_at,
            updated_at: &self.updated_at,
        };
        Ok(sha256_hex(&serde_json::to_vec(&input)?))
    }
}

/// Hash of a superseded policy revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRevision {
    pub revision: u32,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySection {
    pub label: SecurityPolicyLabel,
    /// Hex SHA-256 of the label's canonical encoding
    pub hash: String,
    pub revision: u32,
    /// Earlier revisions, oldest first; key access objects may still reference them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<PolicyRevision>,
}

impl PolicySection {
    /// Hash recorded for `revision`, current or historical
    pub fn hash_for_revision(&self, revision: u32) -> Option<&str> {
        if revision == self.revision {
            return Some(&self.hash);
        }
        self.history
            .iter()
            .find(|r| r.revision == revision)
            .map(|r| r.hash.as_str())
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: u32,
    #[serde_as(as = "Base64")]
    pub nonce: Vec<u8>,
    /// Ciphertext with the GCM tag appended; stored separately in archives
    #[serde_as(as = "Base64")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ciphertext: Vec<u8>,
    pub plaintext_size: u64,
    pub encrypted_size: u64,
    /// Hex SHA-256 over `index || chunk count || nonce || ciphertext`
    pub hash: String,
}

/// Where a key access object's custodian can be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustodianRef {
    pub custodian_id: String,
    pub endpoint: String,
}

impl CustodianRef {
    pub fn new(custodian_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            custodian_id: custodian_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Wrapped key (or key share) for one custodian
///
/// Never mutated after creation. `policy_digest` is the policy hash at wrap
/// time; `policy_binding` is an HMAC over it keyed by the unwrapped share.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAccessObject {
    pub id: String,
    pub custodian: CustodianRef,
    pub algorithm: WrapAlgorithm,
    #[serde_as(as = "Base64")]
    pub wrapped_key: Vec<u8>,
    pub policy_revision: u32,
    pub policy_digest: String,
    pub policy_binding: String,
}

/// How key access objects combine into the data key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyReleaseMode {
    /// Every KAO wraps the full key; one custodian suffices
    #[default]
    AnyOf,
    /// Every KAO wraps an XOR share; all custodians must release
    AllOf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSection {
    pub chunk_size: u32,
    pub chunks: Vec<Chunk>,
    pub key_access: Vec<KeyAccessObject>,
    #[serde(default)]
    pub key_release: KeyReleaseMode,
    /// Base64 HMAC-SHA256(dek, concatenated chunk tags)
    pub root_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedObject {
    pub manifest: Manifest,
    pub policy: PolicySection,
    pub payload: PayloadSection,
}

impl ProtectedObject {
    pub fn resource_id(&self) -> &str {
        &self.manifest.object_id
    }

    pub fn kao(&self, id: &str) -> Option<&KeyAccessObject> {
        self.payload.key_access.iter().find(|k| k.id == id)
    }

    /// Custodians holding a key access object, in KAO order
    pub fn custodian_ids(&self) -> impl Iterator<Item = &str> {
        self.payload
            .key_access
            .iter()
            .map(|k| k.custodian.custodian_id.as_str())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_for_revision() {
        let label = crate::policy::PolicyBuilder::new(crate::clearance::Clearance::Secret)
            .originating_authority("USA")
            .build()
            .unwrap();
        let section = PolicySection {
            hash: label.digest_hex().unwrap(),
            label,
            revision: 3,
            history: vec![
                PolicyRevision {
                    revision: 1,
                    hash: "aa".into(),
                },
                PolicyRevision {
                    revision: 2,
                    hash: "bb".into(),
                },
            ],
        };
        assert_eq!(section.hash_for_revision(2), Some("bb"));
        assert_eq!(section.hash_for_revision(3), Some(section.hash.as_str()));
        assert_eq!(section.hash_for_revision(4), None);
    }

    #[test]
    fn test_chunk_bytes_are_base64() {
        let chunk = Chunk {
            index: 0,
            nonce: vec![0u8; 12],
            ciphertext: vec![1, 2, 3],
            plaintext_size: 0,
            encrypted_size: 3,
            hash: String::new(),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["nonce"], "AAAAAAAAAAAAAAAA");
        assert_eq!(json["ciphertext"], "AQID");

        let stripped = Chunk {
            ciphertext: Vec::new(),
            ..chunk
        };
        let json = serde_json::to_value(&stripped).unwrap();
        assert!(json.get("ciphertext").is_none());
        let back: Chunk = serde_json::from_value(json).unwrap();
        assert!(back.ciphertext.is_empty());
    }

    #[test]
    fn test_wrap_algorithm_wire_names() {
        assert_eq!(
            serde_json::to_string(&WrapAlgorithm::EcdhEsA256Gcm).unwrap(),
            "\"ECDH-ES+A256GCM\""
        );
        assert_eq!(
            serde_json::to_string(&KeyReleaseMode::AllOf).unwrap(),
            "\"allOf\""
        );
    }
}
