//! Building, verifying and decrypting protected objects
//!
//! Construction seals the plaintext in fixed-size AES-256-GCM chunks, hashes
//! the policy label and every chunk, and wraps the data key (or one XOR share
//! of it) for each custodian. Verification recomputes every stored hash;
//! any mismatch is an integrity violation that no authorization outcome can
//! override.

use crate::crypto::{self, AesKey, EncryptionError};
use crate::integrity::{self, digest_eq, sha256_hex, IntegrityError};
use crate::kem::KemError;
use crate::keyring::WrappingKey;
use crate::manifest::{
    Chunk, CustodianRef, KeyAccessObject, KeyReleaseMode, Manifest, PayloadSection,
    PolicyRevision, PolicySection, ProtectedObject,
};
use crate::pdp::IntegrityStatus;
use crate::policy::{PolicyError, SecurityPolicyLabel};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Key wrapping error: {0}")]
    Kem(#[from] KemError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("A protected object needs at least one custodian")]
    NoCustodians,

    #[error("Custodian {0} appears more than once")]
    DuplicateCustodian(String),

    #[error("Chunk size must be between 1 and {max} bytes, got {got}")]
    InvalidChunkSize { got: usize, max: usize },

    #[error("Integrity violation: {0}")]
    IntegrityViolation(IntegrityReport),

    #[error("Expected {expected} key shares, got {got}")]
    MissingShares { expected: usize, got: usize },
}

impl CodecError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CodecError::Policy(e) => e.error_code(),
            CodecError::Encryption(e) => e.error_code(),
            CodecError::Kem(e) => e.error_code(),
            CodecError::Integrity(e) => e.error_code(),
            CodecError::Serialization(_) => "CTDF_E_CODEC_SERIALIZATION",
            CodecError::NoCustodians => "CTDF_E_CODEC_NO_CUSTODIANS",
            CodecError::DuplicateCustodian(_) => "CTDF_E_CODEC_DUPLICATE_CUSTODIAN",
            CodecError::InvalidChunkSize { .. } => "CTDF_E_CODEC_CHUNK_SIZE",
            CodecError::IntegrityViolation(_) => "CTDF_E_CODEC_INTEGRITY_VIOLATION",
            CodecError::MissingShares { .. } => "CTDF_E_CODEC_MISSING_SHARES",
        }
    }

    /// True when the object itself is corrupt or tampered with
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CodecError::IntegrityViolation(_)
                | CodecError::Integrity(_)
                | CodecError::Encryption(EncryptionError::AeadError(_))
        )
    }
}

/// One binding that failed to verify
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum IntegrityFailure {
    ManifestHash,
    PolicyHash,
    /// Manifest size disagrees with the chunk sizes
    PayloadSize,
    #[serde(rename_all = "camelCase")]
    ChunkHash { index: u32 },
    #[serde(rename_all = "camelCase")]
    ChunkLayout { position: usize },
    #[serde(rename_all = "camelCase")]
    KeyAccessBinding { kao_id: String },
    #[serde(rename_all = "camelCase")]
    UnknownPolicyRevision { kao_id: String, revision: u32 },
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFailure::ManifestHash => write!(f, "manifest hash mismatch"),
            IntegrityFailure::PolicyHash => write!(f, "policy hash mismatch"),
            IntegrityFailure::PayloadSize => {
                write!(f, "manifest size does not match the chunk sizes")
            }
            IntegrityFailure::ChunkHash { index } => write!(f, "chunk {} hash mismatch", index),
            IntegrityFailure::ChunkLayout { position } => {
                write!(f, "chunk at position {} is out of order or malformed", position)
            }
            IntegrityFailure::KeyAccessBinding { kao_id } => {
                write!(f, "key access object {} is bound to a different policy", kao_id)
            }
            IntegrityFailure::UnknownPolicyRevision { kao_id, revision } => write!(
                f,
                "key access object {} references unknown policy revision {}",
                kao_id, revision
            ),
        }
    }
}

/// Outcome of recomputing every hash binding of an object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub failures: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn status(&self) -> IntegrityStatus {
        if self.is_intact() {
            IntegrityStatus::Verified
        } else {
            IntegrityStatus::Violated
        }
    }
}

impl fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return f.write_str("intact");
        }
        let parts: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("; "))
    }
}

/// A custodian that receives a key access object
#[derive(Debug, Clone)]
pub struct CustodianRecipient {
    pub custodian: CustodianRef,
    pub wrapping_key: WrappingKey,
}

impl CustodianRecipient {
    pub fn new(custodian: CustodianRef, wrapping_key: WrappingKey) -> Self {
        Self {
            custodian,
            wrapping_key,
        }
    }
}

/// Builder for a new protected object
///
/// ```no_run
/// # use coalition_tdf::prelude::*;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let label = PolicyBuilder::new(Clearance::Secret)
///     .releasable_to(["USA", "GBR"])
///     .originating_authority("USA")
///     .build()?;
/// let keyring = CustodianKeyring::generate();
/// let object = ProtectedObject::builder(label)
///     .owner("analyst@usa")
///     .custodian(
///         CustodianRef::new("usa", "https://custodian.usa.example"),
///         keyring.wrapping_key(WrapAlgorithm::EcdhEsA256Gcm)?,
///     )
///     .build(b"coalition report")?;
/// # Ok(())
/// # }
/// ```
pub struct ProtectedObjectBuilder {
    label: SecurityPolicyLabel,
    object_id: Option<String>,
    owner: String,
    content_type: String,
    chunk_size: usize,
    recipients: Vec<CustodianRecipient>,
    key_release: KeyReleaseMode,
    now: Option<DateTime<Utc>>,
}

impl ProtectedObjectBuilder {
    fn new(label: SecurityPolicyLabel) -> Self {
        Self {
            label,
            object_id: None,
            owner: String::new(),
            content_type: "application/octet-stream".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            recipients: Vec::new(),
            key_release: KeyReleaseMode::default(),
            now: None,
        }
    }

    /// Defaults to a random UUID
    pub fn object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn custodian(mut self, custodian: CustodianRef, wrapping_key: WrappingKey) -> Self {
        self.recipients
            .push(CustodianRecipient::new(custodian, wrapping_key));
        self
    }

    pub fn recipients(mut self, recipients: impl IntoIterator<Item = CustodianRecipient>) -> Self {
        self.recipients.extend(recipients);
        self
    }

    pub fn key_release(mut self, mode: KeyReleaseMode) -> Self {
        self.key_release = mode;
        self
    }

    /// Timestamp for the manifest; defaults to now
    pub fn created_at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn build(self, plaintext: &[u8]) -> Result<ProtectedObject, CodecError> {
        self.label.validate()?;
        if self.chunk_size == 0 || self.chunk_size > u32::MAX as usize {
            return Err(CodecError::InvalidChunkSize {
                got: self.chunk_size,
                max: u32::MAX as usize,
            });
        }
        if self.recipients.is_empty() {
            return Err(CodecError::NoCustodians);
        }
        let mut seen = BTreeSet::new();
        for r in &self.recipients {
            if !seen.insert(r.custodian.custodian_id.as_str()) {
                return Err(CodecError::DuplicateCustodian(
                    r.custodian.custodian_id.clone(),
                ));
            }
        }

        let dek = AesKey::generate();
        let policy_hash = self.label.digest_hex()?;

        let pieces: Vec<&[u8]> = if plaintext.is_empty() {
            vec![&[][..]]
        } else {
            plaintext.chunks(self.chunk_size).collect()
        };
        let count = u32::try_from(pieces.len()).map_err(|_| CodecError::InvalidChunkSize {
            got: self.chunk_size,
            max: u32::MAX as usize,
        })?;
        let mut chunks = Vec::with_capacity(pieces.len());
        for (index, piece) in pieces.into_iter().enumerate() {
            let sealed = crypto::seal_chunk(&dek, piece)?;
            let index = index as u32;
            chunks.push(Chunk {
                index,
                hash: chunk_hash(index, count, &sealed.nonce, &sealed.ciphertext),
                nonce: sealed.nonce.to_vec(),
                plaintext_size: piece.len() as u64,
                encrypted_size: sealed.ciphertext.len() as u64,
                ciphertext: sealed.ciphertext,
            });
        }
        let root_signature =
            integrity::root_signature(chunks.iter().map(|c| crypto::tag_of(&c.ciphertext)), &dek)?;

        let shares = match self.key_release {
            KeyReleaseMode::AnyOf => vec![dek.clone(); self.recipients.len()],
            KeyReleaseMode::AllOf => dek.xor_split(self.recipients.len()),
        };
        let mut key_access = Vec::with_capacity(self.recipients.len());
        for (i, (recipient, share)) in self.recipients.into_iter().zip(shares.iter()).enumerate() {
            key_access.push(KeyAccessObject {
                id: format!("kao-{}", i),
                algorithm: recipient.wrapping_key.algorithm(),
                wrapped_key: recipient.wrapping_key.wrap(share)?,
                policy_revision: 1,
                policy_digest: policy_hash.clone(),
                policy_binding: integrity::policy_binding(share, &policy_hash)?,
                custodian: recipient.custodian,
            });
        }

        let now = self.now.unwrap_or_else(Utc::now);
        let object_id = self
            .object_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!(
            object_id = %object_id,
            chunks = chunks.len(),
            custodians = key_access.len(),
            "sealed protected object"
        );

        let mut manifest = Manifest {
            object_id,
            version: 1,
            owner: self.owner,
            content_type: self.content_type,
            size: plaintext.len() as u64,
            created_at: now,
            updated_at: now,
            hash: String::new(),
        };
        manifest.hash = manifest.digest_hex()?;

        Ok(ProtectedObject {
            manifest,
            policy: PolicySection {
                label: self.label,
                hash: policy_hash,
                revision: 1,
                history: Vec::new(),
            },
            payload: PayloadSection {
                chunk_size: self.chunk_size as u32,
                chunks,
                key_access,
                key_release: self.key_release,
                root_signature,
            },
        })
    }
}

/// Hex SHA-256 over `index || count || nonce || ciphertext`
///
/// Index and count are big-endian, so a chunk moved or dropped from the
/// sequence no longer matches its stored hash.
pub fn chunk_hash(index: u32, count: u32, nonce: &[u8], ciphertext: &[u8]) -> String {
    let mut buf = Vec::with_capacity(8 + nonce.len() + ciphertext.len());
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(&count.to_be_bytes());
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(ciphertext);
    sha256_hex(&buf)
}

impl ProtectedObject {
    pub fn builder(label: SecurityPolicyLabel) -> ProtectedObjectBuilder {
        ProtectedObjectBuilder::new(label)
    }

    /// Recompute every hash binding without any key material
    ///
    /// Checks the manifest and policy hashes, each chunk's position, size and
    /// hash, and that every key access object's digest matches the policy
    /// revision it was wrapped under. All failures are collected.
    pub fn verify(&self) -> IntegrityReport {
        let mut failures = Vec::new();
        self.check_manifest(&mut failures);
        self.check_policy(&mut failures);
        self.check_chunks(&mut failures);
        self.check_key_access(&mut failures);
        self.report(failures)
    }

    /// Policy and key access bindings only, for copies stored without payload
    pub fn verify_bindings(&self) -> IntegrityReport {
        let mut failures = Vec::new();
        self.check_manifest(&mut failures);
        self.check_policy(&mut failures);
        self.check_key_access(&mut failures);
        self.report(failures)
    }

    /// Whether chunk ciphertexts are attached
    pub fn has_payload(&self) -> bool {
        !self.payload.chunks.is_empty()
            && self.payload.chunks.iter().all(|c| !c.ciphertext.is_empty())
    }

    fn check_manifest(&self, failures: &mut Vec<IntegrityFailure>) {
        match self.manifest.digest_hex() {
            Ok(h) if digest_eq(&h, &self.manifest.hash) => {}
            _ => failures.push(IntegrityFailure::ManifestHash),
        }
        let chunk_total = self
            .payload
            .chunks
            .iter()
            .try_fold(0u64, |total, c| total.checked_add(c.plaintext_size));
        if chunk_total != Some(self.manifest.size) {
            failures.push(IntegrityFailure::PayloadSize);
        }
    }

    fn check_policy(&self, failures: &mut Vec<IntegrityFailure>) {
        match self.policy.label.digest_hex() {
            Ok(h) if digest_eq(&h, &self.policy.hash) => {}
            _ => failures.push(IntegrityFailure::PolicyHash),
        }
    }

    fn check_chunks(&self, failures: &mut Vec<IntegrityFailure>) {
        let count = match u32::try_from(self.payload.chunks.len()) {
            Ok(0) | Err(_) => {
                failures.push(IntegrityFailure::ChunkLayout { position: 0 });
                return;
            }
            Ok(count) => count,
        };
        for (position, chunk) in self.payload.chunks.iter().enumerate() {
            if chunk.index as usize != position
                || chunk.encrypted_size != chunk.ciphertext.len() as u64
                || chunk.plaintext_size.checked_add(crypto::GCM_TAG_SIZE as u64)
                    != Some(chunk.encrypted_size)
                || chunk.nonce.len() != crypto::GCM_NONCE_SIZE
            {
                failures.push(IntegrityFailure::ChunkLayout { position });
                continue;
            }
            let expected = chunk_hash(chunk.index, count, &chunk.nonce, &chunk.ciphertext);
            if !digest_eq(&expected, &chunk.hash) {
                failures.push(IntegrityFailure::ChunkHash { index: chunk.index });
            }
        }
    }

    fn check_key_access(&self, failures: &mut Vec<IntegrityFailure>) {
        for kao in &self.payload.key_access {
            match self.policy.hash_for_revision(kao.policy_revision) {
                None => failures.push(IntegrityFailure::UnknownPolicyRevision {
                    kao_id: kao.id.clone(),
                    revision: kao.policy_revision,
                }),
                Some(h) if !digest_eq(h, &kao.policy_digest) => {
                    failures.push(IntegrityFailure::KeyAccessBinding {
                        kao_id: kao.id.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }

    fn report(&self, failures: Vec<IntegrityFailure>) -> IntegrityReport {
        if !failures.is_empty() {
            warn!(
                object_id = %self.manifest.object_id,
                failures = failures.len(),
                "protected object failed integrity verification"
            );
        }
        IntegrityReport { failures }
    }

    pub fn integrity_status(&self) -> IntegrityStatus {
        self.verify().status()
    }

    fn chunk_tags(&self) -> impl Iterator<Item = &[u8]> {
        self.payload
            .chunks
            .iter()
            .map(|c| crypto::tag_of(&c.ciphertext))
    }

    /// Verify, then decrypt with the assembled data key
    pub fn decrypt(&self, dek: &AesKey) -> Result<Vec<u8>, CodecError> {
        let report = self.verify();
        if !report.is_intact() {
            return Err(CodecError::IntegrityViolation(report));
        }
        integrity::verify_root_signature(self.chunk_tags(), dek, &self.payload.root_signature)?;

        let capacity = self
            .payload
            .chunks
            .iter()
            .map(|c| c.ciphertext.len() - crypto::GCM_TAG_SIZE)
            .sum();
        let mut plaintext = Vec::with_capacity(capacity);
        for chunk in &self.payload.chunks {
            plaintext.extend(crypto::open_chunk(dek, &chunk.nonce, &chunk.ciphertext)?);
        }
        Ok(plaintext)
    }

    /// Replace the policy label
    ///
    /// The previous hash moves to the history so existing key access objects,
    /// which are never rewritten, still verify against their wrap-time policy.
    pub fn update_policy(&mut self, label: SecurityPolicyLabel) -> Result<(), CodecError> {
        label.validate()?;
        let hash = label.digest_hex()?;
        let previous = PolicyRevision {
            revision: self.policy.revision,
            hash: std::mem::replace(&mut self.policy.hash, hash),
        };
        self.policy.history.push(previous);
        self.policy.revision += 1;
        self.policy.label = label;
        self.manifest.version += 1;
        self.manifest.updated_at = Utc::now();
        self.manifest.hash = self.manifest.digest_hex()?;
        debug!(
            object_id = %self.manifest.object_id,
            revision = self.policy.revision,
            "policy updated"
        );
        Ok(())
    }

    /// Combine released key material into the data key
    ///
    /// Any-of objects need one released key; all-of objects need a share from
    /// every key access object.
    pub fn assemble_key(&self, shares: &[AesKey]) -> Result<AesKey, CodecError> {
        match self.payload.key_release {
            KeyReleaseMode::AnyOf => shares.first().cloned().ok_or(CodecError::MissingShares {
                expected: 1,
                got: 0,
            }),
            KeyReleaseMode::AllOf => {
                let expected = self.payload.key_access.len();
                if shares.len() != expected {
                    return Err(CodecError::MissingShares {
                        expected,
                        got: shares.len(),
                    });
                }
                Ok(AesKey::xor_combine(shares)?)
            }
        }
    }
}
