//! Hashes and keyed bindings with constant-time verification
//!
//! Plain SHA-256 covers things anyone may recompute (policy label, chunks).
//! HMAC-SHA256 covers things only a key holder may check: the binding of a
//! key share to the policy it was wrapped under, and the root signature over
//! all chunk tags.

use crate::crypto::AesKey;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("HMAC initialization failed")]
    InitFailed,

    #[error("{what} does not verify")]
    Mismatch { what: &'static str },

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
}

impl IntegrityError {
    pub fn error_code(&self) -> &'static str {
        match self {
            IntegrityError::InitFailed => "CTDF_E_INTEGRITY_HMAC_INIT",
            IntegrityError::Mismatch { .. } => "CTDF_E_INTEGRITY_MISMATCH",
            IntegrityError::Base64Error(_) => "CTDF_E_INTEGRITY_ENCODING",
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time comparison of two hex digests
///
/// Exact match only; digests are always written in lowercase hex, and
/// differing lengths compare unequal.
pub fn digest_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub fn calculate_hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, IntegrityError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| IntegrityError::InitFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_hmac_b64(
    key: &[u8],
    data: &[u8],
    expected_b64: &str,
    what: &'static str,
) -> Result<(), IntegrityError> {
    let calculated = calculate_hmac(key, data)?;
    let expected = BASE64.decode(expected_b64)?;
    if calculated.ct_eq(&expected).into() {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch { what })
    }
}

/// Base64(HMAC-SHA256(keyShare, hex policy digest))
pub fn policy_binding(key_share: &AesKey, policy_digest_hex: &str) -> Result<String, IntegrityError> {
    let mac = calculate_hmac(key_share.as_slice(), policy_digest_hex.as_bytes())?;
    Ok(BASE64.encode(mac))
}

pub fn verify_policy_binding(
    key_share: &AesKey,
    policy_digest_hex: &str,
    binding_b64: &str,
) -> Result<(), IntegrityError> {
    verify_hmac_b64(
        key_share.as_slice(),
        policy_digest_hex.as_bytes(),
        binding_b64,
        "policy binding",
    )
}

/// Base64(HMAC-SHA256(dek, tag_1 || tag_2 || ...))
pub fn root_signature<'a>(
    tags: impl IntoIterator<Item = &'a [u8]>,
    dek: &AesKey,
) -> Result<String, IntegrityError> {
    let aggregate: Vec<u8> = tags.into_iter().flatten().copied().collect();
    let mac = calculate_hmac(dek.as_slice(), &aggregate)?;
    Ok(BASE64.encode(mac))
}

pub fn verify_root_signature<'a>(
    tags: impl IntoIterator<Item = &'a [u8]>,
    dek: &AesKey,
    expected_b64: &str,
) -> Result<(), IntegrityError> {
    let aggregate: Vec<u8> = tags.into_iter().flatten().copied().collect();
    verify_hmac_b64(dek.as_slice(), &aggregate, expected_b64, "root signature")
}
