//! Compact ES256 JWS
//!
//! Shared by bearer credentials and signed-token peer authentication.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwsError {
    #[error("Token is not a compact JWS")]
    Malformed,

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signature does not verify")]
    BadSignature,

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsHeader {
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// A parsed but not yet verified token
#[derive(Debug)]
pub struct UnverifiedJws<'a> {
    pub header: JwsHeader,
    payload: Vec<u8>,
    signing_input: &'a str,
    signature: Vec<u8>,
}

impl<'a> UnverifiedJws<'a> {
    pub fn parse(token: &'a str) -> Result<Self, JwsError> {
        let mut parts = token.trim().rsplitn(2, '.');
        let (signature_b64, signing_input) = match (parts.next(), parts.next()) {
            (Some(s), Some(i)) => (s, i),
            _ => return Err(JwsError::Malformed),
        };
        let (header_b64, payload_b64) = signing_input.split_once('.').ok_or(JwsError::Malformed)?;
        if payload_b64.contains('.') {
            return Err(JwsError::Malformed);
        }

        let header: JwsHeader = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?;
        if header.alg != "ES256" {
            return Err(JwsError::UnsupportedAlgorithm(header.alg));
        }
        Ok(Self {
            header,
            payload: URL_SAFE_NO_PAD.decode(payload_b64)?,
            signing_input,
            signature: URL_SAFE_NO_PAD.decode(signature_b64)?,
        })
    }

    /// Claims, without any signature check; only for locating the verification key
    pub fn peek_claims<T: DeserializeOwned>(&self) -> Result<T, JwsError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn verify<T: DeserializeOwned>(&self, key: &VerifyingKey) -> Result<T, JwsError> {
        let signature = Signature::from_slice(&self.signature).map_err(|_| JwsError::BadSignature)?;
        key.verify(self.signing_input.as_bytes(), &signature)
            .map_err(|_| JwsError::BadSignature)?;
        self.peek_claims()
    }
}

/// Sign `claims` as `header.payload.signature`
pub fn sign_es256<T: Serialize>(
    key: &SigningKey,
    kid: Option<&str>,
    claims: &T,
) -> Result<String, JwsError> {
    let header = JwsHeader {
        alg: "ES256".to_string(),
        typ: Some("JWT".to_string()),
        kid: kid.map(str::to_string),
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{}.{}", header_b64, payload_b64);
    let signature: Signature = key.sign(signing_input.as_bytes());
    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}
