//! Authentication of custodian-to-custodian hops
//!
//! `sharedKey` peers send `X-Custodian-Timestamp` and a hex HMAC-SHA256 of
//! `"{custodianId}\n{timestamp}\n" || body` in `X-Custodian-Signature`.
//! `signedToken` peers send an ES256 bearer token whose claims bind the
//! caller, the target and a SHA-256 of the body. `delegatedOAuth` peers send
//! an ES256 bearer token from their authorization server, checked against the
//! registry entry's key with `sub` naming the peer and `aud` naming us.
//! `mutualTls` peers terminate TLS at a proxy we trust; the proxy proves itself
//! with a shared token and forwards the verified client certificate subject.
//! Without a configured proxy token, `mutualTls` callers are refused.

use super::registry::{AuthMethod, RegistrySnapshot, TrustRegistryEntry};
use crate::integrity::{calculate_hmac, sha256_hex, IntegrityError};
use crate::jws::{sign_es256, JwsError, UnverifiedJws};
use chrono::{DateTime, Utc};
use p256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const HEADER_CUSTODIAN_ID: &str = "x-custodian-id";
pub const HEADER_TIMESTAMP: &str = "x-custodian-timestamp";
pub const HEADER_SIGNATURE: &str = "x-custodian-signature";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_PROXY_TOKEN: &str = "x-custodian-proxy-token";
pub const HEADER_CLIENT_CERT_SUBJECT: &str = "x-client-cert-subject";

const TOKEN_LIFETIME_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum PeerAuthError {
    #[error("Missing header {0}")]
    MissingHeader(&'static str),

    #[error("Unknown peer custodian: {0}")]
    UnknownPeer(String),

    #[error("Peer custodian is suspended: {0}")]
    Suspended(String),

    #[error("Peer signature does not verify")]
    BadSignature,

    #[error("Peer request is outside the accepted time window")]
    Stale,

    #[error("{0} caller was not vouched for by a trusted TLS proxy")]
    TransportUnverified(AuthMethod),

    #[error("No local credential for {0}")]
    MissingCredential(&'static str),

    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),

    #[error("HMAC error: {0}")]
    Hmac(#[from] IntegrityError),
}

impl PeerAuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            PeerAuthError::MissingHeader(_) => "CTDF_E_PEER_MISSING_HEADER",
            PeerAuthError::UnknownPeer(_) => "CTDF_E_PEER_UNKNOWN",
            PeerAuthError::Suspended(_) => "CTDF_E_PEER_SUSPENDED",
            PeerAuthError::BadSignature | PeerAuthError::Jws(_) => "CTDF_E_PEER_SIGNATURE",
            PeerAuthError::Stale => "CTDF_E_PEER_STALE",
            PeerAuthError::TransportUnverified(_) => "CTDF_E_PEER_TRANSPORT",
            PeerAuthError::MissingCredential(_) => "CTDF_E_PEER_CREDENTIAL",
            PeerAuthError::Hmac(_) => "CTDF_E_PEER_HMAC",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerTokenClaims {
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
    body_hash: String,
}

/// Access token minted by a peer's authorization server
#[derive(Debug, Deserialize)]
struct DelegatedTokenClaims {
    sub: String,
    aud: String,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
}

/// What this custodian presents when it calls a peer
#[derive(Clone)]
pub struct LocalIdentity {
    pub custodian_id: String,
    signing_key: Option<SigningKey>,
    oauth_token: Option<String>,
    client_identity_pem: Option<Vec<u8>>,
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("custodian_id", &self.custodian_id)
            .field("signing_key", &self.signing_key.is_some())
            .field("oauth_token", &self.oauth_token.is_some())
            .field("client_identity", &self.client_identity_pem.is_some())
            .finish()
    }
}

impl LocalIdentity {
    pub fn new(custodian_id: impl Into<String>) -> Self {
        Self {
            custodian_id: custodian_id.into(),
            signing_key: None,
            oauth_token: None,
            client_identity_pem: None,
        }
    }

    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn with_oauth_token(mut self, token: impl Into<String>) -> Self {
        self.oauth_token = Some(token.into());
        self
    }

    /// PEM certificate chain followed by its private key, for mutual TLS
    pub fn with_client_identity_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.client_identity_pem = Some(pem.into());
        self
    }

    pub fn client_identity_pem(&self) -> Option<&[u8]> {
        self.client_identity_pem.as_deref()
    }

    /// Headers authenticating a call carrying `body` to `peer`
    pub fn outbound_headers(
        &self,
        peer: &TrustRegistryEntry,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Vec<(&'static str, String)>, PeerAuthError> {
        let mut headers = vec![(HEADER_CUSTODIAN_ID, self.custodian_id.clone())];
        match peer.auth_method {
            AuthMethod::SharedKey => {
                let key = peer
                    .shared_key
                    .as_deref()
                    .ok_or(PeerAuthError::MissingCredential("sharedKey"))?;
                let timestamp = now.timestamp();
                let mac = calculate_hmac(key, &signing_payload(&self.custodian_id, timestamp, body))?;
                headers.push((HEADER_TIMESTAMP, timestamp.to_string()));
                headers.push((HEADER_SIGNATURE, hex::encode(mac)));
            }
            AuthMethod::SignedToken => {
                let key = self
                    .signing_key
                    .as_ref()
                    .ok_or(PeerAuthError::MissingCredential("signedToken"))?;
                let iat = now.timestamp();
                let claims = PeerTokenClaims {
                    iss: self.custodian_id.clone(),
                    aud: peer.custodian_id.clone(),
                    iat,
                    exp: iat + TOKEN_LIFETIME_SECS,
                    body_hash: sha256_hex(body),
                };
                let token = sign_es256(key, Some(&self.custodian_id), &claims)?;
                headers.push((HEADER_AUTHORIZATION, format!("Bearer {}", token)));
            }
            AuthMethod::DelegatedOAuth => {
                let token = self
                    .oauth_token
                    .as_deref()
                    .ok_or(PeerAuthError::MissingCredential("delegatedOAuth"))?;
                headers.push((HEADER_AUTHORIZATION, format!("Bearer {}", token)));
            }
            AuthMethod::MutualTls => {}
        }
        Ok(headers)
    }
}

fn signing_payload(custodian_id: &str, timestamp: i64, body: &[u8]) -> Vec<u8> {
    let mut payload = format!("{}\n{}\n", custodian_id, timestamp).into_bytes();
    payload.extend_from_slice(body);
    payload
}

/// Checks inbound peer calls against the trust registry
#[derive(Clone)]
pub struct PeerVerifier {
    local_id: String,
    max_skew: Duration,
    proxy_token: Option<Vec<u8>>,
}

impl fmt::Debug for PeerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerVerifier")
            .field("local_id", &self.local_id)
            .field("max_skew", &self.max_skew)
            .field("proxy_token", &self.proxy_token.is_some())
            .finish()
    }
}

impl PeerVerifier {
    pub fn new(local_id: impl Into<String>, max_skew: Duration) -> Self {
        Self {
            local_id: local_id.into(),
            max_skew,
            proxy_token: None,
        }
    }

    /// Token the TLS-terminating proxy sends in `X-Custodian-Proxy-Token`
    pub fn with_proxy_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.proxy_token = Some(token.into()).filter(|t: &Vec<u8>| !t.is_empty());
        self
    }

    /// Authenticated peer custodian id
    pub fn authenticate(
        &self,
        registry: &RegistrySnapshot,
        header: impl Fn(&str) -> Option<String>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<String, PeerAuthError> {
        let peer_id = header(HEADER_CUSTODIAN_ID).ok_or(PeerAuthError::MissingHeader(HEADER_CUSTODIAN_ID))?;
        let entry = registry
            .get(&peer_id)
            .ok_or_else(|| PeerAuthError::UnknownPeer(peer_id.clone()))?;
        if entry.is_suspended() {
            return Err(PeerAuthError::Suspended(peer_id));
        }

        match entry.auth_method {
            AuthMethod::SharedKey => self.check_shared_key(entry, &header, body, now)?,
            AuthMethod::SignedToken => self.check_signed_token(entry, &header, body, now)?,
            AuthMethod::DelegatedOAuth => self.check_delegated_token(entry, &header, now)?,
            AuthMethod::MutualTls => self.check_transport(entry, &header)?,
        }
        Ok(peer_id)
    }

    fn within_skew(&self, timestamp: i64, now: DateTime<Utc>) -> bool {
        now.timestamp()
            .checked_sub(timestamp)
            .is_some_and(|delta| delta.unsigned_abs() <= self.max_skew.as_secs())
    }

    fn skew_secs(&self) -> i64 {
        i64::try_from(self.max_skew.as_secs()).unwrap_or(i64::MAX)
    }

    fn bearer(header: &impl Fn(&str) -> Option<String>) -> Result<String, PeerAuthError> {
        let authorization =
            header(HEADER_AUTHORIZATION).ok_or(PeerAuthError::MissingHeader(HEADER_AUTHORIZATION))?;
        authorization
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .ok_or(PeerAuthError::BadSignature)
    }

    fn check_shared_key(
        &self,
        entry: &TrustRegistryEntry,
        header: &impl Fn(&str) -> Option<String>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), PeerAuthError> {
        let key = entry
            .shared_key
            .as_deref()
            .ok_or(PeerAuthError::MissingCredential("sharedKey"))?;
        let timestamp: i64 = header(HEADER_TIMESTAMP)
            .ok_or(PeerAuthError::MissingHeader(HEADER_TIMESTAMP))?
            .parse()
            .map_err(|_| PeerAuthError::BadSignature)?;
        if !self.within_skew(timestamp, now) {
            return Err(PeerAuthError::Stale);
        }
        let presented = header(HEADER_SIGNATURE)
            .ok_or(PeerAuthError::MissingHeader(HEADER_SIGNATURE))
            .and_then(|sig| hex::decode(sig).map_err(|_| PeerAuthError::BadSignature))?;
        let expected = calculate_hmac(key, &signing_payload(&entry.custodian_id, timestamp, body))?;
        if expected.ct_eq(&presented).into() {
            Ok(())
        } else {
            Err(PeerAuthError::BadSignature)
        }
    }

    fn check_signed_token(
        &self,
        entry: &TrustRegistryEntry,
        header: &impl Fn(&str) -> Option<String>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), PeerAuthError> {
        let token = Self::bearer(header)?;
        let key = entry
            .verifying_key()
            .ok_or(PeerAuthError::MissingCredential("signedToken"))?;
        let claims: PeerTokenClaims = UnverifiedJws::parse(&token)?.verify(&key)?;

        if claims.iss != entry.custodian_id || claims.aud != self.local_id {
            return Err(PeerAuthError::BadSignature);
        }
        let skew = self.skew_secs();
        let now = now.timestamp();
        if now > claims.exp.saturating_add(skew) || claims.iat > now.saturating_add(skew) {
            return Err(PeerAuthError::Stale);
        }
        if !crate::integrity::digest_eq(&claims.body_hash, &sha256_hex(body)) {
            return Err(PeerAuthError::BadSignature);
        }
        Ok(())
    }

    fn check_delegated_token(
        &self,
        entry: &TrustRegistryEntry,
        header: &impl Fn(&str) -> Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PeerAuthError> {
        let token = Self::bearer(header)?;
        let key = entry
            .verifying_key()
            .ok_or(PeerAuthError::MissingCredential("delegatedOAuth"))?;
        let claims: DelegatedTokenClaims = UnverifiedJws::parse(&token)?.verify(&key)?;

        if claims.sub != entry.custodian_id || claims.aud != self.local_id {
            return Err(PeerAuthError::BadSignature);
        }
        let skew = self.skew_secs();
        let now = now.timestamp();
        let issued_ahead = claims.iat.is_some_and(|iat| iat > now.saturating_add(skew));
        if now > claims.exp.saturating_add(skew) || issued_ahead {
            return Err(PeerAuthError::Stale);
        }
        Ok(())
    }

    fn check_transport(
        &self,
        entry: &TrustRegistryEntry,
        header: &impl Fn(&str) -> Option<String>,
    ) -> Result<(), PeerAuthError> {
        let unverified = || PeerAuthError::TransportUnverified(entry.auth_method);
        let expected = self.proxy_token.as_deref().ok_or_else(unverified)?;
        let presented = header(HEADER_PROXY_TOKEN).ok_or_else(unverified)?;
        if !bool::from(expected.ct_eq(presented.as_bytes())) {
            return Err(unverified());
        }
        let subject = header(HEADER_CLIENT_CERT_SUBJECT)
            .ok_or(PeerAuthError::MissingHeader(HEADER_CLIENT_CERT_SUBJECT))?;
        if subject_common_name(&subject) != entry.custodian_id {
            return Err(unverified());
        }
        Ok(())
    }
}

/// `CN` of a distinguished name like `CN=usa,O=Coalition`, or the value itself
fn subject_common_name(subject: &str) -> &str {
    if !subject.contains('=') {
        return subject.trim();
    }
    subject
        .split(|c| c == ',' || c == '/')
        .filter_map(|rdn| rdn.split_once('='))
        .find(|(attr, _)| attr.trim().eq_ignore_ascii_case("CN"))
        .map_or("", |(_, value)| value.trim())
}
