//! Bearer credential verification
//!
//! A credential is an ES256 compact JWS issued by an identity provider. The
//! verifier checks the signature against the issuer's key, checks freshness,
//! and normalizes the attribute claims into [`SubjectAttributes`]. Anything
//! it cannot verify is `AuthenticationInvalid`; unreachable key material is
//! a separate, retryable condition that still denies.

use crate::assurance::AuthenticationContext;
use crate::attributes::SubjectAttributes;
use crate::clearance::Clearance;
use crate::config::{load_json, ConfigError, CredentialConfig, RetryConfig};
use crate::jws::{sign_es256, JwsError, UnverifiedJws};
use crate::retry::{with_backoff, Retryable};
use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Malformed credential: {0}")]
    Malformed(#[from] JwsError),

    #[error("Credential has no key id")]
    MissingKeyId,

    #[error("Issuer {0} is not accepted")]
    UntrustedIssuer(String),

    #[error("No key {kid} for issuer {issuer}")]
    UnknownKey { issuer: String, kid: String },

    #[error("Credential expired")]
    Expired,

    #[error("Credential not yet valid")]
    NotYetValid,

    #[error("Invalid claim {claim}: {reason}")]
    InvalidClaim { claim: &'static str, reason: String },

    #[error("Issuer keys unavailable: {0}")]
    KeySourceUnavailable(String),

    #[error("Issuer key set is invalid: {0}")]
    InvalidKeySet(String),
}

impl CredentialError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CredentialError::Malformed(JwsError::BadSignature) => "CTDF_E_AUTH_SIGNATURE",
            CredentialError::Malformed(_) => "CTDF_E_AUTH_MALFORMED",
            CredentialError::MissingKeyId => "CTDF_E_AUTH_MISSING_KID",
            CredentialError::UntrustedIssuer(_) => "CTDF_E_AUTH_UNTRUSTED_ISSUER",
            CredentialError::UnknownKey { .. } => "CTDF_E_AUTH_UNKNOWN_KEY",
            CredentialError::Expired => "CTDF_E_AUTH_EXPIRED",
            CredentialError::NotYetValid => "CTDF_E_AUTH_NOT_YET_VALID",
            CredentialError::InvalidClaim { .. } => "CTDF_E_AUTH_INVALID_CLAIM",
            CredentialError::KeySourceUnavailable(_) => "CTDF_E_AUTH_KEYS_UNAVAILABLE",
            CredentialError::InvalidKeySet(_) => "CTDF_E_AUTH_KEY_SET",
        }
    }

    /// Verification material could not be obtained; the credential itself may be fine
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CredentialError::KeySourceUnavailable(_))
    }
}

impl Retryable for CredentialError {
    fn is_retryable(&self) -> bool {
        self.is_unavailable()
    }
}

/// Accepts a JSON array, a JSON-encoded array inside a string, or a comma list
fn deserialize_coi<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::List(list)) => list,
        Some(Raw::Text(text)) => match serde_json::from_str::<Vec<String>>(&text) {
            Ok(list) => list,
            Err(_) => text
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        },
    })
}

/// Claims carried by a bearer credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialClaims {
    pub iss: String,
    pub sub: String,
    #[serde(rename = "uniqueID", default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    pub clearance: String,
    /// Country whose marking vocabulary `clearance` uses; defaults to the affiliation
    #[serde(rename = "clearanceCountry", default, skip_serializing_if = "Option::is_none")]
    pub clearance_country: Option<String>,
    #[serde(rename = "countryOfAffiliation")]
    pub country_of_affiliation: String,
    #[serde(rename = "acpCOI", default, deserialize_with = "deserialize_coi")]
    pub acp_coi: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acr: Option<Value>,
    #[serde(default)]
    pub amr: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
}

fn timestamp(claim: &'static str, secs: i64) -> Result<DateTime<Utc>, CredentialError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| CredentialError::InvalidClaim {
            claim,
            reason: format!("{} is not a valid timestamp", secs),
        })
}

impl CredentialClaims {
    /// Normalize into engine attributes
    ///
    /// Unknown clearance markings become UNCLASSIFIED. A credential without
    /// `auth_time` or `iat` is treated as authenticated at the epoch, which
    /// fails any maximum-age requirement.
    pub fn to_attributes(&self) -> Result<SubjectAttributes, CredentialError> {
        let country = self.country_of_affiliation.trim().to_uppercase();
        let marking_country = self.clearance_country.as_deref().unwrap_or(&country);
        let clearance = Clearance::from_national(marking_country, &self.clearance)
            .unwrap_or_else(|| {
                warn!(
                    subject = %self.sub,
                    marking = %self.clearance,
                    country = %marking_country,
                    "unrecognized clearance marking; treating as UNCLASSIFIED"
                );
                Clearance::Unclassified
            });

        let authenticated_at = match self.auth_time.or(self.iat) {
            Some(secs) => timestamp("auth_time", secs)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        let authentication =
            AuthenticationContext::from_claims(self.acr.as_ref(), &self.amr, authenticated_at);

        let unique_id = self.unique_id.clone().unwrap_or_else(|| self.sub.clone());
        let attributes = SubjectAttributes::new(unique_id, clearance, country, authenticated_at)
            .with_coi(self.acp_coi.iter().cloned())
            .with_authentication(authentication)
            .with_issuer(self.iss.clone());
        attributes
            .check_format()
            .map_err(|e| CredentialError::InvalidClaim {
                claim: "attributes",
                reason: e.to_string(),
            })?;
        Ok(attributes)
    }
}

/// Signs credentials; used by test identity providers and tooling
#[derive(Clone)]
pub struct CredentialIssuer {
    issuer: String,
    kid: String,
    signing_key: SigningKey,
}

impl CredentialIssuer {
    pub fn new(issuer: impl Into<String>, kid: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            issuer: issuer.into(),
            kid: kid.into(),
            signing_key,
        }
    }

    pub fn generate(issuer: impl Into<String>, kid: impl Into<String>) -> Self {
        Self::new(issuer, kid, SigningKey::random(&mut OsRng))
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey::from(&self.signing_key)
    }

    /// Sign `claims`; `iss` is overwritten with this issuer
    pub fn sign(&self, claims: &CredentialClaims) -> Result<String, CredentialError> {
        let mut claims = claims.clone();
        claims.iss = self.issuer.clone();
        Ok(sign_es256(&self.signing_key, Some(&self.kid), &claims)?)
    }
}

impl std::fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("issuer", &self.issuer)
            .field("kid", &self.kid)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeySetEntry {
    issuer: String,
    kid: String,
    public_key_pem: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeySetDocument {
    keys: Vec<KeySetEntry>,
}

/// Verification keys indexed by (issuer, kid)
#[derive(Debug, Clone, Default)]
pub struct IssuerKeySet {
    keys: HashMap<(String, String), VerifyingKey>,
}

impl IssuerKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, issuer: impl Into<String>, kid: impl Into<String>, key: VerifyingKey) {
        self.keys.insert((issuer.into(), kid.into()), key);
    }

    #[must_use]
    pub fn with_key(mut self, issuer: impl Into<String>, kid: impl Into<String>, key: VerifyingKey) -> Self {
        self.insert(issuer, kid, key);
        self
    }

    pub fn get(&self, issuer: &str, kid: &str) -> Option<&VerifyingKey> {
        self.keys.get(&(issuer.to_string(), kid.to_string()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parse `{"keys": [{"issuer", "kid", "publicKeyPem"}]}`
    ///
    /// Every entry must parse; one corrupted key rejects the whole set.
    pub fn from_json(json: &str) -> Result<Self, CredentialError> {
        let doc: KeySetDocument = serde_json::from_str(json)
            .map_err(|e| CredentialError::InvalidKeySet(e.to_string()))?;
        Self::from_document(doc)
    }

    fn from_document(doc: KeySetDocument) -> Result<Self, CredentialError> {
        let mut set = Self::new();
        for entry in doc.keys {
            let key = VerifyingKey::from_public_key_pem(&entry.public_key_pem).map_err(|_| {
                CredentialError::InvalidKeySet(format!(
                    "key {} of issuer {} is not a P-256 public key",
                    entry.kid, entry.issuer
                ))
            })?;
            set.insert(entry.issuer, entry.kid, key);
        }
        Ok(set)
    }

    /// Load from a JSON file; failures are startup errors
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let doc: KeySetDocument = load_json(path)?;
        Self::from_document(doc).map_err(|e| ConfigError::Invalid(vec![e.to_string()]))
    }

    pub fn to_json(&self) -> Result<String, CredentialError> {
        let mut keys = Vec::with_capacity(self.keys.len());
        for ((issuer, kid), key) in &self.keys {
            let pem = key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| CredentialError::InvalidKeySet(e.to_string()))?;
            keys.push(KeySetEntry {
                issuer: issuer.clone(),
                kid: kid.clone(),
                public_key_pem: pem,
            });
        }
        keys.sort_by(|a, b| (&a.issuer, &a.kid).cmp(&(&b.issuer, &b.kid)));
        serde_json::to_string(&KeySetDocument { keys })
            .map_err(|e| CredentialError::InvalidKeySet(e.to_string()))
    }
}

/// Where issuer verification keys come from
pub trait IssuerKeySource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<IssuerKeySet, CredentialError>>;
}

/// Keys fixed at startup
#[derive(Debug, Clone)]
pub struct StaticIssuerKeys(pub IssuerKeySet);

impl IssuerKeySource for StaticIssuerKeys {
    fn fetch(&self) -> BoxFuture<'_, Result<IssuerKeySet, CredentialError>> {
        let keys = self.0.clone();
        Box::pin(async move { Ok(keys) })
    }
}

/// Keys published by the identity federation as a JSON key set
#[derive(Debug, Clone)]
pub struct HttpIssuerKeySource {
    http_client: reqwest::Client,
    url: String,
}

impl HttpIssuerKeySource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CredentialError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredentialError::KeySourceUnavailable(e.to_string()))?;
        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

impl IssuerKeySource for HttpIssuerKeySource {
    fn fetch(&self) -> BoxFuture<'_, Result<IssuerKeySet, CredentialError>> {
        Box::pin(async move {
            let response = self
                .http_client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| CredentialError::KeySourceUnavailable(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(CredentialError::KeySourceUnavailable(format!(
                    "HTTP {} from {}",
                    status, self.url
                )));
            }
            let body = response
                .text()
                .await
                .map_err(|e| CredentialError::KeySourceUnavailable(e.to_string()))?;
            IssuerKeySet::from_json(&body)
        })
    }
}

/// Floor between fetches triggered by an unknown key id
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

struct CachedKeys {
    fetched_at: Instant,
    keys: Arc<IssuerKeySet>,
}

/// TTL cache in front of an [`IssuerKeySource`]
///
/// Expired entries are never served: if a refresh on expiry fails the cache
/// reports the source as unavailable. A token naming a key id the cache does
/// not hold may trigger an early refresh, at most once per
/// `min_refresh_interval`; a failed early refresh keeps the current snapshot.
/// Fetches run outside the snapshot lock so readers are never blocked by one.
pub struct IssuerKeyCache {
    source: Arc<dyn IssuerKeySource>,
    ttl: Duration,
    fetch_timeout: Duration,
    retry: RetryConfig,
    min_refresh_interval: Duration,
    state: RwLock<Option<CachedKeys>>,
    /// Held for the duration of a fetch; records when the last one started
    last_fetch: Mutex<Option<Instant>>,
}

impl IssuerKeyCache {
    pub fn new(
        source: Arc<dyn IssuerKeySource>,
        ttl: Duration,
        fetch_timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            source,
            ttl,
            fetch_timeout,
            retry,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            state: RwLock::new(None),
            last_fetch: Mutex::new(None),
        }
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    async fn fresh(&self) -> Option<Arc<IssuerKeySet>> {
        let state = self.state.read().await;
        state
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.ttl)
            .map(|cached| cached.keys.clone())
    }

    pub async fn get(&self) -> Result<Arc<IssuerKeySet>, CredentialError> {
        if let Some(keys) = self.fresh().await {
            return Ok(keys);
        }
        let mut last_fetch = self.last_fetch.lock().await;
        // another caller may have refreshed while we waited
        if let Some(keys) = self.fresh().await {
            return Ok(keys);
        }
        *last_fetch = Some(Instant::now());
        match self.fetch().await {
            Ok(keys) => Ok(self.store(keys).await),
            Err(e) => {
                warn!(error = %e, "issuer key refresh failed");
                *self.state.write().await = None;
                Err(e)
            }
        }
    }

    /// Keys that should hold `(issuer, kid)`, refreshing early if rate allows
    ///
    /// The returned set may still lack the key; the caller decides what an
    /// unknown key means.
    pub async fn get_for(
        &self,
        issuer: &str,
        kid: &str,
    ) -> Result<Arc<IssuerKeySet>, CredentialError> {
        let keys = self.get().await?;
        if keys.get(issuer, kid).is_some() {
            return Ok(keys);
        }

        let mut last_fetch = self.last_fetch.lock().await;
        let current = self.fresh().await;
        if let Some(current) = &current {
            if current.get(issuer, kid).is_some() {
                return Ok(current.clone());
            }
            if last_fetch.is_some_and(|at| at.elapsed() < self.min_refresh_interval) {
                debug!(issuer, kid, "unknown key id; refresh suppressed");
                return Ok(current.clone());
            }
        }

        // the issuer may have rotated keys since the last fetch
        *last_fetch = Some(Instant::now());
        match self.fetch().await {
            Ok(keys) => Ok(self.store(keys).await),
            Err(e) if current.is_some() => {
                warn!(error = %e, "early issuer key refresh failed; keeping current keys");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "issuer key refresh failed");
                *self.state.write().await = None;
                Err(e)
            }
        }
    }

    /// Fetch now, regardless of age; a failure keeps the current snapshot
    pub async fn refresh(&self) -> Result<Arc<IssuerKeySet>, CredentialError> {
        let mut last_fetch = self.last_fetch.lock().await;
        *last_fetch = Some(Instant::now());
        let keys = self.fetch().await?;
        Ok(self.store(keys).await)
    }

    async fn fetch(&self) -> Result<IssuerKeySet, CredentialError> {
        with_backoff(&self.retry, "issuer keys", move || async move {
            match tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(CredentialError::KeySourceUnavailable(
                    "timed out fetching issuer keys".to_string(),
                )),
            }
        })
        .await
    }

    async fn store(&self, keys: IssuerKeySet) -> Arc<IssuerKeySet> {
        debug!(keys = keys.len(), "issuer keys refreshed");
        let keys = Arc::new(keys);
        *self.state.write().await = Some(CachedKeys {
            fetched_at: Instant::now(),
            keys: keys.clone(),
        });
        keys
    }
}

/// Verifies bearer credentials and extracts normalized attributes
pub struct CredentialVerifier {
    keys: IssuerKeyCache,
    config: CredentialConfig,
}

impl CredentialVerifier {
    pub fn new(keys: IssuerKeyCache, config: CredentialConfig) -> Self {
        Self { keys, config }
    }

    /// Verifier over a fixed key set, with no fetch delays
    pub fn with_static_keys(keys: IssuerKeySet, config: CredentialConfig) -> Self {
        let cache = IssuerKeyCache::new(
            Arc::new(StaticIssuerKeys(keys)),
            Duration::from_secs(u32::MAX as u64),
            Duration::from_secs(1),
            RetryConfig::default(),
        );
        Self::new(cache, config)
    }

    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    pub async fn verify(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<SubjectAttributes, CredentialError> {
        let claims = self.verify_claims(token, now).await?;
        claims.to_attributes()
    }

    /// Signature, issuer and freshness checks
    pub async fn verify_claims(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<CredentialClaims, CredentialError> {
        let jws = UnverifiedJws::parse(token)?;
        let kid = jws
            .header
            .kid
            .clone()
            .ok_or(CredentialError::MissingKeyId)?;
        let unverified: CredentialClaims = jws.peek_claims()?;
        let issuer = unverified.iss;
        if !self.config.accepted_issuers.is_empty() && !self.config.accepted_issuers.contains(&issuer)
        {
            return Err(CredentialError::UntrustedIssuer(issuer));
        }

        let keys = self.keys.get_for(&issuer, &kid).await?;
        let key = keys
            .get(&issuer, &kid)
            .ok_or_else(|| CredentialError::UnknownKey {
                issuer: issuer.clone(),
                kid: kid.clone(),
            })?;
        let claims: CredentialClaims = jws.verify(key)?;

        let skew = self.config.max_clock_skew_secs as i64;
        let now = now.timestamp();
        if now > claims.exp.saturating_add(skew) {
            return Err(CredentialError::Expired);
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now.saturating_add(skew) {
                return Err(CredentialError::NotYetValid);
            }
        }
        if let Some(iat) = claims.iat {
            if iat > now.saturating_add(skew) {
                return Err(CredentialError::NotYetValid);
            }
        }
        Ok(claims)
    }
}
