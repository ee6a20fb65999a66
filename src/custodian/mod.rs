//! Key custodian: independent, second-opinion key release
//!
//! # Release sequence
//!
//! 1. Per-caller rate limit
//! 2. Verify the bearer credential (signature, issuer, freshness)
//! 3. Normalize attributes
//! 4. Fetch the current object from the authoritative directory
//! 5. Verify integrity bindings and that the presented wrapped key is the
//!    one this custodian issued
//! 6. Decide with the same engine local enforcement uses
//! 7. On allow, unwrap, check the keyed policy binding and optionally rewrap
//!    to the client's session key
//! 8. Audit, always; an unaudited grant is withdrawn
//!
//! Every failure to reach a dependency denies.

mod cache;
mod directory;
mod rate_limit;
mod types;

pub use cache::TtlCache;
pub use directory::{ArchiveDirectory, DirectoryError, InMemoryDirectory, ResourceDirectory};
pub use rate_limit::RateLimiter;
pub use types::{DenialCode, ReleaseRequest, ReleaseResponse};

use crate::attributes::SubjectAttributes;
use crate::audit::{AuditEvent, AuditEventType, AuditOutcome, AuditSink};
use crate::config::{CustodianConfig, RetryConfig, TimeoutConfig};
use crate::credential::CredentialVerifier;
use crate::crypto::AesKey;
use crate::codec::{IntegrityFailure, IntegrityReport};
use crate::integrity;
use crate::kem::{parse_public_key, EcdhKem, KeyEncapsulation};
use crate::keyring::CustodianKeyring;
use crate::manifest::{KeyAccessObject, PolicySection, ProtectedObject};
use crate::pdp::{
    DecisionContext, DecisionEngine, DenyReason, DeploymentRules, Obligation, RuleSetVersion,
};
use crate::retry::with_backoff;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Clone, PartialEq, Eq, Hash)]
struct KeyCacheKey {
    resource_id: String,
    kao_id: String,
    subject: String,
    policy_hash: String,
}

/// What a release produced before auditing
struct Outcome {
    subject_id: String,
    denial: Option<DenialCode>,
    reasons: Vec<DenyReason>,
    obligations: Vec<Obligation>,
    key: Option<Vec<u8>>,
    wrapped_key: Option<Vec<u8>>,
    detail: Option<String>,
    divergence: bool,
}

impl Outcome {
    fn deny(subject_id: impl Into<String>, code: DenialCode) -> Self {
        Self {
            subject_id: subject_id.into(),
            denial: Some(code),
            reasons: Vec::new(),
            obligations: Vec::new(),
            key: None,
            wrapped_key: None,
            detail: None,
            divergence: false,
        }
    }

    fn with_reasons(mut self, reasons: Vec<DenyReason>) -> Self {
        self.reasons = reasons;
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One deployment's key custodian
pub struct KeyCustodian {
    custodian_id: String,
    engine: Arc<DecisionEngine>,
    keyring: CustodianKeyring,
    verifier: CredentialVerifier,
    directory: Arc<dyn ResourceDirectory>,
    audit: Arc<dyn AuditSink>,
    key_cache: TtlCache<KeyCacheKey, AesKey>,
    rate_limiter: RateLimiter,
    timeouts: TimeoutConfig,
    retry: RetryConfig,
}

impl KeyCustodian {
    pub fn new(
        config: &CustodianConfig,
        keyring: CustodianKeyring,
        verifier: CredentialVerifier,
        directory: Arc<dyn ResourceDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let mut engine = DecisionEngine::new(config.engine.clone());
        if let Some(rules) = &config.deployment_rules {
            engine = engine.with_deployment_module(Box::new(DeploymentRules::new(rules.clone())));
        }
        Self {
            custodian_id: config.custodian_id.clone(),
            engine: Arc::new(engine),
            keyring,
            verifier,
            directory,
            audit,
            key_cache: TtlCache::new(
                std::time::Duration::from_secs(config.cache.key_ttl_secs),
                config.cache.key_capacity,
            ),
            rate_limiter: RateLimiter::new(config.rate_limit.clone()),
            timeouts: config.timeouts.clone(),
            retry: config.retry.clone(),
        }
    }

    pub fn custodian_id(&self) -> &str {
        &self.custodian_id
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn keyring(&self) -> &CustodianKeyring {
        &self.keyring
    }

    pub fn rule_set_version(&self) -> RuleSetVersion {
        self.engine.rule_set_version()
    }

    /// Forget cached keys for a resource, e.g. after a policy update
    pub fn invalidate_resource(&self, resource_id: &str) {
        self.key_cache.retain(|k| k.resource_id != resource_id);
        debug!(resource_id, "key cache invalidated");
    }

    /// Current policy of a resource, without any key material
    pub async fn current_policy(&self, resource_id: &str) -> Result<PolicySection, DirectoryError> {
        Ok(self.fetch_object(resource_id).await?.policy.clone())
    }

    pub async fn release(&self, request: ReleaseRequest) -> ReleaseResponse {
        self.release_at(request, Utc::now()).await
    }

    /// Release with an explicit decision time
    pub async fn release_at(&self, request: ReleaseRequest, now: DateTime<Utc>) -> ReleaseResponse {
        let span = info_span!(
            "release",
            correlation_id = %request.correlation_id,
            resource_id = %request.resource_id,
        );
        async move {
            let started = Instant::now();
            let mut outcome = self.evaluate(&request, now).await;
            let rule_set_version = self.rule_set_version().0;

            let event = AuditEvent {
                event_type: AuditEventType::KeyRelease,
                timestamp: now,
                correlation_id: request.correlation_id.clone(),
                custodian_id: self.custodian_id.clone(),
                subject_id: outcome.subject_id.clone(),
                resource_id: request.resource_id.clone(),
                kao_id: Some(request.kao_id.clone()),
                action: request.action,
                outcome: if outcome.denial.is_none() {
                    AuditOutcome::Granted
                } else {
                    AuditOutcome::Denied
                },
                denial: outcome.denial.map(|d| d.as_str().to_string()),
                reasons: outcome.reasons.clone(),
                detail: outcome.detail.clone(),
                latency_ms: started.elapsed().as_millis() as u64,
                divergence: outcome.divergence,
                caller: request.caller.clone(),
                rule_set_version: rule_set_version.clone(),
            };
            let divergence = outcome.divergence.then(|| event.as_divergence());

            if let Err(e) = self.audit.record(event).await {
                if outcome.denial.is_none() {
                    error!(error = %e, "audit unavailable; withdrawing grant");
                    outcome = Outcome::deny(outcome.subject_id, DenialCode::UpstreamUnavailable)
                        .with_detail("audit unavailable");
                } else {
                    error!(error = %e, "audit unavailable for denial");
                }
            }
            if let Some(event) = divergence {
                if let Err(e) = self.audit.record(event).await {
                    error!(error = %e, "divergence event not recorded");
                }
            }

            match outcome.denial {
                None => info!(subject = %outcome.subject_id, "key released"),
                Some(code) => info!(subject = %outcome.subject_id, denial = %code, "release denied"),
            }

            ReleaseResponse {
                correlation_id: request.correlation_id.clone(),
                granted: outcome.denial.is_none(),
                key: outcome.key.take(),
                wrapped_key: outcome.wrapped_key.take(),
                denial: outcome.denial,
                reasons: std::mem::take(&mut outcome.reasons),
                obligations: std::mem::take(&mut outcome.obligations),
                custodian_id: self.custodian_id.clone(),
                rule_set_version,
            }
        }
        .instrument(span)
        .await
    }

    async fn evaluate(&self, request: &ReleaseRequest, now: DateTime<Utc>) -> Outcome {
        let caller = request.caller.as_deref().unwrap_or("anonymous");
        if !self.rate_limiter.check(caller) {
            warn!(caller, "rate limited");
            return Outcome::deny("", DenialCode::RateLimited);
        }

        let client_key = match request.client_public_key.as_deref().map(parse_public_key) {
            None => None,
            Some(Ok(key)) => Some(key),
            Some(Err(_)) => {
                return Outcome::deny("", DenialCode::InvalidRequest)
                    .with_detail("client public key is not a P-256 point")
            }
        };

        let subject = match self
            .verifier
            .verify(&request.bearer_credential, now)
            .await
        {
            Ok(subject) => subject,
            Err(e) if e.is_unavailable() => {
                warn!(error = %e, "credential verification material unavailable");
                return Outcome::deny("", DenialCode::UpstreamUnavailable)
                    .with_detail(e.error_code());
            }
            Err(e) => {
                debug!(error = %e, "credential rejected");
                return Outcome::deny("", DenialCode::AuthenticationInvalid)
                    .with_detail(e.error_code());
            }
        };

        let object = match self.fetch_object(&request.resource_id).await {
            Ok(object) => object,
            Err(DirectoryError::NotFound(_)) => {
                return Outcome::deny(&subject.unique_id, DenialCode::AccessDenied)
            }
            Err(DirectoryError::Corrupt(detail)) => {
                error!(detail = %detail, "stored object unreadable");
                return Outcome::deny(&subject.unique_id, DenialCode::IntegrityViolation)
                    .with_reasons(vec![DenyReason::IntegrityViolation])
                    .with_detail(detail);
            }
            Err(e) => {
                warn!(error = %e, "policy source unavailable");
                return Outcome::deny(&subject.unique_id, DenialCode::UpstreamUnavailable)
                    .with_detail(e.error_code());
            }
        };

        let kao = match object.kao(&request.kao_id) {
            Some(kao) => kao,
            None => return Outcome::deny(&subject.unique_id, DenialCode::AccessDenied),
        };
        if kao.custodian.custodian_id != self.custodian_id {
            return Outcome::deny(&subject.unique_id, DenialCode::NotCustodian);
        }

        let mut report = if object.has_payload() {
            object.verify()
        } else {
            object.verify_bindings()
        };
        let presented_matches: bool = kao
            .wrapped_key
            .as_slice()
            .ct_eq(request.wrapped_key.as_slice())
            .into();
        if !presented_matches {
            warn!(kao_id = %kao.id, "presented wrapped key differs from the custodian's record");
            report
                .failures
                .push(IntegrityFailure::KeyAccessBinding {
                    kao_id: kao.id.clone(),
                });
        }

        let context = DecisionContext::new(now, report.status());
        let decision = self
            .engine
            .decide(&subject, &object.policy.label, request.action, context);

        if !decision.allow {
            return self.denial(&subject, request, decision.reasons, &report);
        }

        match self.release_key(&object, kao, &subject, client_key.as_ref()) {
            Ok((key, wrapped_key)) => Outcome {
                subject_id: subject.unique_id.clone(),
                denial: None,
                reasons: Vec::new(),
                obligations: decision.obligations,
                key,
                wrapped_key,
                detail: None,
                divergence: false,
            },
            Err(detail) => {
                error!(kao_id = %kao.id, detail = %detail, "key material failed verification");
                let mut outcome = Outcome::deny(&subject.unique_id, DenialCode::IntegrityViolation)
                    .with_reasons(vec![DenyReason::IntegrityViolation])
                    .with_detail(detail);
                outcome.divergence = request.caller_allowed == Some(true);
                outcome
            }
        }
    }

    fn denial(
        &self,
        subject: &SubjectAttributes,
        request: &ReleaseRequest,
        reasons: Vec<DenyReason>,
        report: &IntegrityReport,
    ) -> Outcome {
        let integrity = reasons
            .iter()
            .any(|r| matches!(r, DenyReason::IntegrityViolation));
        let divergence = request.caller_allowed == Some(true);
        let code = if integrity {
            error!(report = %report, "integrity violation");
            DenialCode::IntegrityViolation
        } else if divergence {
            warn!(reasons = ?reasons.iter().map(DenyReason::code).collect::<Vec<_>>(), "caller allowed; custodian denies");
            DenialCode::DivergenceDetected
        } else {
            DenialCode::PolicyViolation
        };
        let mut outcome = Outcome::deny(&subject.unique_id, code).with_reasons(reasons);
        if integrity {
            outcome.detail = Some(report.to_string());
        }
        outcome.divergence = divergence;
        outcome
    }

    async fn fetch_object(&self, resource_id: &str) -> Result<Arc<ProtectedObject>, DirectoryError> {
        let timeout = self.timeouts.policy_fetch();
        with_backoff(&self.retry, "policy fetch", move || async move {
            match tokio::time::timeout(timeout, self.directory.fetch(resource_id)).await {
                Ok(result) => result,
                Err(_) => Err(DirectoryError::Unavailable(format!(
                    "no answer within {:?}",
                    timeout
                ))),
            }
        })
        .await
    }

    /// Unwrap (or reuse) the key share and check its policy binding
    #[allow(clippy::type_complexity)]
    fn release_key(
        &self,
        object: &ProtectedObject,
        kao: &KeyAccessObject,
        subject: &SubjectAttributes,
        client_key: Option<&p256::PublicKey>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), String> {
        let cache_key = KeyCacheKey {
            resource_id: object.resource_id().to_string(),
            kao_id: kao.id.clone(),
            subject: subject.unique_id.clone(),
            policy_hash: object.policy.hash.clone(),
        };
        let share = match self.key_cache.get(&cache_key) {
            Some(share) => share,
            None => {
                let share = self
                    .keyring
                    .unwrap(kao.algorithm, &kao.wrapped_key)
                    .map_err(|e| e.to_string())?;
                integrity::verify_policy_binding(&share, &kao.policy_digest, &kao.policy_binding)
                    .map_err(|e| e.to_string())?;
                self.key_cache.insert(cache_key, share.clone());
                share
            }
        };

        match client_key {
            None => Ok((Some(share.as_slice().to_vec()), None)),
            Some(public) => {
                let wrapped = EcdhKem::for_session()
                    .wrap(share.as_slice(), public)
                    .map_err(|e| e.to_string())?;
                Ok((None, Some(wrapped)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clearance::Clearance;
    use crate::config::{CredentialConfig, RateLimitConfig};
    use crate::credential::{CredentialClaims, CredentialIssuer, IssuerKeySet};
    use crate::kem::WrapAlgorithm;
    use crate::manifest::CustodianRef;
    use crate::policy::PolicyBuilder;
    use p256::SecretKey;
    use rand::rngs::OsRng;
    use serde_json::json;

    struct Fixture {
        custodian: KeyCustodian,
        issuer: CredentialIssuer,
        directory: Arc<InMemoryDirectory>,
        audit: MemoryAuditSink,
        object: ProtectedObject,
    }

    fn fixture(config: CustodianConfig) -> Fixture {
        let issuer = CredentialIssuer::generate("https://idp.usa.example", "k1");
        let keys = IssuerKeySet::new().with_key(issuer.issuer(), issuer.kid(), issuer.verifying_key());
        let verifier = CredentialVerifier::with_static_keys(keys, CredentialConfig::default());
        let keyring = CustodianKeyring::generate();
        let label = PolicyBuilder::new(Clearance::Secret)
            .releasable_to(["USA", "GBR"])
            .originating_authority("USA")
            .build()
            .unwrap();
        let object = ProtectedObject::builder(label)
            .object_id("doc-1")
            .custodian(
                CustodianRef::new(config.custodian_id.clone(), "https://usa.example"),
                keyring.wrapping_key(WrapAlgorithm::EcdhEsA256Gcm).unwrap(),
            )
            .build(b"mission plan")
            .unwrap();
        let directory = Arc::new(InMemoryDirectory::new());
        directory.insert(object.clone());
        let audit = MemoryAuditSink::new();
        let custodian = KeyCustodian::new(
            &config,
            keyring,
            verifier,
            directory.clone(),
            Arc::new(audit.clone()),
        );
        Fixture {
            custodian,
            issuer,
            directory,
            audit,
            object,
        }
    }

    fn config() -> CustodianConfig {
        CustodianConfig {
            custodian_id: "usa".to_string(),
            ..CustodianConfig::default()
        }
    }

    fn token(f: &Fixture, clearance: &str, country: &str) -> String {
        let now = Utc::now().timestamp();
        f.issuer
            .sign(&CredentialClaims {
                iss: String::new(),
                sub: "john.doe".to_string(),
                unique_id: None,
                exp: now + 300,
                iat: Some(now),
                nbf: None,
                clearance: clearance.to_string(),
                clearance_country: None,
                country_of_affiliation: country.to_string(),
                acp_coi: Vec::new(),
                acr: Some(json!("aal2")),
                amr: vec!["pwd".to_string(), "otp".to_string()],
                auth_time: Some(now),
            })
            .unwrap()
    }

    fn request(f: &Fixture, token: String) -> ReleaseRequest {
        let kao = &f.object.payload.key_access[0];
        ReleaseRequest::new("doc-1", kao.id.clone(), kao.wrapped_key.clone(), token, "corr-1")
    }

    #[tokio::test]
    async fn test_grant_releases_key_that_decrypts() {
        let f = fixture(config());
        let response = f
            .custodian
            .release(request(&f, token(&f, "SECRET", "USA")))
            .await;
        assert!(response.granted, "{:?}", response);
        assert_eq!(response.correlation_id, "corr-1");
        let key = response.key().unwrap().unwrap();
        assert_eq!(f.object.decrypt(&key).unwrap(), b"mission plan");
        assert!(response
            .obligations
            .contains(&Obligation::AuditAccess));

        let events = f.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Granted);
        assert_eq!(events[0].subject_id, "john.doe");
    }

    #[tokio::test]
    async fn test_policy_denial_never_returns_key() {
        let f = fixture(config());
        let response = f
            .custodian
            .release(request(&f, token(&f, "CONFIDENTIAL", "USA")))
            .await;
        assert!(!response.granted);
        assert!(response.key.is_none());
        assert_eq!(response.denial, Some(DenialCode::PolicyViolation));
        assert_eq!(response.reasons[0].code(), "InsufficientClearance");
        assert_eq!(f.audit.events()[0].outcome, AuditOutcome::Denied);
    }

    #[tokio::test]
    async fn test_bad_credential_is_authentication_invalid() {
        let f = fixture(config());
        let rogue = CredentialIssuer::generate("https://idp.usa.example", "k1");
        let now = Utc::now().timestamp();
        let forged = rogue
            .sign(&CredentialClaims {
                iss: String::new(),
                sub: "mallory".into(),
                unique_id: None,
                exp: now + 300,
                iat: Some(now),
                nbf: None,
                clearance: "TOP_SECRET".into(),
                clearance_country: None,
                country_of_affiliation: "USA".into(),
                acp_coi: Vec::new(),
                acr: Some(json!(2)),
                amr: vec!["hwk".into(), "pwd".into()],
                auth_time: Some(now),
            })
            .unwrap();
        let response = f.custodian.release(request(&f, forged)).await;
        assert_eq!(response.denial, Some(DenialCode::AuthenticationInvalid));
        assert!(f.audit.events()[0].subject_id.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_resource_and_kao_are_generic() {
        let f = fixture(config());
        let mut req = request(&f, token(&f, "SECRET", "USA"));
        req.resource_id = "doc-404".into();
        assert_eq!(
            f.custodian.release(req).await.denial,
            Some(DenialCode::AccessDenied)
        );
        let mut req = request(&f, token(&f, "SECRET", "USA"));
        req.kao_id = "kao-9".into();
        assert_eq!(
            f.custodian.release(req).await.denial,
            Some(DenialCode::AccessDenied)
        );
    }

    #[tokio::test]
    async fn test_tampered_stored_policy_is_integrity_violation() {
        let f = fixture(config());
        let mut tampered = f.object.clone();
        tampered.policy.label.classification = Clearance::Unclassified;
        f.directory.insert(tampered);
        let response = f
            .custodian
            .release(request(&f, token(&f, "SECRET", "USA")))
            .await;
        assert_eq!(response.denial, Some(DenialCode::IntegrityViolation));
        assert_eq!(response.reasons, vec![DenyReason::IntegrityViolation]);
    }

    #[tokio::test]
    async fn test_substituted_wrapped_key_is_rejected() {
        let f = fixture(config());
        let mut req = request(&f, token(&f, "SECRET", "USA"));
        req.wrapped_key[40] ^= 1;
        let response = f.custodian.release(req).await;
        assert_eq!(response.denial, Some(DenialCode::IntegrityViolation));
    }

    #[tokio::test]
    async fn test_divergence_is_recorded_separately() {
        let f = fixture(config());
        let req = request(&f, token(&f, "SECRET", "FRA")).with_caller_allowed(true);
        let response = f.custodian.release(req).await;
        assert_eq!(response.denial, Some(DenialCode::DivergenceDetected));
        let events = f.audit.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, AuditEventType::DivergenceDetected);
        assert!(events[1].divergence);
    }

    #[tokio::test]
    async fn test_session_rewrap() {
        let f = fixture(config());
        let client = SecretKey::random(&mut OsRng);
        let req = request(&f, token(&f, "SECRET", "GBR"))
            .with_client_public_key(crate::kem::public_key_bytes(&client.public_key()));
        let response = f.custodian.release(req).await;
        assert!(response.granted);
        assert!(response.key.is_none());
        let wrapped = response.wrapped_key.clone().unwrap();
        let share = EcdhKem::for_session().unwrap(&wrapped, &client).unwrap();
        let dek = AesKey::from_slice(&share).unwrap();
        assert_eq!(f.object.decrypt(&dek).unwrap(), b"mission plan");

        let bad = request(&f, token(&f, "SECRET", "GBR")).with_client_public_key(vec![1, 2, 3]);
        assert_eq!(
            f.custodian.release(bad).await.denial,
            Some(DenialCode::InvalidRequest)
        );
    }

    #[tokio::test]
    async fn test_policy_update_is_honoured_immediately() {
        let f = fixture(config());
        let req = || request(&f, token(&f, "SECRET", "USA"));
        assert!(f.custodian.release(req()).await.granted);

        let stricter = PolicyBuilder::new(Clearance::TopSecret)
            .originating_authority("USA")
            .build()
            .unwrap();
        f.directory.update_policy("doc-1", stricter).unwrap();
        f.custodian.invalidate_resource("doc-1");
        let response = f.custodian.release(req()).await;
        assert_eq!(response.denial, Some(DenialCode::PolicyViolation));
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let mut cfg = config();
        cfg.rate_limit = RateLimitConfig {
            burst: 1,
            refill_per_sec: 0.0,
        };
        let f = fixture(cfg);
        let req = || request(&f, token(&f, "SECRET", "USA")).with_caller("peer-a");
        assert!(f.custodian.release(req()).await.granted);
        assert_eq!(
            f.custodian.release(req()).await.denial,
            Some(DenialCode::RateLimited)
        );
    }

    #[tokio::test]
    async fn test_kao_for_other_custodian() {
        let f = fixture(CustodianConfig {
            custodian_id: "gbr".to_string(),
            ..CustodianConfig::default()
        });
        // the fixture wraps for the configured id; relabel the stored copy
        let mut other = f.object.clone();
        other.payload.key_access[0].custodian.custodian_id = "usa".into();
        f.directory.insert(other);
        let response = f
            .custodian
            .release(request(&f, token(&f, "SECRET", "USA")))
            .await;
        assert_eq!(response.denial, Some(DenialCode::NotCustodian));
    }
}
