//! Enforcement point: the caller side of a key release
//!
//! The enforcement point decides locally first, with the current policy
//! from the authoritative custodian when it can get it. Only on a local
//! allow does it ask each custodian for its key material, and every
//! custodian decides again on its own. Released keys always travel wrapped
//! to a per-call session key.

use crate::attributes::SubjectAttributes;
use crate::codec::CodecError;
use crate::credential::{CredentialError, CredentialVerifier};
use crate::crypto::{AesKey, EncryptionError};
use crate::custodian::{DenialCode, ReleaseRequest, ReleaseResponse, TtlCache};
use crate::federation::FederationRouter;
use crate::kem::{public_key_bytes, EcdhKem, KemError, KeyEncapsulation};
use crate::manifest::{KeyReleaseMode, PolicySection, ProtectedObject};
use crate::pdp::{Action, Decision, DecisionContext, DecisionEngine, DenyReason, Obligation};
use chrono::{DateTime, Utc};
use p256::SecretKey;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum PepError {
    #[error("Credential rejected: {0}")]
    Authentication(#[from] CredentialError),

    #[error("Access denied: {}", codes(.reasons))]
    Denied { reasons: Vec<DenyReason> },

    #[error("Custodian {custodian_id} denied release: {denial}")]
    ReleaseDenied {
        custodian_id: String,
        denial: DenialCode,
        reasons: Vec<DenyReason>,
    },

    #[error("Object has no key access objects")]
    NoKeyAccess,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("KEM error: {0}")]
    Kem(#[from] KemError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}

fn codes(reasons: &[DenyReason]) -> String {
    reasons
        .iter()
        .map(DenyReason::code)
        .collect::<Vec<_>>()
        .join(", ")
}

impl PepError {
    pub fn error_code(&self) -> &'static str {
        match self {
            PepError::Authentication(e) => e.error_code(),
            PepError::Denied { .. } => "CTDF_E_PEP_DENIED",
            PepError::ReleaseDenied { .. } => "CTDF_E_PEP_RELEASE_DENIED",
            PepError::NoKeyAccess => "CTDF_E_PEP_NO_KEY_ACCESS",
            PepError::Codec(e) => e.error_code(),
            PepError::Kem(e) => e.error_code(),
            PepError::Encryption(e) => e.error_code(),
        }
    }
}

/// Plaintext of an opened object and the duties that came with it
pub struct OpenedObject {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub obligations: Vec<Obligation>,
    pub correlation_id: String,
}

pub struct EnforcementPoint {
    engine: Arc<DecisionEngine>,
    verifier: Arc<CredentialVerifier>,
    router: Arc<FederationRouter>,
    policies: TtlCache<String, PolicySection>,
}

impl EnforcementPoint {
    pub fn new(
        engine: Arc<DecisionEngine>,
        verifier: Arc<CredentialVerifier>,
        router: Arc<FederationRouter>,
        policy_ttl: Duration,
    ) -> Self {
        Self {
            engine,
            verifier,
            router,
            policies: TtlCache::new(policy_ttl, 1024),
        }
    }

    /// Forget the cached policy of a resource
    pub fn invalidate(&self, resource_id: &str) {
        self.policies.retain(|id| id != resource_id);
    }

    /// Current policy: cached, else from the first custodian, else the object's own copy
    pub async fn current_policy(&self, object: &ProtectedObject) -> PolicySection {
        let resource_id = object.resource_id();
        if let Some(policy) = self.policies.get(&resource_id.to_string()) {
            return policy;
        }
        let authority = object.custodian_ids().next().map(str::to_string);
        if let Some(custodian_id) = authority {
            match self.router.current_policy(&custodian_id, resource_id).await {
                Ok(policy) => {
                    self.policies.insert(resource_id.to_string(), policy.clone());
                    return policy;
                }
                Err(e) => {
                    warn!(resource_id, error = %e, "current policy unavailable; using embedded copy")
                }
            }
        }
        object.policy.clone()
    }

    /// Local decision for `subject`
    pub async fn decide(
        &self,
        subject: &SubjectAttributes,
        object: &ProtectedObject,
        action: Action,
        now: DateTime<Utc>,
    ) -> Decision {
        let policy = self.current_policy(object).await;
        let context = DecisionContext::new(now, object.integrity_status());
        self.engine.decide(subject, &policy.label, action, context)
    }

    /// Verify the credential and decide locally
    pub async fn authorize(
        &self,
        credential: &str,
        object: &ProtectedObject,
        action: Action,
        now: DateTime<Utc>,
    ) -> Result<(SubjectAttributes, Decision), PepError> {
        let subject = self.verifier.verify(credential, now).await?;
        let decision = self.decide(&subject, object, action, now).await;
        Ok((subject, decision))
    }

    /// Decide, obtain key material from the custodians and decrypt
    pub async fn open(
        &self,
        credential: &str,
        object: &ProtectedObject,
        now: DateTime<Utc>,
    ) -> Result<OpenedObject, PepError> {
        let (subject, decision) = self
            .authorize(credential, object, Action::Decrypt, now)
            .await?;
        if !decision.allow {
            info!(
                subject = %subject.unique_id,
                resource_id = object.resource_id(),
                reasons = ?decision.reason_codes(),
                "local decision denies"
            );
            return Err(PepError::Denied {
                reasons: decision.reasons,
            });
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let shares = self.collect_shares(credential, object, &correlation_id).await?;
        let dek = object.assemble_key(&shares)?;
        let plaintext = Zeroizing::new(object.decrypt(&dek)?);
        debug!(resource_id = object.resource_id(), %correlation_id, "object opened");
        Ok(OpenedObject {
            plaintext,
            obligations: decision.obligations,
            correlation_id,
        })
    }

    async fn collect_shares(
        &self,
        credential: &str,
        object: &ProtectedObject,
        correlation_id: &str,
    ) -> Result<Vec<AesKey>, PepError> {
        let session = SecretKey::random(&mut OsRng);
        let session_public = public_key_bytes(&session.public_key());
        let mut shares = Vec::new();
        let mut last_denial = None;

        for kao in &object.payload.key_access {
            let request = ReleaseRequest::new(
                object.resource_id(),
                kao.id.clone(),
                kao.wrapped_key.clone(),
                credential,
                correlation_id,
            )
            .with_action(Action::Decrypt)
            .with_caller_allowed(true)
            .with_client_public_key(session_public.clone());

            let response = self
                .router
                .forward(&kao.custodian.custodian_id, request)
                .await;
            match released_share(&response, &session) {
                Ok(Some(share)) => {
                    shares.push(share);
                    if object.payload.key_release == KeyReleaseMode::AnyOf {
                        break;
                    }
                }
                Ok(None) => {
                    let denial = PepError::ReleaseDenied {
                        custodian_id: kao.custodian.custodian_id.clone(),
                        denial: response.denial.unwrap_or(DenialCode::AccessDenied),
                        reasons: response.reasons.clone(),
                    };
                    if object.payload.key_release == KeyReleaseMode::AllOf {
                        return Err(denial);
                    }
                    last_denial = Some(denial);
                }
                Err(e) => return Err(e),
            }
        }

        if shares.is_empty() {
            return Err(last_denial.unwrap_or(PepError::NoKeyAccess));
        }
        Ok(shares)
    }
}

fn released_share(
    response: &ReleaseResponse,
    session: &SecretKey,
) -> Result<Option<AesKey>, PepError> {
    if !response.granted {
        return Ok(None);
    }
    match (&response.wrapped_key, response.key()?) {
        (Some(wrapped), _) => {
            let share = Zeroizing::new(EcdhKem::for_session().unwrap(wrapped, session)?);
            Ok(Some(AesKey::from_slice(&share)?))
        }
        (None, Some(key)) => Ok(Some(key)),
        (None, None) => Ok(None),
    }
}
