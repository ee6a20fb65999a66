mod common;

use chrono::{Duration as ChronoDuration, Utc};
use coalition_tdf::audit::{AuditError, AuditEvent, AuditOutcome, AuditSink, MemoryAuditSink};
use coalition_tdf::config::{CredentialConfig, CustodianConfig, RetryConfig, TimeoutConfig};
use coalition_tdf::credential::{
    CredentialError, CredentialVerifier, IssuerKeyCache, IssuerKeySet, IssuerKeySource,
};
use coalition_tdf::custodian::{
    DenialCode, DirectoryError, KeyCustodian, ReleaseRequest, ResourceDirectory,
};
use coalition_tdf::kem::WrapAlgorithm;
use coalition_tdf::keyring::CustodianKeyring;
use coalition_tdf::manifest::{CustodianRef, ProtectedObject};
use common::*;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> CustodianConfig {
    CustodianConfig {
        custodian_id: "usa".to_string(),
        timeouts: TimeoutConfig {
            policy_fetch_ms: 50,
            issuer_key_fetch_ms: 50,
            ..TimeoutConfig::default()
        },
        retry: RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..CustodianConfig::default()
    }
}

/// Directory whose backend is down
#[derive(Default)]
struct DownDirectory {
    calls: AtomicUsize,
}

impl ResourceDirectory for DownDirectory {
    fn fetch<'a>(
        &'a self,
        _resource_id: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ProtectedObject>, DirectoryError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(DirectoryError::Unavailable("connection refused".to_string())) })
    }
}

/// Directory that never answers
struct HangingDirectory;

impl ResourceDirectory for HangingDirectory {
    fn fetch<'a>(
        &'a self,
        _resource_id: &'a str,
    ) -> BoxFuture<'a, Result<Arc<ProtectedObject>, DirectoryError>> {
        Box::pin(futures::future::pending())
    }
}

struct DownKeySource;

impl IssuerKeySource for DownKeySource {
    fn fetch(&self) -> BoxFuture<'_, Result<IssuerKeySet, CredentialError>> {
        Box::pin(async {
            Err(CredentialError::KeySourceUnavailable(
                "issuer endpoint returned 503".to_string(),
            ))
        })
    }
}

struct ClosedAudit;

impl AuditSink for ClosedAudit {
    fn record(&self, _event: AuditEvent) -> BoxFuture<'_, Result<(), AuditError>> {
        Box::pin(async { Err(AuditError::Closed) })
    }
}

fn request(credential: String) -> ReleaseRequest {
    ReleaseRequest::new("doc-1", "kao-0", vec![0u8; 40], credential, "corr-1")
}

#[tokio::test]
async fn test_directory_unavailable_fails_closed_after_retries() {
    let issuer = issuer();
    let directory = Arc::new(DownDirectory::default());
    let audit = MemoryAuditSink::new();
    let custodian = KeyCustodian::new(
        &fast_config(),
        CustodianKeyring::generate(),
        verifier(&issuer),
        directory.clone(),
        Arc::new(audit.clone()),
    );

    let response = custodian
        .release(request(token(&issuer, "SECRET", "USA", &["FVEY"])))
        .await;

    assert!(!response.granted);
    assert_eq!(response.denial, Some(DenialCode::UpstreamUnavailable));
    assert_eq!(directory.calls.load(Ordering::SeqCst), 2);

    let events = audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, AuditOutcome::Denied);
    assert_eq!(events[0].denial.as_deref(), Some("upstreamUnavailable"));
    assert_eq!(events[0].subject_id, "jane.analyst");
}

#[tokio::test]
async fn test_directory_timeout_fails_closed() {
    let issuer = issuer();
    let custodian = KeyCustodian::new(
        &fast_config(),
        CustodianKeyring::generate(),
        verifier(&issuer),
        Arc::new(HangingDirectory),
        Arc::new(MemoryAuditSink::new()),
    );

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        custodian.release(request(token(&issuer, "SECRET", "USA", &["FVEY"]))),
    )
    .await
    .expect("custodian answers despite a hung directory");

    assert!(!response.granted);
    assert_eq!(response.denial, Some(DenialCode::UpstreamUnavailable));
    assert!(response.key.is_none());
}

#[tokio::test]
async fn test_issuer_keys_unavailable_fails_closed() {
    let issuer = issuer();
    let config = fast_config();
    let keys = IssuerKeyCache::new(
        Arc::new(DownKeySource),
        Duration::from_secs(300),
        Duration::from_millis(50),
        config.retry.clone(),
    );
    let directory = Arc::new(coalition_tdf::custodian::InMemoryDirectory::new());
    let custodian = KeyCustodian::new(
        &config,
        CustodianKeyring::generate(),
        CredentialVerifier::new(keys, CredentialConfig::default()),
        directory,
        Arc::new(MemoryAuditSink::new()),
    );

    let response = custodian
        .release(request(token(&issuer, "SECRET", "USA", &["FVEY"])))
        .await;

    assert!(!response.granted);
    assert_eq!(response.denial, Some(DenialCode::UpstreamUnavailable));
}

#[tokio::test]
async fn test_expired_credential_is_rejected() {
    let issuer = issuer();
    let usa = Deployment::new("usa", &issuer);
    let mut stale = claims("SECRET", "USA", &["FVEY"], Utc::now() - ChronoDuration::hours(2));
    stale.exp = (Utc::now() - ChronoDuration::hours(1)).timestamp();
    let credential = issuer.sign(&stale).unwrap();

    let response = usa.custodian.release(request(credential)).await;

    assert_eq!(response.denial, Some(DenialCode::AuthenticationInvalid));
    assert!(response.reasons.is_empty());
}

#[tokio::test]
async fn test_credential_from_unknown_issuer_is_rejected() {
    let trusted = issuer();
    let rogue = coalition_tdf::credential::CredentialIssuer::generate(ISSUER, "signing-1");
    let usa = Deployment::new("usa", &trusted);

    let response = usa
        .custodian
        .release(request(token(&rogue, "TOP SECRET", "USA", &["FVEY"])))
        .await;

    assert_eq!(response.denial, Some(DenialCode::AuthenticationInvalid));
}

#[tokio::test]
async fn test_grant_withdrawn_when_audit_unavailable() {
    let issuer = issuer();
    let keyring = CustodianKeyring::generate();
    let wrapping_key = keyring.wrapping_key(WrapAlgorithm::EcdhEsA256Gcm).unwrap();
    let directory = Arc::new(coalition_tdf::custodian::InMemoryDirectory::new());
    let object = ProtectedObject::builder(fvey_secret_label())
        .object_id("doc-1")
        .custodian(CustodianRef::new("usa", "https://usa.custodian.example"), wrapping_key)
        .build(TEST_PLAINTEXT)
        .unwrap();
    directory.insert(object.clone());

    let custodian = KeyCustodian::new(
        &fast_config(),
        keyring,
        verifier(&issuer),
        directory,
        Arc::new(ClosedAudit),
    );
    let kao = &object.payload.key_access[0];
    let response = custodian
        .release(ReleaseRequest::new(
            "doc-1",
            kao.id.clone(),
            kao.wrapped_key.clone(),
            token(&issuer, "SECRET", "USA", &["FVEY"]),
            "corr-audit",
        ))
        .await;

    assert!(!response.granted);
    assert!(response.key.is_none());
    assert_eq!(response.denial, Some(DenialCode::UpstreamUnavailable));
}

#[tokio::test]
async fn test_denial_does_not_reveal_resource_existence() {
    let issuer = issuer();
    let usa = Deployment::new("usa", &issuer);
    let object = ProtectedObject::builder(fvey_secret_label())
        .object_id("doc-1")
        .custodian(usa.custodian_ref(), usa.wrapping_key.clone())
        .build(TEST_PLAINTEXT)
        .unwrap();
    usa.directory.insert(object);

    let credential = token(&issuer, "SECRET", "USA", &["FVEY"]);
    let missing_resource = usa
        .custodian
        .release(ReleaseRequest::new(
            "doc-unknown",
            "kao-0",
            vec![1; 40],
            credential.clone(),
            "corr-a",
        ))
        .await;
    let missing_kao = usa
        .custodian
        .release(ReleaseRequest::new("doc-1", "kao-9", vec![1; 40], credential, "corr-b"))
        .await;

    assert_eq!(missing_resource.denial, Some(DenialCode::AccessDenied));
    assert_eq!(missing_kao.denial, missing_resource.denial);
    assert_eq!(missing_kao.reasons, missing_resource.reasons);
}
