mod common;

use chrono::{Duration as ChronoDuration, Utc};
use coalition_tdf::assurance::{AssuranceLevel, AuthFactor, AuthenticationContext};
use coalition_tdf::audit::AuditEventType;
use coalition_tdf::custodian::{DenialCode, ReleaseRequest};
use coalition_tdf::federation::{FederationRouter, InProcessChannel, StaticChannels, TrustRegistry};
use coalition_tdf::manifest::ProtectedObject;
use coalition_tdf::pdp::{Action, DecisionContext, IntegrityStatus};
use coalition_tdf::pep::{EnforcementPoint, PepError};
use coalition_tdf::{
    Clearance, DecisionEngine, DenyReason, PolicyBuilder, SecurityPolicyLabel, SubjectAttributes,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn scenario_1_fvey_secret_allows() {
    let engine = DecisionEngine::default();
    let decision = engine.decide(
        &subject(Clearance::Secret, "USA", &["FVEY"]),
        &fvey_secret_label(),
        Action::Decrypt,
        DecisionContext::verified_at(Utc::now()),
    );
    assert!(decision.allow, "{:?}", decision.reasons);
    assert!(decision.reasons.is_empty());
}

#[test]
fn scenario_2_insufficient_clearance() {
    let engine = DecisionEngine::default();
    let label = PolicyBuilder::new(Clearance::Secret)
        .originating_authority("USA")
        .build()
        .unwrap();
    let decision = engine.decide(
        &subject(Clearance::Confidential, "USA", &[]),
        &label,
        Action::Decrypt,
        DecisionContext::verified_at(Utc::now()),
    );
    assert!(!decision.allow);
    assert_eq!(
        decision.reasons,
        vec![DenyReason::InsufficientClearance {
            required: Clearance::Secret,
            held: Clearance::Confidential,
        }]
    );
}

#[test]
fn scenario_3_not_releasable() {
    let engine = DecisionEngine::default();
    let label = PolicyBuilder::new(Clearance::Unclassified)
        .releasable_to(["USA"])
        .originating_authority("USA")
        .build()
        .unwrap();
    let decision = engine.decide(
        &subject(Clearance::Secret, "FRA", &[]),
        &label,
        Action::Decrypt,
        DecisionContext::verified_at(Utc::now()),
    );
    assert!(!decision.allow);
    assert_eq!(decision.reason_codes(), vec!["NotReleasable"]);
}

/// Labels across classifications, releasability and COI shapes
fn label_grid() -> Vec<SecurityPolicyLabel> {
    let mut labels = Vec::new();
    for classification in Clearance::ALL {
        let base = || PolicyBuilder::new(classification).originating_authority("USA");
        labels.push(base().build().unwrap());
        labels.push(base().releasable_to(["USA", "GBR"]).build().unwrap());
        labels.push(base().releasable_to(["FRA"]).build().unwrap());
        labels.push(base().coi_all_of(["FVEY"]).build().unwrap());
        labels.push(base().coi_any_of(["NATO", "FVEY"]).build().unwrap());
        labels.push(
            base()
                .releasable_to(["USA", "CAN"])
                .coi_all_of(["FVEY", "NATO"])
                .build()
                .unwrap(),
        );
    }
    labels
}

fn strong_subject(
    clearance: Clearance,
    country: &str,
    coi: &[&str],
    now: chrono::DateTime<Utc>,
) -> SubjectAttributes {
    SubjectAttributes::new("jane.analyst", clearance, country, now)
        .with_coi(coi.iter().copied())
        .with_authentication(AuthenticationContext::new(
            AssuranceLevel::Aal3,
            [AuthFactor::Password, AuthFactor::HardwareKey],
            now,
        ))
        .with_issuer(ISSUER)
}

#[test]
fn decisions_are_deterministic() {
    let engine = DecisionEngine::default();
    let now = Utc::now();
    let context = DecisionContext::verified_at(now);
    for label in label_grid() {
        for (country, coi) in [("USA", &["FVEY"][..]), ("FRA", &["NATO"][..]), ("GBR", &[][..])] {
            for clearance in Clearance::ALL {
                let subject = strong_subject(clearance, country, coi, now);
                let first = engine.decide(&subject, &label, Action::Decrypt, context);
                for _ in 0..5 {
                    assert_eq!(engine.decide(&subject, &label, Action::Decrypt, context), first);
                }
            }
        }
    }
}

#[test]
fn raising_clearance_never_revokes_access() {
    let engine = DecisionEngine::default();
    let now = Utc::now();
    let context = DecisionContext::verified_at(now);
    let mut allowed = 0;
    for label in label_grid() {
        for (country, coi) in [
            ("USA", &["FVEY", "NATO"][..]),
            ("FRA", &["NATO"][..]),
            ("CAN", &["FVEY"][..]),
            ("GBR", &[][..]),
        ] {
            let mut was_allowed = false;
            for clearance in Clearance::ALL {
                let subject = strong_subject(clearance, country, coi, now);
                let decision = engine.decide(&subject, &label, Action::Decrypt, context);
                assert!(
                    decision.allow || !was_allowed,
                    "{:?} lost access to {:?} at {:?}: {:?}",
                    country,
                    label.classification,
                    clearance,
                    decision.reasons
                );
                was_allowed = decision.allow;
                allowed += usize::from(decision.allow);
            }
        }
    }
    // the grid must exercise both outcomes
    assert!(allowed > 0);
}

#[test]
fn mfa_subject_reads_secret() {
    let engine = DecisionEngine::default();
    let now = Utc::now();
    let label = PolicyBuilder::new(Clearance::Secret)
        .originating_authority("USA")
        .build()
        .unwrap();
    let subject = SubjectAttributes::new("jane.analyst", Clearance::Secret, "USA", now)
        .with_authentication(AuthenticationContext::from_claims(
            Some(&serde_json::json!("aal2")),
            &["mfa".to_string()],
            now,
        ))
        .with_issuer(ISSUER);
    let decision = engine.decide(&subject, &label, Action::Decrypt, DecisionContext::verified_at(now));
    assert!(decision.allow, "{:?}", decision.reasons);
}

#[tokio::test]
async fn scenario_4_corrupted_chunk_hash_denies() {
    let issuer = issuer();
    let usa = Deployment::new("usa", &issuer);
    let mut object = ProtectedObject::builder(fvey_secret_label())
        .object_id("doc-4")
        .chunk_size(8)
        .custodian(usa.custodian_ref(), usa.wrapping_key.clone())
        .build(TEST_PLAINTEXT)
        .unwrap();
    object.payload.chunks[1].hash = "00".repeat(32);
    usa.directory.insert(object.clone());

    // the engine alone, fed the codec's verdict
    let engine = DecisionEngine::default();
    assert_eq!(object.integrity_status(), IntegrityStatus::Violated);
    let decision = engine.decide(
        &subject(Clearance::Secret, "USA", &["FVEY"]),
        &object.policy.label,
        Action::Decrypt,
        DecisionContext::new(Utc::now(), object.integrity_status()),
    );
    assert_eq!(decision.reasons, vec![DenyReason::IntegrityViolation]);

    // and end to end through the custodian
    let kao = &object.payload.key_access[0];
    let response = usa
        .custodian
        .release(ReleaseRequest::new(
            "doc-4",
            kao.id.clone(),
            kao.wrapped_key.clone(),
            token(&issuer, "SECRET", "USA", &["FVEY"]),
            "corr-4",
        ))
        .await;
    assert!(!response.granted);
    assert!(response.key.is_none());
    assert_eq!(response.denial, Some(DenialCode::IntegrityViolation));
    assert_eq!(response.reasons, vec![DenyReason::IntegrityViolation]);
}

#[tokio::test]
async fn scenario_5_stale_local_policy_is_divergence() {
    let issuer = issuer();
    let usa = Deployment::new("usa", &issuer);
    let object = ProtectedObject::builder(fvey_secret_label())
        .object_id("doc-5")
        .custodian(usa.custodian_ref(), usa.wrapping_key.clone())
        .build(TEST_PLAINTEXT)
        .unwrap();
    usa.directory.insert(object.clone());

    let router = Arc::new(
        FederationRouter::new(
            "usa",
            Arc::new(TrustRegistry::from_entries(Vec::new()).unwrap()),
            Arc::new(StaticChannels::new()),
            Duration::from_secs(1),
        )
        .with_local(Arc::new(InProcessChannel::new(usa.custodian.clone()))),
    );
    let pep = EnforcementPoint::new(
        usa.custodian.engine().clone(),
        Arc::new(verifier(&issuer)),
        router,
        Duration::from_secs(3600),
    );

    // warm the enforcement point's policy cache, then tighten at the authority
    let credential = token(&issuer, "SECRET", "USA", &["FVEY"]);
    let opened = pep.open(&credential, &object, Utc::now()).await.unwrap();
    assert_eq!(&opened.plaintext[..], TEST_PLAINTEXT);

    let embargoed = PolicyBuilder::new(Clearance::Secret)
        .releasable_to(["USA", "GBR", "CAN"])
        .coi_all_of(["FVEY"])
        .embargo_until(Utc::now() + ChronoDuration::days(7))
        .originating_authority("USA")
        .build()
        .unwrap();
    usa.directory.update_policy("doc-5", embargoed).unwrap();
    usa.custodian.invalidate_resource("doc-5");

    let err = pep.open(&credential, &object, Utc::now()).await.err().unwrap();
    match err {
        PepError::ReleaseDenied {
            denial, reasons, ..
        } => {
            assert_eq!(denial, DenialCode::DivergenceDetected);
            assert_eq!(reasons[0].code(), "UnderEmbargo");
        }
        other => panic!("expected a custodian denial, got {:?}", other),
    }

    let divergence: Vec<_> = usa
        .audit
        .events()
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::DivergenceDetected)
        .collect();
    assert_eq!(divergence.len(), 1);
    assert_eq!(divergence[0].resource_id, "doc-5");
}
