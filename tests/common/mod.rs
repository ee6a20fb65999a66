//! Shared fixtures for coalition-tdf integration tests
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use coalition_tdf::assurance::{AssuranceLevel, AuthFactor, AuthenticationContext};
use coalition_tdf::audit::MemoryAuditSink;
use coalition_tdf::config::{CredentialConfig, CustodianConfig};
use coalition_tdf::credential::{CredentialClaims, CredentialIssuer, CredentialVerifier, IssuerKeySet};
use coalition_tdf::custodian::{InMemoryDirectory, KeyCustodian};
use coalition_tdf::kem::WrapAlgorithm;
use coalition_tdf::keyring::{CustodianKeyring, WrappingKey};
use coalition_tdf::manifest::CustodianRef;
use coalition_tdf::{Clearance, PolicyBuilder, SecurityPolicyLabel, SubjectAttributes};
use serde_json::json;
use std::sync::Arc;

pub const TEST_PLAINTEXT: &[u8] = b"OPORD 12-04: convoy departs 0400Z, route BLUE.";
pub const ISSUER: &str = "https://idp.coalition.example";

/// Subject with AAL2 and two factors, enough for SECRET by default
pub fn subject(clearance: Clearance, country: &str, coi: &[&str]) -> SubjectAttributes {
    let now = Utc::now();
    SubjectAttributes::new("jane.analyst", clearance, country, now)
        .with_coi(coi.iter().copied())
        .with_authentication(AuthenticationContext::new(
            AssuranceLevel::Aal2,
            [AuthFactor::Password, AuthFactor::Otp],
            now,
        ))
        .with_issuer(ISSUER)
}

/// Scenario 1 resource label
pub fn fvey_secret_label() -> SecurityPolicyLabel {
    PolicyBuilder::new(Clearance::Secret)
        .releasable_to(["USA", "GBR", "CAN"])
        .coi_all_of(["FVEY"])
        .originating_authority("USA")
        .build()
        .expect("valid label")
}

pub fn issuer() -> CredentialIssuer {
    CredentialIssuer::generate(ISSUER, "signing-1")
}

pub fn claims(clearance: &str, country: &str, coi: &[&str], now: DateTime<Utc>) -> CredentialClaims {
    let ts = now.timestamp();
    CredentialClaims {
        iss: String::new(),
        sub: "jane.analyst".to_string(),
        unique_id: None,
        exp: ts + 600,
        iat: Some(ts),
        nbf: None,
        clearance: clearance.to_string(),
        clearance_country: None,
        country_of_affiliation: country.to_string(),
        acp_coi: coi.iter().map(|c| c.to_string()).collect(),
        acr: Some(json!("aal2")),
        amr: vec!["pwd".to_string(), "otp".to_string()],
        auth_time: Some(ts),
    }
}

pub fn token(issuer: &CredentialIssuer, clearance: &str, country: &str, coi: &[&str]) -> String {
    issuer
        .sign(&claims(clearance, country, coi, Utc::now()))
        .expect("credential signs")
}

pub fn verifier(issuer: &CredentialIssuer) -> CredentialVerifier {
    let keys = IssuerKeySet::new().with_key(issuer.issuer(), issuer.kid(), issuer.verifying_key());
    CredentialVerifier::with_static_keys(keys, CredentialConfig::default())
}

/// One deployment's custodian with an in-memory directory and audit log
pub struct Deployment {
    pub id: String,
    pub custodian: Arc<KeyCustodian>,
    pub directory: Arc<InMemoryDirectory>,
    pub audit: MemoryAuditSink,
    pub wrapping_key: WrappingKey,
}

impl Deployment {
    pub fn new(id: &str, issuer: &CredentialIssuer) -> Self {
        Self::with_config(
            CustodianConfig {
                custodian_id: id.to_string(),
                ..CustodianConfig::default()
            },
            issuer,
        )
    }

    pub fn with_config(config: CustodianConfig, issuer: &CredentialIssuer) -> Self {
        let keyring = CustodianKeyring::generate();
        let wrapping_key = keyring
            .wrapping_key(WrapAlgorithm::EcdhEsA256Gcm)
            .expect("keyring has an EC key");
        let directory = Arc::new(InMemoryDirectory::new());
        let audit = MemoryAuditSink::new();
        let custodian = Arc::new(KeyCustodian::new(
            &config,
            keyring,
            verifier(issuer),
            directory.clone(),
            Arc::new(audit.clone()),
        ));
        Self {
            id: config.custodian_id.clone(),
            custodian,
            directory,
            audit,
            wrapping_key,
        }
    }

    pub fn custodian_ref(&self) -> CustodianRef {
        CustodianRef::new(self.id.clone(), format!("https://{}.custodian.example", self.id))
    }
}
