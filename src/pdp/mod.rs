//! Policy decision engine
//!
//! A decision is a pure function of subject attributes, the resource's
//! security label, the requested action and a [`DecisionContext`]. The engine
//! performs no I/O and reads no clock; time enters only through the context,
//! so the same inputs always produce the same [`Decision`].
//!
//! Rules are grouped into [`RuleModule`]s run as a pipeline:
//!
//! 1. [`GlobalGuardrails`] always runs and cannot be disabled.
//! 2. An optional deployment module (e.g. [`DeploymentRules`]) runs only when
//!    the guardrails allow. It can add denials but never lift one.

mod coi;
mod deployment;
mod rules;

pub use coi::{check_requirement, find_incoherent, CoiFailure};
pub use deployment::DeploymentRules;
pub use rules::GlobalGuardrails;

use crate::assurance::AssuranceLevel;
use crate::attributes::SubjectAttributes;
use crate::clearance::Clearance;
use crate::config::EngineConfig;
use crate::policy::SecurityPolicyLabel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Operation the subject wants to perform on the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Read,
    Decrypt,
    Update,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Decrypt => "decrypt",
            Action::Update => "update",
        }
    }
}

/// Result of hash-binding verification as reported by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntegrityStatus {
    Verified,
    Violated,
}

/// Environment of one decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionContext {
    pub now: DateTime<Utc>,
    pub integrity: IntegrityStatus,
}

impl DecisionContext {
    pub fn new(now: DateTime<Utc>, integrity: IntegrityStatus) -> Self {
        Self { now, integrity }
    }

    /// Context for an object whose bindings verified
    pub fn verified_at(now: DateTime<Utc>) -> Self {
        Self::new(now, IntegrityStatus::Verified)
    }
}

/// One violated rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "reason")]
pub enum DenyReason {
    InsufficientClearance {
        required: Clearance,
        held: Clearance,
    },
    NotReleasable {
        country: String,
    },
    CoiViolation {
        failure: CoiFailure,
    },
    UnderEmbargo {
        until: DateTime<Utc>,
    },
    IntegrityViolation,
    AuthenticationStrengthInsufficient {
        required_assurance: AssuranceLevel,
        held_assurance: AssuranceLevel,
        required_factors: usize,
        held_factors: usize,
        /// Authentication is older than the configured maximum age
        stale: bool,
    },
    /// A deployment-specific restriction, identified by rule name
    DeploymentRestriction {
        rule: String,
    },
}

impl DenyReason {
    /// Stable short name for logs, metrics and audit records
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::InsufficientClearance { .. } => "InsufficientClearance",
            DenyReason::NotReleasable { .. } => "NotReleasable",
            DenyReason::CoiViolation { .. } => "CoiViolation",
            DenyReason::UnderEmbargo { .. } => "UnderEmbargo",
            DenyReason::IntegrityViolation => "IntegrityViolation",
            DenyReason::AuthenticationStrengthInsufficient { .. } => {
                "AuthenticationStrengthInsufficient"
            }
            DenyReason::DeploymentRestriction { .. } => "DeploymentRestriction",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::InsufficientClearance { required, held } => {
                write!(f, "clearance {} below classification {}", held, required)
            }
            DenyReason::NotReleasable { country } => write!(f, "not releasable to {}", country),
            DenyReason::CoiViolation { failure } => write!(f, "COI check failed: {:?}", failure),
            DenyReason::UnderEmbargo { until } => write!(f, "under embargo until {}", until),
            DenyReason::IntegrityViolation => f.write_str("integrity bindings do not verify"),
            DenyReason::AuthenticationStrengthInsufficient {
                required_assurance,
                held_assurance,
                required_factors,
                held_factors,
                stale,
            } => {
                if *stale {
                    f.write_str("authentication too old")
                } else {
                    write!(
                        f,
                        "authentication {}/{} factor(s) below required {}/{}",
                        held_assurance, held_factors, required_assurance, required_factors
                    )
                }
            }
            DenyReason::DeploymentRestriction { rule } => {
                write!(f, "deployment rule '{}' denies access", rule)
            }
        }
    }
}

/// Duty attached to an allow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Obligation {
    /// Record the access in the audit trail
    AuditAccess,
    /// Anything derived from the content carries this marking
    PreserveMarking { classification: Clearance },
}

/// Outcome of [`DecisionEngine::decide`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allow: bool,
    /// Violated rules in evaluation order; empty iff `allow`
    pub reasons: Vec<DenyReason>,
    pub obligations: Vec<Obligation>,
}

impl Decision {
    pub fn deny(reasons: Vec<DenyReason>) -> Self {
        Self {
            allow: false,
            reasons,
            obligations: Vec::new(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allow
    }

    /// Reason codes joined for logging
    pub fn reason_codes(&self) -> Vec<&'static str> {
        self.reasons.iter().map(DenyReason::code).collect()
    }
}

/// Inputs of one evaluation, borrowed for the duration of the pipeline
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub subject: &'a SubjectAttributes,
    pub resource: &'a SecurityPolicyLabel,
    pub action: Action,
    pub context: DecisionContext,
}

/// A self-contained group of rules
///
/// Modules return every violation they find, in a fixed order. An empty
/// vector means the module allows.
pub trait RuleModule: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn evaluate(&self, request: &DecisionRequest<'_>) -> Vec<DenyReason>;

    /// Stable bytes describing the module's configuration
    fn fingerprint(&self) -> Vec<u8>;
}

/// Digest identifying the rule set a deployment enforces
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSetVersion(pub String);

impl fmt::Display for RuleSetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct DecisionEngine {
    global: GlobalGuardrails,
    deployment: Option<Box<dyn RuleModule>>,
}

impl DecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            global: GlobalGuardrails::new(config),
            deployment: None,
        }
    }

    /// Attach a deployment module evaluated after the guardrails
    #[must_use]
    pub fn with_deployment_module(mut self, module: Box<dyn RuleModule>) -> Self {
        self.deployment = Some(module);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        self.global.config()
    }

    /// Evaluate the pipeline; default deny, allow only when no module objects
    pub fn decide(
        &self,
        subject: &SubjectAttributes,
        resource: &SecurityPolicyLabel,
        action: Action,
        context: DecisionContext,
    ) -> Decision {
        let request = DecisionRequest {
            subject,
            resource,
            action,
            context,
        };

        let reasons = self.global.evaluate(&request);
        if !reasons.is_empty() {
            return Decision::deny(reasons);
        }

        if let Some(module) = &self.deployment {
            let reasons = module.evaluate(&request);
            if !reasons.is_empty() {
                return Decision::deny(reasons);
            }
        }

        let mut obligations = Vec::new();
        if resource.classification > Clearance::Unclassified {
            obligations.push(Obligation::AuditAccess);
            obligations.push(Obligation::PreserveMarking {
                classification: resource.classification,
            });
        }
        Decision {
            allow: true,
            reasons: Vec::new(),
            obligations,
        }
    }

    /// Version of the guardrail configuration this engine enforces
    ///
    /// Deployment modules are local by definition and do not contribute, so
    /// two deployments with equal guardrails report equal versions.
    pub fn rule_set_version(&self) -> RuleSetVersion {
        let digest = Sha256::digest(self.global.fingerprint());
        RuleSetVersion(format!("sha256:{}", hex::encode(digest)))
    }
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
