use super::coi::{check_requirement, find_incoherent};
use super::{DecisionRequest, DenyReason, IntegrityStatus, RuleModule};
use crate::clearance::Clearance;
use crate::config::EngineConfig;
use chrono::Duration;
use tracing::debug;

/// Non-overridable rules every deployment enforces
///
/// Evaluation order is fixed: integrity, clearance, releasability, COI,
/// embargo, authentication strength. An integrity violation is terminal and
/// reported alone; the other rules all run so the denial lists every reason.
#[derive(Debug, Clone)]
pub struct GlobalGuardrails {
    config: EngineConfig,
}

impl GlobalGuardrails {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn clearance(&self, request: &DecisionRequest<'_>, reasons: &mut Vec<DenyReason>) {
        let held = request.subject.clearance;
        let required = request.resource.classification;
        if held < required {
            reasons.push(DenyReason::InsufficientClearance { required, held });
        }
    }

    fn releasability(&self, request: &DecisionRequest<'_>, reasons: &mut Vec<DenyReason>) {
        if let Some(nations) = request.resource.releasable_nations() {
            let country = &request.subject.country_of_affiliation;
            if !nations.contains(country) {
                reasons.push(DenyReason::NotReleasable {
                    country: country.clone(),
                });
            }
        }
    }

    fn coi(&self, request: &DecisionRequest<'_>, reasons: &mut Vec<DenyReason>) {
        let held = &request.subject.coi;
        if let Some(failure) = find_incoherent(held, &self.config.coi_exclusions) {
            reasons.push(DenyReason::CoiViolation { failure });
            return;
        }
        if let Err(failure) = check_requirement(held, &request.resource.coi) {
            reasons.push(DenyReason::CoiViolation { failure });
        }
    }

    fn embargo(&self, request: &DecisionRequest<'_>, reasons: &mut Vec<DenyReason>) {
        if let Some(until) = request.resource.embargo_until {
            let skew = Duration::seconds(self.config.embargo_skew_secs as i64);
            if request.context.now + skew < until {
                reasons.push(DenyReason::UnderEmbargo { until });
            }
        }
    }

    fn authentication(&self, request: &DecisionRequest<'_>, reasons: &mut Vec<DenyReason>) {
        let auth = &request.subject.authentication;
        let classification = request.resource.classification;
        let requirement = self.config.auth_requirement(classification);
        let held_factors = auth.factor_count();

        let too_weak =
            auth.assurance < requirement.min_assurance || held_factors < requirement.min_factors;
        let stale = match self.config.max_auth_age_secs {
            Some(max) if classification > Clearance::Unclassified => {
                request.context.now - auth.authenticated_at > Duration::seconds(max as i64)
            }
            _ => false,
        };

        if too_weak || stale {
            debug!(
                classification = %classification,
                assurance = %auth.assurance,
                factors = held_factors,
                stale,
                "authentication strength insufficient"
            );
            reasons.push(DenyReason::AuthenticationStrengthInsufficient {
                required_assurance: requirement.min_assurance,
                held_assurance: auth.assurance,
                required_factors: requirement.min_factors,
                held_factors,
                stale,
            });
        }
    }
}

impl RuleModule for GlobalGuardrails {
    fn name(&self) -> &'static str {
        "global"
    }

    fn evaluate(&self, request: &DecisionRequest<'_>) -> Vec<DenyReason> {
        if request.context.integrity == IntegrityStatus::Violated {
            return vec![DenyReason::IntegrityViolation];
        }
        let mut reasons = Vec::new();
        self.clearance(request, &mut reasons);
        self.releasability(request, &mut reasons);
        self.coi(request, &mut reasons);
        self.embargo(request, &mut reasons);
        self.authentication(request, &mut reasons);
        reasons
    }

    fn fingerprint(&self) -> Vec<u8> {
        // EngineConfig holds only ordered collections, so its JSON is stable
        serde_json::to_vec(&self.config).unwrap_or_default()
    }
}
