use super::{DecisionRequest, DenyReason, RuleModule};
use crate::config::DeploymentRuleConfig;

/// Restrictions a single deployment layers on top of the guardrails
#[derive(Debug, Clone)]
pub struct DeploymentRules {
    config: DeploymentRuleConfig,
}

impl DeploymentRules {
    pub fn new(config: DeploymentRuleConfig) -> Self {
        Self { config }
    }

    fn deny(rule: &str) -> DenyReason {
        DenyReason::DeploymentRestriction {
            rule: rule.to_string(),
        }
    }
}

impl RuleModule for DeploymentRules {
    fn name(&self) -> &'static str {
        "deployment"
    }

    fn evaluate(&self, request: &DecisionRequest<'_>) -> Vec<DenyReason> {
        let mut reasons = Vec::new();
        let country = &request.subject.country_of_affiliation;

        if self.config.blocked_countries.contains(country) {
            reasons.push(Self::deny("blockedCountry"));
        }
        if !self.config.allowed_actions.is_empty()
            && !self.config.allowed_actions.contains(&request.action)
        {
            reasons.push(Self::deny("actionNotPermitted"));
        }

        let foreign = !self.config.home_country.is_empty() && *country != self.config.home_country;
        if foreign {
            if !self.config.foreign_required_coi.is_empty()
                && self.config.foreign_required_coi.is_disjoint(&request.subject.coi)
            {
                reasons.push(Self::deny("foreignCoiRequired"));
            }
            if let Some(ceiling) = self.config.foreign_max_classification {
                if request.resource.classification > ceiling {
                    reasons.push(Self::deny("foreignClassificationCeiling"));
                }
            }
        }
        reasons
    }

    fn fingerprint(&self) -> Vec<u8> {
        serde_json::to_vec(&self.config).unwrap_or_default()
    }
}
