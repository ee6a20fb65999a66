//! Normalized subject attributes
//!
//! Produced from a verified credential and immutable for the lifetime of one
//! request.

use crate::assurance::{AssuranceLevel, AuthenticationContext};
use crate::clearance::Clearance;
use crate::policy::{is_coi_name, is_country_code, PolicyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAttributes {
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    pub clearance: Clearance,
    pub country_of_affiliation: String,
    #[serde(default)]
    pub coi: BTreeSet<String>,
    pub authentication: AuthenticationContext,
    /// Identity provider that vouched for the attributes
    pub issuer: String,
}

impl SubjectAttributes {
    /// Subject with no COI memberships and a single-factor authentication at `authenticated_at`
    pub fn new(
        unique_id: impl Into<String>,
        clearance: Clearance,
        country: impl Into<String>,
        authenticated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            clearance,
            country_of_affiliation: country.into().trim().to_uppercase(),
            coi: BTreeSet::new(),
            authentication: AuthenticationContext::new(AssuranceLevel::Aal1, [], authenticated_at),
            issuer: String::new(),
        }
    }

    #[must_use]
    pub fn with_coi(mut self, communities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.coi
            .extend(communities.into_iter().map(|c| c.into().trim().to_uppercase()));
        self
    }

    #[must_use]
    pub fn with_authentication(mut self, authentication: AuthenticationContext) -> Self {
        self.authentication = authentication;
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Reject malformed country or COI values before they reach the engine
    pub fn check_format(&self) -> Result<(), PolicyError> {
        if !is_country_code(&self.country_of_affiliation) {
            return Err(PolicyError::InvalidCountry {
                code: self.country_of_affiliation.clone(),
            });
        }
        if let Some(bad) = self.coi.iter().find(|c| !is_coi_name(c)) {
            return Err(PolicyError::InvalidCoi { name: bad.clone() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_normalizes_case() {
        let s = SubjectAttributes::new("alice@gbr", Clearance::Secret, "gbr", Utc::now())
            .with_coi(["fvey", "NATO-COSMIC"]);
        assert_eq!(s.country_of_affiliation, "GBR");
        assert!(s.coi.contains("FVEY"));
        assert!(s.check_format().is_ok());
    }

    #[test]
    fn test_check_format_rejects_bad_country() {
        let s = SubjectAttributes::new("bob", Clearance::Secret, "United States", Utc::now());
        assert!(matches!(s.check_format(), Err(PolicyError::InvalidCountry { .. })));
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let s = SubjectAttributes::new("carol", Clearance::Confidential, "FRA", Utc::now());
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["uniqueID"], "carol");
        assert_eq!(json["countryOfAffiliation"], "FRA");
        assert_eq!(json["clearance"], "CONFIDENTIAL");
    }
}
