use crate::clearance::Clearance;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Validation error with structured information
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub error_type: ValidationErrorType,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (suggestion: {})", suggestion)?;
        }
        Ok(())
    }
}

/// Types of validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorType {
    Required,
    InvalidFormat,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid country code '{code}'")]
    InvalidCountry { code: String },

    #[error("Invalid community of interest '{name}'")]
    InvalidCoi { name: String },

    #[error("Policy validation failed with {} error(s)", .0.len())]
    ValidationFailed(Vec<ValidationError>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl PolicyError {
    /// Returns a suggestion for how to fix this error, if available
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            PolicyError::InvalidCountry { .. } => {
                Some("Use ISO 3166-1 alpha-3 codes (USA, GBR, FRA) or a group token (FVEY, NATO)")
            }
            PolicyError::InvalidCoi { .. } => {
                Some("COI names are uppercase letters, digits and dashes, e.g. NATO-COSMIC")
            }
            PolicyError::ValidationFailed(errors) if !errors.is_empty() => {
                errors[0].suggestion.as_deref()
            }
            _ => None,
        }
    }

    /// Returns a stable error code for programmatic error handling
    ///
    /// Error codes follow the format: `CTDF_E_<CATEGORY>_<SPECIFIC>`
    pub fn error_code(&self) -> &'static str {
        match self {
            PolicyError::InvalidCountry { .. } => "CTDF_E_POLICY_COUNTRY_INVALID",
            PolicyError::InvalidCoi { .. } => "CTDF_E_POLICY_COI_INVALID",
            PolicyError::ValidationFailed(_) => "CTDF_E_POLICY_VALIDATION",
            PolicyError::SerializationError(_) => "CTDF_E_POLICY_SERIALIZATION",
        }
    }
}

lazy_static! {
    static ref COUNTRY_CODE: Regex = Regex::new(r"^[A-Z]{3}$").expect("country regex is valid");
    static ref COI_NAME: Regex =
        Regex::new(r"^[A-Z0-9][A-Z0-9_-]{0,63}$").expect("coi regex is valid");

    /// Releasability tokens that stand for a set of nations
    static ref RELEASABILITY_GROUPS: BTreeMap<&'static str, &'static [&'static str]> = {
        let mut m: BTreeMap<&'static str, &'static [&'static str]> = BTreeMap::new();
        m.insert("FVEY", &["AUS", "CAN", "GBR", "NZL", "USA"]);
        m.insert("NATO", &[
            "ALB", "BEL", "BGR", "CAN", "CZE", "DEU", "DNK", "ESP", "EST", "FIN", "FRA", "GBR",
            "GRC", "HRV", "HUN", "ISL", "ITA", "LTU", "LUX", "LVA", "MKD", "MNE", "NLD", "NOR",
            "POL", "PRT", "ROU", "SVK", "SVN", "SWE", "TUR", "USA",
        ]);
        m
    };
}

/// Expand group tokens (`FVEY`, `NATO`) into member nations
pub fn expand_releasability<'a>(entries: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for entry in entries {
        match RELEASABILITY_GROUPS.get(entry.as_str()) {
            Some(members) => out.extend(members.iter().map(|m| m.to_string())),
            None => {
                out.insert(entry.clone());
            }
        }
    }
    out
}

/// Whether `code` looks like an ISO 3166-1 alpha-3 code
pub fn is_country_code(code: &str) -> bool {
    COUNTRY_CODE.is_match(code)
}

/// Whether `name` is a well-formed COI identifier
pub fn is_coi_name(name: &str) -> bool {
    COI_NAME.is_match(name)
}

/// Whether `token` names a releasability group rather than a nation
pub fn is_releasability_group(token: &str) -> bool {
    RELEASABILITY_GROUPS.contains_key(token)
}

/// How the communities in a COI requirement combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CoiOperator {
    #[default]
    AllOf,
    AnyOf,
}

/// Community-of-interest requirement of a label; empty means none
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoiRequirement {
    pub operator: CoiOperator,
    pub communities: BTreeSet<String>,
}

impl CoiRequirement {
    pub fn all_of(communities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            operator: CoiOperator::AllOf,
            communities: communities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn any_of(communities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            operator: CoiOperator::AnyOf,
            communities: communities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.communities.is_empty()
    }
}

/// Security policy label attached to every protected object
///
/// Sets are ordered, so the JSON encoding of a label is canonical and the
/// digest of two equal labels is identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicyLabel {
    pub classification: Clearance,
    /// Nations (or group tokens) allowed to receive the object; empty = unrestricted
    #[serde(default)]
    pub releasable_to: BTreeSet<String>,
    #[serde(default)]
    pub coi: CoiRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embargo_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub originating_authority: String,
}

impl SecurityPolicyLabel {
    /// Canonical byte encoding used for hashing
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, PolicyError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// SHA-256 over the canonical encoding
    pub fn digest(&self) -> Result<[u8; 32], PolicyError> {
        let bytes = self.canonical_bytes()?;
        Ok(Sha256::digest(&bytes).into())
    }

    /// Hex form of [`Self::digest`], as stored in the policy section
    pub fn digest_hex(&self) -> Result<String, PolicyError> {
        Ok(hex::encode(self.digest()?))
    }

    /// Nations the label releases to after group expansion; `None` = unrestricted
    pub fn releasable_nations(&self) -> Option<BTreeSet<String>> {
        if self.releasable_to.is_empty() {
            None
        } else {
            Some(expand_releasability(&self.releasable_to))
        }
    }

    /// Validate the label, collecting every problem
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut errors = Vec::new();

        if self.originating_authority.trim().is_empty() {
            errors.push(ValidationError {
                field: "originatingAuthority".to_string(),
                error_type: ValidationErrorType::Required,
                message: "Originating authority is empty".to_string(),
                suggestion: Some("Set the custodian or nation that owns the object".to_string()),
            });
        }

        for code in &self.releasable_to {
            if !is_country_code(code) && !is_releasability_group(code) {
                errors.push(ValidationError {
                    field: format!("releasableTo[{}]", code),
                    error_type: ValidationErrorType::InvalidFormat,
                    message: format!("'{}' is not an alpha-3 country code", code),
                    suggestion: Some(
                        "Use ISO 3166-1 alpha-3 codes (USA, GBR, FRA) or FVEY / NATO".to_string(),
                    ),
                });
            }
        }

        for name in &self.coi.communities {
            if !is_coi_name(name) {
                errors.push(ValidationError {
                    field: format!("coi[{}]", name),
                    error_type: ValidationErrorType::InvalidFormat,
                    message: format!("'{}' is not a valid COI name", name),
                    suggestion: Some("Use uppercase COI names such as FVEY or NATO-COSMIC".to_string()),
                });
            }
        }

        if let Some(embargo) = self.embargo_until {
            if embargo < self.created_at {
                errors.push(ValidationError {
                    field: "embargoUntil".to_string(),
                    error_type: ValidationErrorType::InvalidFormat,
                    message: format!(
                        "embargo ({}) precedes creation date ({})",
                        embargo, self.created_at
                    ),
                    suggestion: Some("Remove the embargo or move it after createdAt".to_string()),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PolicyError::ValidationFailed(errors))
        }
    }
}

/// Builder for [`SecurityPolicyLabel`]
///
/// # Example
///
/// ```
/// use coalition_tdf::{Clearance, PolicyBuilder};
///
/// let label = PolicyBuilder::new(Clearance::Secret)
///     .releasable_to(["USA", "GBR"])
///     .coi_any_of(["FVEY"])
///     .originating_authority("USA")
///     .build()?;
/// assert_eq!(label.releasable_to.len(), 2);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct PolicyBuilder {
    classification: Clearance,
    releasable_to: BTreeSet<String>,
    coi: CoiRequirement,
    embargo_until: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    originating_authority: String,
}

impl PolicyBuilder {
    pub fn new(classification: Clearance) -> Self {
        Self {
            classification,
            releasable_to: BTreeSet::new(),
            coi: CoiRequirement::default(),
            embargo_until: None,
            created_at: None,
            originating_authority: String::new(),
        }
    }

    /// Add nations or group tokens; codes are uppercased
    #[must_use]
    pub fn releasable_to(mut self, codes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.releasable_to
            .extend(codes.into_iter().map(|c| c.into().trim().to_uppercase()));
        self
    }

    #[must_use]
    pub fn coi_all_of(mut self, communities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.coi = CoiRequirement::all_of(communities);
        self
    }

    #[must_use]
    pub fn coi_any_of(mut self, communities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.coi = CoiRequirement::any_of(communities);
        self
    }

    #[must_use]
    pub fn embargo_until(mut self, until: DateTime<Utc>) -> Self {
        self.embargo_until = Some(until);
        self
    }

    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    #[must_use]
    pub fn originating_authority(mut self, authority: impl Into<String>) -> Self {
        self.originating_authority = authority.into();
        self
    }

    /// Build and validate the label
    ///
    /// `createdAt` defaults to now.
    pub fn build(self) -> Result<SecurityPolicyLabel, PolicyError> {
        let label = SecurityPolicyLabel {
            classification: self.classification,
            releasable_to: self.releasable_to,
            coi: self.coi,
            embargo_until: self.embargo_until,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            originating_authority: self.originating_authority,
        };
        label.validate()?;
        Ok(label)
    }
}
