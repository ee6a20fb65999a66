//! Authentication assurance normalization
//!
//! Identity providers in the federation disagree on how they express
//! authentication strength: some send `acr` as a small integer (0-based or
//! 1-based), some as `"aal2"`, some as URNs or InCommon profile names. All of
//! them are folded into [`AssuranceLevel`] here. Anything unrecognized becomes
//! [`AssuranceLevel::Aal1`], never an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Normalized authenticator assurance level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssuranceLevel {
    /// Single factor
    Aal1,
    /// Multi-factor
    Aal2,
    /// Hardware-backed multi-factor
    Aal3,
}

impl AssuranceLevel {
    /// Normalize a raw `acr` claim
    pub fn from_claim(value: &Value) -> Self {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(Self::from_index)
                .unwrap_or(AssuranceLevel::Aal1),
            Value::String(s) => Self::from_claim_str(s),
            _ => AssuranceLevel::Aal1,
        }
    }

    /// Normalize a string `acr` claim
    pub fn from_claim_str(raw: &str) -> Self {
        let s = raw.trim().to_ascii_lowercase();
        if let Ok(n) = s.parse::<u64>() {
            return Self::from_index(n);
        }
        // Hierarchical forms such as "urn:mace:incommon:iap:silver" or
        // "http://idmanagement.gov/ns/assurance/aal/2": inspect the last segment.
        let tail = s
            .rsplit(|c: char| c == ':' || c == '/' || c == '#')
            .next()
            .unwrap_or(s.as_str())
            .to_string();
        let level = match tail.as_str() {
            "aal1" | "loa1" | "bronze" | "low" => Some(AssuranceLevel::Aal1),
            "aal2" | "loa2" | "silver" | "substantial" | "mfa" => Some(AssuranceLevel::Aal2),
            "aal3" | "loa3" | "loa4" | "gold" | "high" | "hwk" => Some(AssuranceLevel::Aal3),
            other => other.parse::<u64>().ok().map(Self::from_aal_number),
        };
        level.unwrap_or_else(|| {
            debug!(acr = raw, "unrecognized acr format, using AAL1");
            AssuranceLevel::Aal1
        })
    }

    /// Bare integer `acr`: 0-based index, with `3` accepted as AAL3
    fn from_index(n: u64) -> Self {
        match n {
            0 => AssuranceLevel::Aal1,
            1 => AssuranceLevel::Aal2,
            2 | 3 => AssuranceLevel::Aal3,
            _ => AssuranceLevel::Aal1,
        }
    }

    /// Trailing number of an `.../aal/N` style URI, which is 1-based
    fn from_aal_number(n: u64) -> Self {
        match n {
            2 => AssuranceLevel::Aal2,
            3 => AssuranceLevel::Aal3,
            _ => AssuranceLevel::Aal1,
        }
    }

    /// Level implied by a set of authentication factors
    pub fn implied_by(factors: &BTreeSet<AuthFactor>) -> Option<Self> {
        if factors.is_empty() {
            return None;
        }
        let strong = factors
            .iter()
            .any(|f| matches!(f, AuthFactor::HardwareKey | AuthFactor::SmartCard));
        let distinct = count_factors(factors);
        Some(if strong && distinct >= 2 {
            AssuranceLevel::Aal3
        } else if distinct >= 2 {
            AssuranceLevel::Aal2
        } else {
            AssuranceLevel::Aal1
        })
    }

    /// Minimum factor count a level stands for
    pub fn implied_factor_count(self) -> usize {
        match self {
            AssuranceLevel::Aal1 => 1,
            AssuranceLevel::Aal2 | AssuranceLevel::Aal3 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssuranceLevel::Aal1 => "AAL1",
            AssuranceLevel::Aal2 => "AAL2",
            AssuranceLevel::Aal3 => "AAL3",
        }
    }
}

impl fmt::Display for AssuranceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication method reference (`amr`) entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthFactor {
    Password,
    Otp,
    Sms,
    HardwareKey,
    SmartCard,
    Biometric,
    /// `mfa`: the IdP vouches for two or more factors without naming them
    MultiFactor,
    /// Reported by the IdP but not understood; never counted
    Unknown(String),
}

impl AuthFactor {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pwd" | "password" | "kba" => AuthFactor::Password,
            "otp" | "totp" | "hotp" => AuthFactor::Otp,
            "sms" | "tel" => AuthFactor::Sms,
            "hwk" | "webauthn" | "fido" | "passkey" => AuthFactor::HardwareKey,
            "sc" | "smartcard" | "piv" | "cac" => AuthFactor::SmartCard,
            "bio" | "fpt" | "face" | "iris" => AuthFactor::Biometric,
            "mfa" => AuthFactor::MultiFactor,
            other => AuthFactor::Unknown(other.to_string()),
        }
    }

    /// Possession factors all belong to one NIST category, but they are
    /// distinct authenticators, so each kind counts once.
    fn counts(&self) -> bool {
        !matches!(self, AuthFactor::Unknown(_) | AuthFactor::MultiFactor)
    }
}

/// `mfa` raises the count to at least two; it may overlap the named factors
fn count_factors(factors: &BTreeSet<AuthFactor>) -> usize {
    let named = factors.iter().filter(|f| f.counts()).count();
    if factors.contains(&AuthFactor::MultiFactor) {
        named.max(2)
    } else {
        named
    }
}

/// Normalized authentication context of a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationContext {
    pub assurance: AssuranceLevel,
    pub factors: BTreeSet<AuthFactor>,
    pub authenticated_at: DateTime<Utc>,
}

impl AuthenticationContext {
    pub fn new(
        assurance: AssuranceLevel,
        factors: impl IntoIterator<Item = AuthFactor>,
        authenticated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            assurance,
            factors: factors.into_iter().collect(),
            authenticated_at,
        }
    }

    /// Build from raw `acr`/`amr` claims
    ///
    /// When both are present the weaker of the stated and the implied level
    /// wins; a claim of AAL3 backed only by a password is AAL1.
    pub fn from_claims(
        acr: Option<&Value>,
        amr: &[String],
        authenticated_at: DateTime<Utc>,
    ) -> Self {
        let factors: BTreeSet<AuthFactor> = amr.iter().map(|m| AuthFactor::parse(m)).collect();
        let stated = acr.map(AssuranceLevel::from_claim);
        let implied = AssuranceLevel::implied_by(&factors);
        let assurance = match (stated, implied) {
            (Some(s), Some(i)) => s.min(i),
            (Some(s), None) => s,
            (None, Some(i)) => i,
            (None, None) => AssuranceLevel::Aal1,
        };
        Self {
            assurance,
            factors,
            authenticated_at,
        }
    }

    /// Number of distinct recognized factors
    ///
    /// An IdP that sends no usable `amr` is credited with the minimum its
    /// stated level implies.
    pub fn factor_count(&self) -> usize {
        match count_factors(&self.factors) {
            0 => self.assurance.implied_factor_count(),
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integer_acr_is_zero_based() {
        assert_eq!(AssuranceLevel::from_claim(&json!(0)), AssuranceLevel::Aal1);
        assert_eq!(AssuranceLevel::from_claim(&json!(1)), AssuranceLevel::Aal2);
        assert_eq!(AssuranceLevel::from_claim(&json!(2)), AssuranceLevel::Aal3);
        assert_eq!(AssuranceLevel::from_claim(&json!(3)), AssuranceLevel::Aal3);
        assert_eq!(AssuranceLevel::from_claim(&json!("1")), AssuranceLevel::Aal2);
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(AssuranceLevel::from_claim_str("aal2"), AssuranceLevel::Aal2);
        assert_eq!(AssuranceLevel::from_claim_str("AAL3"), AssuranceLevel::Aal3);
        assert_eq!(
            AssuranceLevel::from_claim_str("urn:mace:incommon:iap:silver"),
            AssuranceLevel::Aal2
        );
        assert_eq!(
            AssuranceLevel::from_claim_str("http://idmanagement.gov/ns/assurance/aal/3"),
            AssuranceLevel::Aal3
        );
        assert_eq!(AssuranceLevel::from_claim_str("gold"), AssuranceLevel::Aal3);
    }

    #[test]
    fn test_unrecognized_defaults_to_lowest() {
        assert_eq!(AssuranceLevel::from_claim_str("platinum"), AssuranceLevel::Aal1);
        assert_eq!(AssuranceLevel::from_claim(&json!(42)), AssuranceLevel::Aal1);
        assert_eq!(AssuranceLevel::from_claim(&json!(-1)), AssuranceLevel::Aal1);
        assert_eq!(AssuranceLevel::from_claim(&json!(1.5)), AssuranceLevel::Aal1);
        assert_eq!(AssuranceLevel::from_claim(&json!({"level": 3})), AssuranceLevel::Aal1);
        assert_eq!(AssuranceLevel::from_claim(&Value::Null), AssuranceLevel::Aal1);
    }

    #[test]
    fn test_factor_parsing_and_count() {
        let ctx = AuthenticationContext::from_claims(
            None,
            &["pwd".into(), "otp".into(), "carrier-pigeon".into()],
            Utc::now(),
        );
        assert_eq!(ctx.factor_count(), 2);
        assert!(ctx.factors.contains(&AuthFactor::Unknown("carrier-pigeon".into())));
        assert_eq!(ctx.assurance, AssuranceLevel::Aal2);
    }

    #[test]
    fn test_weaker_of_stated_and_implied() {
        let ctx = AuthenticationContext::from_claims(Some(&json!("aal3")), &["pwd".into()], Utc::now());
        assert_eq!(ctx.assurance, AssuranceLevel::Aal1);

        let ctx = AuthenticationContext::from_claims(
            Some(&json!(2)),
            &["pwd".into(), "hwk".into()],
            Utc::now(),
        );
        assert_eq!(ctx.assurance, AssuranceLevel::Aal3);
    }

    #[test]
    fn test_mfa_counts_as_two_factors() {
        let ctx = AuthenticationContext::from_claims(Some(&json!("aal2")), &["mfa".into()], Utc::now());
        assert_eq!(ctx.assurance, AssuranceLevel::Aal2);
        assert_eq!(ctx.factor_count(), 2);
        assert!(ctx.factors.contains(&AuthFactor::MultiFactor));

        let ctx = AuthenticationContext::from_claims(None, &["MFA".into(), "pwd".into()], Utc::now());
        assert_eq!(ctx.assurance, AssuranceLevel::Aal2);
        assert_eq!(ctx.factor_count(), 2);

        // unnamed factors cannot prove a hardware authenticator
        let ctx = AuthenticationContext::from_claims(Some(&json!("aal3")), &["mfa".into()], Utc::now());
        assert_eq!(ctx.assurance, AssuranceLevel::Aal2);

        let ctx = AuthenticationContext::from_claims(
            Some(&json!("aal3")),
            &["mfa".into(), "hwk".into()],
            Utc::now(),
        );
        assert_eq!(ctx.assurance, AssuranceLevel::Aal3);
        assert_eq!(ctx.factor_count(), 2);
    }

    #[test]
    fn test_stated_only() {
        let ctx = AuthenticationContext::from_claims(Some(&json!("silver")), &[], Utc::now());
        assert_eq!(ctx.assurance, AssuranceLevel::Aal2);
        assert!(ctx.factors.is_empty());
        assert_eq!(ctx.factor_count(), 2);
    }
}
