use crate::crypto::AesKey;
use crate::crypto::EncryptionError;
use crate::pdp::{Action, DenyReason, Obligation};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use std::fmt;
use zeroize::Zeroize;

fn default_action() -> Action {
    Action::Decrypt
}

/// Request to release the key material of one key access object
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub resource_id: String,
    pub kao_id: String,
    /// Wrapped key as the caller found it in its copy of the object
    #[serde_as(as = "Base64")]
    pub wrapped_key: Vec<u8>,
    pub bearer_credential: String,
    pub correlation_id: String,
    #[serde(default = "default_action")]
    pub action: Action,
    /// Compressed SEC1 P-256 key; when present the key is rewrapped to it
    #[serde_as(as = "Option<Base64>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_public_key: Option<Vec<u8>>,
    /// Outcome of the caller's own enforcement point, if it decided first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_allowed: Option<bool>,
    /// Authenticated caller identity, set by the transport and never read from the body
    #[serde(skip)]
    pub caller: Option<String>,
}

impl ReleaseRequest {
    pub fn new(
        resource_id: impl Into<String>,
        kao_id: impl Into<String>,
        wrapped_key: Vec<u8>,
        bearer_credential: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            kao_id: kao_id.into(),
            wrapped_key,
            bearer_credential: bearer_credential.into(),
            correlation_id: correlation_id.into(),
            action: Action::Decrypt,
            client_public_key: None,
            caller_allowed: None,
            caller: None,
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    #[must_use]
    pub fn with_client_public_key(mut self, key: Vec<u8>) -> Self {
        self.client_public_key = Some(key);
        self
    }

    #[must_use]
    pub fn with_caller_allowed(mut self, allowed: bool) -> Self {
        self.caller_allowed = Some(allowed);
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }
}

/// Category of a denied release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DenialCode {
    /// Credential missing, malformed, expired or not verifiable
    AuthenticationInvalid,
    PolicyViolation,
    IntegrityViolation,
    /// A dependency needed to decide was unreachable; the request fails closed
    UpstreamUnavailable,
    /// Caller's enforcement point allowed but this custodian denies
    DivergenceDetected,
    /// Unknown resource or key access object; deliberately uninformative
    AccessDenied,
    /// The key access object belongs to another custodian
    NotCustodian,
    RateLimited,
    InvalidRequest,
}

impl DenialCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialCode::AuthenticationInvalid => "authenticationInvalid",
            DenialCode::PolicyViolation => "policyViolation",
            DenialCode::IntegrityViolation => "integrityViolation",
            DenialCode::UpstreamUnavailable => "upstreamUnavailable",
            DenialCode::DivergenceDetected => "divergenceDetected",
            DenialCode::AccessDenied => "accessDenied",
            DenialCode::NotCustodian => "notCustodian",
            DenialCode::RateLimited => "rateLimited",
            DenialCode::InvalidRequest => "invalidRequest",
        }
    }
}

impl fmt::Display for DenialCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a release; a denial is a value, not an error
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseResponse {
    pub correlation_id: String,
    pub granted: bool,
    /// Raw key (or key share) when no client key was supplied
    #[serde_as(as = "Option<Base64>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<u8>>,
    /// Key rewrapped to the request's client public key
    #[serde_as(as = "Option<Base64>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial: Option<DenialCode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<DenyReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub obligations: Vec<Obligation>,
    pub custodian_id: String,
    pub rule_set_version: String,
}

impl ReleaseResponse {
    pub fn denied(
        correlation_id: impl Into<String>,
        custodian_id: impl Into<String>,
        rule_set_version: impl Into<String>,
        denial: DenialCode,
        reasons: Vec<DenyReason>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            granted: false,
            key: None,
            wrapped_key: None,
            denial: Some(denial),
            reasons,
            obligations: Vec::new(),
            custodian_id: custodian_id.into(),
            rule_set_version: rule_set_version.into(),
        }
    }

    /// The raw released key, if this response carries one
    pub fn key(&self) -> Result<Option<AesKey>, EncryptionError> {
        self.key.as_deref().map(AesKey::from_slice).transpose()
    }
}

impl Drop for ReleaseResponse {
    fn drop(&mut self) {
        if let Some(key) = self.key.as_mut() {
            key.zeroize();
        }
    }
}

impl fmt::Debug for ReleaseResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseResponse")
            .field("correlation_id", &self.correlation_id)
            .field("granted", &self.granted)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("wrapped_key", &self.wrapped_key.as_ref().map(Vec::len))
            .field("denial", &self.denial)
            .field("reasons", &self.reasons)
            .field("custodian_id", &self.custodian_id)
            .finish()
    }
}
