//! Custodian configuration
//!
//! One JSON document per deployment. Every field has a default, so an empty
//! object `{}` is a valid (if not very useful) configuration. The trust
//! registry, issuer keys and keyring live in their own files referenced from
//! here.

use crate::assurance::AssuranceLevel;
use crate::clearance::Clearance;
use crate::pdp::Action;
use crate::policy::{is_coi_name, is_country_code};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_CONFIG_PATH: &str = "CUSTODIAN_CONFIG";
pub const ENV_CUSTODIAN_ID: &str = "CUSTODIAN_ID";
pub const ENV_LISTEN_ADDR: &str = "CUSTODIAN_LISTEN_ADDR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl ConfigError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "CTDF_E_CONFIG_IO",
            ConfigError::Parse { .. } => "CTDF_E_CONFIG_PARSE",
            ConfigError::Invalid(_) => "CTDF_E_CONFIG_INVALID",
        }
    }
}

/// Read and parse a JSON file into `T`
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Minimum authentication strength for one classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequirement {
    pub min_assurance: AssuranceLevel,
    pub min_factors: usize,
}

impl AuthRequirement {
    pub const fn new(min_assurance: AssuranceLevel, min_factors: usize) -> Self {
        Self {
            min_assurance,
            min_factors,
        }
    }
}

/// A COI that cannot be held together with any of `excludes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoiExclusion {
    pub coi: String,
    pub excludes: BTreeSet<String>,
}

/// Global guardrail settings; their digest is the rule-set version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub auth_requirements: BTreeMap<Clearance, AuthRequirement>,
    /// Reject classified access when authentication is older than this
    pub max_auth_age_secs: Option<u64>,
    pub embargo_skew_secs: u64,
    pub coi_exclusions: Vec<CoiExclusion>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut auth_requirements = BTreeMap::new();
        auth_requirements.insert(
            Clearance::Unclassified,
            AuthRequirement::new(AssuranceLevel::Aal1, 1),
        );
        auth_requirements.insert(
            Clearance::Confidential,
            AuthRequirement::new(AssuranceLevel::Aal2, 2),
        );
        auth_requirements.insert(Clearance::Secret, AuthRequirement::new(AssuranceLevel::Aal2, 2));
        auth_requirements.insert(
            Clearance::TopSecret,
            AuthRequirement::new(AssuranceLevel::Aal3, 2),
        );

        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        let coi_exclusions = vec![
            CoiExclusion {
                coi: "US-ONLY".to_string(),
                excludes: set(&["CAN-US", "EU-RESTRICTED", "FVEY", "GBR-US", "NATO", "NATO-COSMIC"]),
            },
            CoiExclusion {
                coi: "EU-RESTRICTED".to_string(),
                excludes: set(&["NATO-COSMIC", "US-ONLY"]),
            },
        ];

        Self {
            auth_requirements,
            max_auth_age_secs: None,
            embargo_skew_secs: 300,
            coi_exclusions,
        }
    }
}

impl EngineConfig {
    /// Requirement for `classification`, falling back to the nearest lower level configured
    pub fn auth_requirement(&self, classification: Clearance) -> AuthRequirement {
        self.auth_requirements
            .range(..=classification)
            .next_back()
            .map(|(_, r)| *r)
            .unwrap_or(AuthRequirement::new(AssuranceLevel::Aal1, 1))
    }
}

/// Optional per-deployment restrictions, evaluated after the global guardrails
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentRuleConfig {
    /// Nation operating this deployment; subjects from elsewhere are foreign
    pub home_country: String,
    pub blocked_countries: BTreeSet<String>,
    /// Empty = every action allowed
    pub allowed_actions: BTreeSet<Action>,
    /// Foreign subjects must hold at least one of these
    pub foreign_required_coi: BTreeSet<String>,
    pub foreign_max_classification: Option<Clearance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub policy_fetch_ms: u64,
    pub issuer_key_fetch_ms: u64,
    pub forward_ms: u64,
    pub audit_enqueue_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            policy_fetch_ms: 2_000,
            issuer_key_fetch_ms: 2_000,
            forward_ms: 5_000,
            audit_enqueue_ms: 250,
        }
    }
}

impl TimeoutConfig {
    pub fn policy_fetch(&self) -> Duration {
        Duration::from_millis(self.policy_fetch_ms)
    }

    pub fn issuer_key_fetch(&self) -> Duration {
        Duration::from_millis(self.issuer_key_fetch_ms)
    }

    pub fn forward(&self) -> Duration {
        Duration::from_millis(self.forward_ms)
    }

    pub fn audit_enqueue(&self) -> Duration {
        Duration::from_millis(self.audit_enqueue_ms)
    }
}

/// Bounded exponential backoff for idempotent fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub key_ttl_secs: u64,
    pub key_capacity: usize,
    pub issuer_key_ttl_secs: u64,
    /// Floor between issuer key fetches triggered by unknown key ids
    pub issuer_key_min_refresh_secs: u64,
    /// Used by enforcement points for their local (non-authoritative) decision
    pub policy_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_ttl_secs: 30,
            key_capacity: 1_024,
            issuer_key_ttl_secs: 300,
            issuer_key_min_refresh_secs: 30,
            policy_ttl_secs: 60,
        }
    }
}

/// Token bucket per caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 20,
            refill_per_sec: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditConfig {
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialConfig {
    pub max_clock_skew_secs: u64,
    /// Empty = any issuer with a known key
    pub accepted_issuers: BTreeSet<String>,
    /// JSON key-set endpoint, used instead of `issuerKeysPath` when set
    pub issuer_keys_url: Option<String>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 60,
            accepted_issuers: BTreeSet::new(),
            issuer_keys_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustodianConfig {
    pub custodian_id: String,
    pub listen_addr: String,
    pub trust_registry_path: Option<PathBuf>,
    pub issuer_keys_path: Option<PathBuf>,
    pub keyring_path: Option<PathBuf>,
    /// Directory of `<resourceId>.tdf` archives; in-memory when unset
    pub resource_dir: Option<PathBuf>,
    /// PKCS#8 PEM key signing outbound `signedToken` peer calls
    pub peer_signing_key_path: Option<PathBuf>,
    /// Certificate chain and key presented to `mutualTls` peers
    pub client_identity_path: Option<PathBuf>,
    pub reconcile_interval_secs: u64,
    pub engine: EngineConfig,
    pub deployment_rules: Option<DeploymentRuleConfig>,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub audit: AuditConfig,
    pub credential: CredentialConfig,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        Self {
            custodian_id: "local".to_string(),
            listen_addr: "127.0.0.1:8443".to_string(),
            trust_registry_path: None,
            issuer_keys_path: None,
            keyring_path: None,
            resource_dir: None,
            peer_signing_key_path: None,
            client_identity_path: None,
            reconcile_interval_secs: 300,
            engine: EngineConfig::default(),
            deployment_rules: None,
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            audit: AuditConfig::default(),
            credential: CredentialConfig::default(),
        }
    }
}

impl CustodianConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }

    /// Load from `CUSTODIAN_CONFIG` (defaults when unset), apply env overrides, validate
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(ENV_CONFIG_PATH) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `CUSTODIAN_ID` / `CUSTODIAN_LISTEN_ADDR` from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup(ENV_CUSTODIAN_ID) {
            self.custodian_id = id;
        }
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            self.listen_addr = addr;
        }
    }

    /// Check every field, reporting all problems at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.custodian_id.trim().is_empty() {
            problems.push("custodianId must not be empty".to_string());
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!("listenAddr '{}' is not a socket address", self.listen_addr));
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.maxAttempts must be at least 1".to_string());
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            problems.push("retry.initialBackoffMs exceeds retry.maxBackoffMs".to_string());
        }
        if self.audit.queue_capacity == 0 {
            problems.push("audit.queueCapacity must be at least 1".to_string());
        }
        if self.rate_limit.burst == 0 || self.rate_limit.refill_per_sec <= 0.0 {
            problems.push("rateLimit.burst and rateLimit.refillPerSec must be positive".to_string());
        }
        for (name, ms) in [
            ("policyFetchMs", self.timeouts.policy_fetch_ms),
            ("issuerKeyFetchMs", self.timeouts.issuer_key_fetch_ms),
            ("forwardMs", self.timeouts.forward_ms),
            ("auditEnqueueMs", self.timeouts.audit_enqueue_ms),
        ] {
            if ms == 0 {
                problems.push(format!("timeouts.{} must be positive", name));
            }
        }
        for exclusion in &self.engine.coi_exclusions {
            for name in std::iter::once(&exclusion.coi).chain(exclusion.excludes.iter()) {
                if !is_coi_name(name) {
                    problems.push(format!("engine.coiExclusions: '{}' is not a COI name", name));
                }
            }
        }
        if let Some(rules) = &self.deployment_rules {
            if !is_country_code(&rules.home_country) {
                problems.push(format!(
                    "deploymentRules.homeCountry '{}' is not an alpha-3 code",
                    rules.home_country
                ));
            }
            for code in &rules.blocked_countries {
                if !is_country_code(code) {
                    problems.push(format!(
                        "deploymentRules.blockedCountries: '{}' is not an alpha-3 code",
                        code
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
