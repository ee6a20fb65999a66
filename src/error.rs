//! Unified error type for the public API
//!
//! Internal modules keep their own error enums for precise handling; this
//! type lets callers that do not care about the subsystem use one `Result`.
//! Authorization outcomes are not errors: a denied release is a
//! [`ReleaseResponse`](crate::custodian::ReleaseResponse) value.

use thiserror::Error;

/// Error from any coalition-tdf operation
///
/// # Error Categories
///
/// - **Policy**: label validation or serialization
/// - **Codec / Archive / Crypto / Integrity / Kem**: building, reading or
///   verifying a protected object
/// - **Credential**: bearer credential verification
/// - **Directory / Channel / Route / Registry / PeerAuth**: reaching
///   authoritative state or a peer custodian
/// - **Audit**: the audit sink refused an event
/// - **Config**: startup configuration
#[derive(Debug, Error)]
pub enum CoalitionTdfError {
    #[error("Policy error: {0}")]
    Policy(#[from] crate::policy::PolicyError),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("Archive error: {0}")]
    Archive(#[from] crate::archive::ArchiveError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::EncryptionError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] crate::integrity::IntegrityError),

    #[error("Key wrapping error: {0}")]
    Kem(#[from] crate::kem::KemError),

    #[error("Credential error: {0}")]
    Credential(#[from] crate::credential::CredentialError),

    #[error("Directory error: {0}")]
    Directory(#[from] crate::custodian::DirectoryError),

    #[error("Channel error: {0}")]
    Channel(#[from] crate::federation::ChannelError),

    #[error("Routing error: {0}")]
    Route(#[from] crate::federation::RouteError),

    #[error("Trust registry error: {0}")]
    Registry(#[from] crate::federation::RegistryError),

    #[error("Peer authentication error: {0}")]
    PeerAuth(#[from] crate::federation::PeerAuthError),

    #[error("Audit error: {0}")]
    Audit(#[from] crate::audit::AuditError),

    #[error("Enforcement error: {0}")]
    Enforcement(#[from] crate::pep::PepError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl CoalitionTdfError {
    /// Returns true if the error is potentially retryable
    ///
    /// Only transport-level failures qualify; nothing that determines a
    /// decision is ever retried.
    pub fn is_retryable(&self) -> bool {
        use crate::retry::Retryable;
        match self {
            Self::Credential(e) => e.is_retryable(),
            Self::Directory(e) => e.is_retryable(),
            Self::Channel(e) => e.is_retryable(),
            Self::Route(crate::federation::RouteError::Channel(e)) => e.is_retryable(),
            Self::Audit(crate::audit::AuditError::QueueFull(_)) => true,
            _ => false,
        }
    }

    /// Stable `CTDF_E_*` code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Policy(e) => e.error_code(),
            Self::Codec(e) => e.error_code(),
            Self::Archive(e) => e.error_code(),
            Self::Crypto(e) => e.error_code(),
            Self::Integrity(e) => e.error_code(),
            Self::Kem(e) => e.error_code(),
            Self::Credential(e) => e.error_code(),
            Self::Directory(e) => e.error_code(),
            Self::Channel(e) => e.error_code(),
            Self::Route(e) => e.error_code(),
            Self::Registry(e) => e.error_code(),
            Self::PeerAuth(e) => e.error_code(),
            Self::Audit(e) => e.error_code(),
            Self::Enforcement(e) => e.error_code(),
            Self::Config(e) => e.error_code(),
        }
    }

    /// Returns a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Policy(e) => e.suggestion(),
            Self::Credential(crate::credential::CredentialError::Expired) => {
                Some("Obtain a fresh credential from the identity provider")
            }
            Self::Credential(crate::credential::CredentialError::UnknownKey { .. }) => {
                Some("Check that the issuer's signing key is published in the issuer key set")
            }
            Self::Registry(_) => Some("Fix the trust registry file; the previous snapshot stays active"),
            Self::Config(crate::config::ConfigError::Invalid(_)) => {
                Some("Correct the listed configuration fields and restart")
            }
            _ => None,
        }
    }

    /// Returns true if a hash or keyed binding failed to verify
    pub fn is_integrity_error(&self) -> bool {
        match self {
            Self::Integrity(_) => true,
            Self::Codec(e) => e.is_integrity_failure(),
            _ => false,
        }
    }

    pub fn is_credential_error(&self) -> bool {
        matches!(self, Self::Credential(_))
    }
}
