//! Coalition TDF Prelude
//!
//! Commonly used types in one import.
//!
//! # Example
//!
//! ```rust
//! use coalition_tdf::prelude::*;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let label = PolicyBuilder::new(Clearance::Secret)
//!     .releasable_to(["FVEY"])
//!     .originating_authority("GBR")
//!     .build()?;
//! let ring = CustodianKeyring::generate();
//! let object = ProtectedObject::builder(label)
//!     .custodian(
//!         CustodianRef::new("gbr", "https://kas.gbr.example"),
//!         ring.wrapping_key(WrapAlgorithm::A256GcmKw)?,
//!     )
//!     .build(b"briefing")?;
//! assert!(object.verify().is_intact());
//! # Ok(())
//! # }
//! ```

// Decisions
pub use crate::assurance::{AssuranceLevel, AuthFactor, AuthenticationContext};
pub use crate::attributes::SubjectAttributes;
pub use crate::clearance::Clearance;
pub use crate::pdp::{
    Action, Decision, DecisionContext, DecisionEngine, DenyReason, DeploymentRules,
    IntegrityStatus, Obligation, RuleSetVersion,
};
pub use crate::policy::{CoiRequirement, PolicyBuilder, PolicyError, SecurityPolicyLabel};

// Protected objects
pub use crate::archive::{ArchiveError, ObjectArchive, ObjectArchiveBuilder};
pub use crate::codec::{CodecError, CustodianRecipient, IntegrityReport, ProtectedObjectBuilder};
pub use crate::crypto::{AesKey, EncryptionError};
pub use crate::kem::{KemError, WrapAlgorithm};
pub use crate::keyring::{CustodianKeyring, WrappingKey};
pub use crate::manifest::{CustodianRef, KeyAccessObject, KeyReleaseMode, ProtectedObject};

// Custodian and federation
pub use crate::audit::{AuditEvent, AuditSink, BoundedAuditSink, MemoryAuditSink};
pub use crate::config::CustodianConfig;
pub use crate::credential::{CredentialError, CredentialVerifier, IssuerKeySet};
pub use crate::custodian::{
    DenialCode, InMemoryDirectory, KeyCustodian, ReleaseRequest, ReleaseResponse,
    ResourceDirectory,
};
pub use crate::error::CoalitionTdfError;
pub use crate::federation::{FederationRouter, RemoteChannel, TrustRegistry};
pub use crate::pep::{EnforcementPoint, PepError};
