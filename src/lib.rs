//! Policy-bound protected objects and federated key custodians
//!
//! A [`ProtectedObject`] carries its security label and the hashes that
//! bind label, payload and key access objects together. A [`KeyCustodian`]
//! re-verifies the caller's credential, re-fetches the current label and
//! re-runs the same [`DecisionEngine`] before it unwraps anything. The
//! [`federation`] layer forwards requests to the custodian that is
//! authoritative for a key access object.

pub mod archive;
pub mod assurance;
pub mod attributes;
pub mod audit;
pub mod clearance;
pub mod codec;
pub mod config;
pub mod credential;
pub mod crypto;
pub mod custodian;
pub mod error;
pub mod federation;
pub mod integrity;
pub mod jws;
pub mod kem;
pub mod keyring;
pub mod manifest;
pub mod pdp;
pub mod pep;
pub mod policy;
pub mod prelude;
pub mod retry;

pub use archive::{ArchiveError, ObjectArchive, ObjectArchiveBuilder};
pub use attributes::SubjectAttributes;
pub use clearance::Clearance;
pub use codec::{CodecError, IntegrityReport, ProtectedObjectBuilder};
pub use crypto::{AesKey, EncryptionError};
pub use custodian::{KeyCustodian, ReleaseRequest, ReleaseResponse};
pub use error::CoalitionTdfError;
pub use manifest::ProtectedObject;
pub use pdp::{Decision, DecisionEngine, DenyReason};
pub use policy::{PolicyBuilder, PolicyError, SecurityPolicyLabel};
