//! Cross-deployment federation
//!
//! A deployment reaches the custodian that is authoritative for a key access
//! object through the trust registry and a [`RemoteChannel`]. Whatever the
//! peer's authentication method, callers see the same channel interface.

mod channel;
mod http;
mod peer_auth;
mod reconcile;
mod registry;
mod router;

pub use channel::{ChannelError, InProcessChannel, RemoteChannel};
pub use http::{HttpRemoteChannel, RuleSetVersionBody};
pub use peer_auth::{
    LocalIdentity, PeerAuthError, PeerVerifier, HEADER_AUTHORIZATION, HEADER_CLIENT_CERT_SUBJECT,
    HEADER_CUSTODIAN_ID, HEADER_PROXY_TOKEN, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
pub use reconcile::{ReconciliationReport, Reconciler, VersionAlert};
pub use registry::{
    AuthMethod, RegistryError, RegistrySnapshot, TrustRegistry, TrustRegistryEntry, TrustTier,
};
pub use router::{
    ChannelProvider, FederationRouter, HttpChannelProvider, RouteError, StaticChannels,
};
