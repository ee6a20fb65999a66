use crate::custodian::{DirectoryError, KeyCustodian, ReleaseRequest, ReleaseResponse};
use crate::manifest::PolicySection;
use crate::pdp::RuleSetVersion;
use crate::retry::Retryable;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to a peer custodian; never an authorization outcome
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Peer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Peer unavailable: {0}")]
    Unavailable(String),

    #[error("Peer rejected our authentication")]
    AuthenticationFailed,

    #[error("Resource not found at peer: {0}")]
    NotFound(String),

    #[error("Invalid response from peer: {0}")]
    InvalidResponse(String),

    #[error("Cannot build channel: {0}")]
    Configuration(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl ChannelError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ChannelError::Timeout(_) => "CTDF_E_CHANNEL_TIMEOUT",
            ChannelError::Unavailable(_) => "CTDF_E_CHANNEL_UNAVAILABLE",
            ChannelError::AuthenticationFailed => "CTDF_E_CHANNEL_AUTH",
            ChannelError::NotFound(_) => "CTDF_E_CHANNEL_NOT_FOUND",
            ChannelError::InvalidResponse(_) => "CTDF_E_CHANNEL_RESPONSE",
            ChannelError::Configuration(_) => "CTDF_E_CHANNEL_CONFIG",
            ChannelError::HttpError(_) => "CTDF_E_CHANNEL_HTTP",
        }
    }
}

impl Retryable for ChannelError {
    fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Timeout(_) | ChannelError::Unavailable(_) => true,
            ChannelError::HttpError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl From<DirectoryError> for ChannelError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(id) => ChannelError::NotFound(id),
            other => ChannelError::Unavailable(other.to_string()),
        }
    }
}

/// One way of reaching a custodian, whatever authenticates the hop
pub trait RemoteChannel: Send + Sync {
    fn custodian_id(&self) -> &str;

    /// Ask the custodian to release; a denial is `Ok`
    fn release(&self, request: ReleaseRequest)
        -> BoxFuture<'_, Result<ReleaseResponse, ChannelError>>;

    fn rule_set_version(&self) -> BoxFuture<'_, Result<RuleSetVersion, ChannelError>>;

    /// Current policy for a resource, without key material
    fn current_policy<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, Result<PolicySection, ChannelError>>;
}

/// Channel to a custodian in the same process
#[derive(Clone)]
pub struct InProcessChannel {
    custodian: Arc<KeyCustodian>,
}

impl InProcessChannel {
    pub fn new(custodian: Arc<KeyCustodian>) -> Self {
        Self { custodian }
    }
}

impl RemoteChannel for InProcessChannel {
    fn custodian_id(&self) -> &str {
        self.custodian.custodian_id()
    }

    fn release(
        &self,
        request: ReleaseRequest,
    ) -> BoxFuture<'_, Result<ReleaseResponse, ChannelError>> {
        Box::pin(async move { Ok(self.custodian.release(request).await) })
    }

    fn rule_set_version(&self) -> BoxFuture<'_, Result<RuleSetVersion, ChannelError>> {
        let version = self.custodian.rule_set_version();
        Box::pin(async move { Ok(version) })
    }

    fn current_policy<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, Result<PolicySection, ChannelError>> {
        Box::pin(async move { Ok(self.custodian.current_policy(resource_id).await?) })
    }
}
