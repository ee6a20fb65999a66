//! Forwarding of release requests to the authoritative custodian
//!
//! The router only relays. It holds no key material for foreign custodians
//! and never retries a release: a timeout is reported as unavailable and
//! the request is denied.

use super::channel::{ChannelError, InProcessChannel, RemoteChannel};
use super::http::HttpRemoteChannel;
use super::peer_auth::LocalIdentity;
use super::registry::{TrustRegistry, TrustRegistryEntry};
use crate::audit::{AuditEvent, AuditEventType, AuditOutcome, AuditSink};
use crate::custodian::{DenialCode, KeyCustodian, ReleaseRequest, ReleaseResponse};
use crate::jws::UnverifiedJws;
use crate::manifest::PolicySection;
use crate::pdp::RuleSetVersion;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("Custodian not in trust registry: {0}")]
    UnknownCustodian(String),

    #[error("Custodian is suspended: {0}")]
    Suspended(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl RouteError {
    pub fn error_code(&self) -> &'static str {
        match self {
            RouteError::UnknownCustodian(_) => "CTDF_E_ROUTE_UNKNOWN_CUSTODIAN",
            RouteError::Suspended(_) => "CTDF_E_ROUTE_SUSPENDED",
            RouteError::Channel(e) => e.error_code(),
        }
    }

    fn denial(&self) -> DenialCode {
        match self {
            RouteError::Suspended(_) => DenialCode::AccessDenied,
            _ => DenialCode::UpstreamUnavailable,
        }
    }
}

/// Builds the channel for a registry entry
pub trait ChannelProvider: Send + Sync {
    fn channel(&self, entry: &TrustRegistryEntry) -> Result<Arc<dyn RemoteChannel>, ChannelError>;
}

/// Fixed channels by custodian id, e.g. co-located custodians
#[derive(Default, Clone)]
pub struct StaticChannels {
    channels: HashMap<String, Arc<dyn RemoteChannel>>,
}

impl StaticChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: Arc<dyn RemoteChannel>) -> Self {
        self.channels
            .insert(channel.custodian_id().to_string(), channel);
        self
    }

    pub fn with_custodian(self, custodian: Arc<KeyCustodian>) -> Self {
        self.with_channel(Arc::new(InProcessChannel::new(custodian)))
    }
}

impl ChannelProvider for StaticChannels {
    fn channel(&self, entry: &TrustRegistryEntry) -> Result<Arc<dyn RemoteChannel>, ChannelError> {
        self.channels
            .get(&entry.custodian_id)
            .cloned()
            .ok_or_else(|| ChannelError::Configuration(format!("no channel for {}", entry.custodian_id)))
    }
}

/// HTTP channels, rebuilt when a peer's registry entry changes
pub struct HttpChannelProvider {
    identity: LocalIdentity,
    timeout: Duration,
    channels: Mutex<HashMap<String, (TrustRegistryEntry, Arc<dyn RemoteChannel>)>>,
}

impl HttpChannelProvider {
    pub fn new(identity: LocalIdentity, timeout: Duration) -> Self {
        Self {
            identity,
            timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl ChannelProvider for HttpChannelProvider {
    fn channel(&self, entry: &TrustRegistryEntry) -> Result<Arc<dyn RemoteChannel>, ChannelError> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_entry, channel)) = channels.get(&entry.custodian_id) {
            if cached_entry == entry {
                return Ok(channel.clone());
            }
        }
        let channel: Arc<dyn RemoteChannel> = Arc::new(HttpRemoteChannel::new(
            entry.clone(),
            self.identity.clone(),
            self.timeout,
        )?);
        channels.insert(entry.custodian_id.clone(), (entry.clone(), channel.clone()));
        Ok(channel)
    }
}

pub struct FederationRouter {
    local_id: String,
    registry: Arc<TrustRegistry>,
    provider: Arc<dyn ChannelProvider>,
    local: Option<Arc<dyn RemoteChannel>>,
    audit: Option<Arc<dyn AuditSink>>,
    timeout: Duration,
}

impl FederationRouter {
    pub fn new(
        local_id: impl Into<String>,
        registry: Arc<TrustRegistry>,
        provider: Arc<dyn ChannelProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            registry,
            provider,
            local: None,
            audit: None,
            timeout,
        }
    }

    /// Route requests for the local custodian id to this channel
    pub fn with_local(mut self, channel: Arc<dyn RemoteChannel>) -> Self {
        self.local = Some(channel);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn registry(&self) -> &Arc<TrustRegistry> {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn provider(&self) -> &Arc<dyn ChannelProvider> {
        &self.provider
    }

    /// Channel to `custodian_id`, honouring the current registry snapshot
    pub fn channel_for(&self, custodian_id: &str) -> Result<Arc<dyn RemoteChannel>, RouteError> {
        if custodian_id == self.local_id {
            if let Some(local) = &self.local {
                return Ok(local.clone());
            }
        }
        let snapshot = self.registry.snapshot();
        let entry = snapshot
            .get(custodian_id)
            .ok_or_else(|| RouteError::UnknownCustodian(custodian_id.to_string()))?;
        if entry.is_suspended() {
            return Err(RouteError::Suspended(custodian_id.to_string()));
        }
        Ok(self.provider.channel(entry)?)
    }

    /// Relay `request` to `custodian_id` and return its answer
    ///
    /// Routing failures come back as denials, like any other outcome.
    pub async fn forward(&self, custodian_id: &str, mut request: ReleaseRequest) -> ReleaseResponse {
        let span = info_span!(
            "forward",
            custodian_id,
            correlation_id = %request.correlation_id,
        );
        async move {
            let started = Instant::now();
            request.caller = Some(self.local_id.clone());

            let response = match self.route(custodian_id, &request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, code = e.error_code(), "forward failed");
                    ReleaseResponse::denied(
                        request.correlation_id.clone(),
                        custodian_id,
                        "",
                        e.denial(),
                        Vec::new(),
                    )
                }
            };
            debug!(granted = response.granted, "forward complete");

            if let Some(audit) = &self.audit {
                let event = AuditEvent {
                    event_type: AuditEventType::Forwarded,
                    timestamp: Utc::now(),
                    correlation_id: request.correlation_id.clone(),
                    custodian_id: custodian_id.to_string(),
                    subject_id: String::new(),
                    resource_id: request.resource_id.clone(),
                    kao_id: Some(request.kao_id.clone()),
                    action: request.action,
                    outcome: if response.granted {
                        AuditOutcome::Granted
                    } else {
                        AuditOutcome::Denied
                    },
                    denial: response.denial.map(|d| d.as_str().to_string()),
                    reasons: response.reasons.clone(),
                    detail: None,
                    latency_ms: started.elapsed().as_millis() as u64,
                    divergence: false,
                    caller: Some(self.local_id.clone()),
                    rule_set_version: response.rule_set_version.clone(),
                };
                if let Err(e) = audit.record(event).await {
                    error!(error = %e, "forward not audited");
                }
            }
            response
        }
        .instrument(span)
        .await
    }

    async fn route(
        &self,
        custodian_id: &str,
        request: &ReleaseRequest,
    ) -> Result<ReleaseResponse, RouteError> {
        let channel = self.channel_for(custodian_id)?;

        if custodian_id != self.local_id {
            if let Some(entry) = self.registry.get(custodian_id) {
                if let Some(issuer) = credential_issuer(&request.bearer_credential) {
                    if !entry.recognizes_issuer(&issuer) {
                        debug!(issuer = %issuer, "peer does not recognize credential issuer");
                        return Ok(ReleaseResponse::denied(
                            request.correlation_id.clone(),
                            custodian_id,
                            "",
                            DenialCode::AuthenticationInvalid,
                            Vec::new(),
                        ));
                    }
                }
            }
        }

        match tokio::time::timeout(self.timeout, channel.release(request.clone())).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChannelError::Timeout(self.timeout).into()),
        }
    }

    /// Current policy from the authoritative custodian
    pub async fn current_policy(
        &self,
        custodian_id: &str,
        resource_id: &str,
    ) -> Result<PolicySection, RouteError> {
        let channel = self.channel_for(custodian_id)?;
        match tokio::time::timeout(self.timeout, channel.current_policy(resource_id)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChannelError::Timeout(self.timeout).into()),
        }
    }

    pub async fn rule_set_version(&self, custodian_id: &str) -> Result<RuleSetVersion, RouteError> {
        let channel = self.channel_for(custodian_id)?;
        match tokio::time::timeout(self.timeout, channel.rule_set_version()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChannelError::Timeout(self.timeout).into()),
        }
    }
}

/// Issuer named by a credential, read without verification for routing only
fn credential_issuer(token: &str) -> Option<String> {
    let jws = UnverifiedJws::parse(token).ok()?;
    let claims: serde_json::Value = jws.peek_claims().ok()?;
    claims.get("iss")?.as_str().map(str::to_string)
}
