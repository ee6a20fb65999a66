use super::channel::{ChannelError, RemoteChannel};
use super::peer_auth::LocalIdentity;
use super::registry::TrustRegistryEntry;
use crate::custodian::{ReleaseRequest, ReleaseResponse};
use crate::manifest::PolicySection;
use crate::pdp::RuleSetVersion;
use chrono::Utc;
use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Body of `GET /v1/rule-set/version`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetVersionBody {
    pub custodian_id: String,
    pub rule_set_version: String,
}

/// Peer custodian reached over HTTP(S)
pub struct HttpRemoteChannel {
    http_client: Client,
    peer: TrustRegistryEntry,
    identity: LocalIdentity,
}

impl HttpRemoteChannel {
    pub fn new(
        peer: TrustRegistryEntry,
        identity: LocalIdentity,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let mut builder = Client::builder().timeout(timeout);
        if let Some(pem) = identity.client_identity_pem() {
            let client_identity = reqwest::Identity::from_pem(pem)
                .map_err(|e| ChannelError::Configuration(e.to_string()))?;
            builder = builder.identity(client_identity);
        }
        let http_client = builder
            .build()
            .map_err(|e| ChannelError::Configuration(e.to_string()))?;
        Ok(Self {
            http_client,
            peer,
            identity,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.peer.endpoint.trim_end_matches('/'), path)
    }

    fn authenticated(&self, request: RequestBuilder, body: &[u8]) -> Result<RequestBuilder, ChannelError> {
        let headers = self
            .identity
            .outbound_headers(&self.peer, body, Utc::now())
            .map_err(|e| ChannelError::Configuration(e.to_string()))?;
        Ok(headers
            .into_iter()
            .fold(request, |request, (name, value)| request.header(name, value)))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ChannelError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ChannelError::Unavailable(e.to_string())
            } else {
                ChannelError::HttpError(e)
            }
        })
    }
}

async fn error_for_status(response: Response, what: &str) -> ChannelError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => ChannelError::AuthenticationFailed,
        StatusCode::NOT_FOUND => ChannelError::NotFound(what.to_string()),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            ChannelError::Unavailable(format!("HTTP {}: {}", s, body))
        }
        s => ChannelError::InvalidResponse(format!("HTTP {}: {}", s, body)),
    }
}

impl RemoteChannel for HttpRemoteChannel {
    fn custodian_id(&self) -> &str {
        &self.peer.custodian_id
    }

    fn release(
        &self,
        request: ReleaseRequest,
    ) -> BoxFuture<'_, Result<ReleaseResponse, ChannelError>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&request)
                .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;
            let builder = self
                .http_client
                .post(self.url("/v1/key/release"))
                .header("Content-Type", "application/json");
            let builder = self.authenticated(builder, &body)?.body(body);
            let response = self.send(builder).await?;

            // denials travel as 403 with the same body
            match response.status() {
                StatusCode::OK | StatusCode::FORBIDDEN => {
                    let release: ReleaseResponse = response
                        .json()
                        .await
                        .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;
                    debug!(peer = %self.peer.custodian_id, granted = release.granted, "peer answered");
                    Ok(release)
                }
                _ => Err(error_for_status(response, &request.resource_id).await),
            }
        })
    }

    fn rule_set_version(&self) -> BoxFuture<'_, Result<RuleSetVersion, ChannelError>> {
        Box::pin(async move {
            let builder = self.http_client.get(self.url("/v1/rule-set/version"));
            let response = self.send(self.authenticated(builder, b"")?).await?;
            if !response.status().is_success() {
                return Err(error_for_status(response, "rule-set version").await);
            }
            let body: RuleSetVersionBody = response
                .json()
                .await
                .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;
            Ok(RuleSetVersion(body.rule_set_version))
        })
    }

    fn current_policy<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> BoxFuture<'a, Result<PolicySection, ChannelError>> {
        Box::pin(async move {
            let builder = self
                .http_client
                .get(self.url(&format!("/v1/policy/{}", resource_id)));
            let response = self.send(self.authenticated(builder, b"")?).await?;
            if !response.status().is_success() {
                return Err(error_for_status(response, resource_id).await);
            }
            response
                .json()
                .await
                .map_err(|e| ChannelError::InvalidResponse(e.to_string()))
        })
    }
}
