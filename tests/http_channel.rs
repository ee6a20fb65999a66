//! Peer channel behaviour against a mock custodian

mod common;

use coalition_tdf::custodian::{DenialCode, ReleaseRequest, ReleaseResponse};
use coalition_tdf::federation::{
    AuthMethod, ChannelError, FederationRouter, HttpChannelProvider, HttpRemoteChannel,
    LocalIdentity, RemoteChannel, TrustRegistry, TrustRegistryEntry, TrustTier,
};
use coalition_tdf::manifest::ProtectedObject;
use coalition_tdf::pdp::DenyReason;
use common::*;
use mockito::{Matcher, Server};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SHARED_KEY: &[u8] = b"usa-gbr-pairwise-secret-2024";

fn gbr_entry(endpoint: &str) -> TrustRegistryEntry {
    TrustRegistryEntry::new("gbr", endpoint, AuthMethod::SharedKey, TrustTier::Partner)
        .with_shared_key(SHARED_KEY.to_vec())
}

fn channel(endpoint: &str) -> HttpRemoteChannel {
    HttpRemoteChannel::new(
        gbr_entry(endpoint),
        LocalIdentity::new("usa"),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn request() -> ReleaseRequest {
    ReleaseRequest::new("doc-1", "kao-0", vec![7; 40], "eyJhbGciOiJFUzI1NiJ9.e30.sig", "corr-http")
        .with_caller_allowed(true)
}

#[tokio::test]
async fn test_release_grant_is_parsed() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/key/release")
        .match_header("content-type", "application/json")
        .match_header("x-custodian-id", "usa")
        .match_header("x-custodian-signature", Matcher::Regex("^[0-9a-f]{64}$".to_string()))
        .match_body(Matcher::PartialJson(json!({
            "resourceId": "doc-1",
            "kaoId": "kao-0",
            "callerAllowed": true
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "correlationId": "corr-http",
                "granted": true,
                "key": "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=",
                "custodianId": "gbr",
                "ruleSetVersion": "sha256:abc"
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let response = channel(&server.url()).release(request()).await.unwrap();

    mock.assert_async().await;
    assert!(response.granted);
    assert_eq!(response.custodian_id, "gbr");
    let key = response.key().unwrap().unwrap();
    assert_eq!(key.as_slice()[31], 31);
}

#[tokio::test]
async fn test_release_denial_travels_as_403() {
    let mut server = Server::new_async().await;
    let denied = ReleaseResponse::denied(
        "corr-http",
        "gbr",
        "sha256:abc",
        DenialCode::DivergenceDetected,
        vec![DenyReason::NotReleasable {
            country: "USA".to_string(),
        }],
    );
    let mock = server
        .mock("POST", "/v1/key/release")
        .with_status(403)
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_string(&denied).unwrap())
        .create_async()
        .await;

    let response = channel(&server.url()).release(request()).await.unwrap();

    mock.assert_async().await;
    assert!(!response.granted);
    assert_eq!(response.denial, Some(DenialCode::DivergenceDetected));
    assert_eq!(response.reasons[0].code(), "NotReleasable");
}

#[tokio::test]
async fn test_status_codes_map_to_channel_errors() {
    let mut server = Server::new_async().await;
    let unauthorized = server
        .mock("POST", "/v1/key/release")
        .with_status(401)
        .create_async()
        .await;
    let result = channel(&server.url()).release(request()).await;
    assert!(matches!(result, Err(ChannelError::AuthenticationFailed)));
    unauthorized.assert_async().await;
    unauthorized.remove_async().await;

    let unavailable = server
        .mock("POST", "/v1/key/release")
        .with_status(503)
        .with_body("maintenance")
        .create_async()
        .await;
    match channel(&server.url()).release(request()).await {
        Err(e @ ChannelError::Unavailable(_)) => {
            use coalition_tdf::retry::Retryable;
            assert!(e.is_retryable());
        }
        other => panic!("expected Unavailable, got {:?}", other),
    }
    unavailable.assert_async().await;
    unavailable.remove_async().await;

    server
        .mock("POST", "/v1/key/release")
        .with_status(200)
        .with_body("not json")
        .create_async()
        .await;
    assert!(matches!(
        channel(&server.url()).release(request()).await,
        Err(ChannelError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_rule_set_version_and_policy() {
    let issuer = issuer();
    let gbr = Deployment::new("gbr", &issuer);
    let object = ProtectedObject::builder(fvey_secret_label())
        .object_id("doc-1")
        .custodian(gbr.custodian_ref(), gbr.wrapping_key.clone())
        .build(TEST_PLAINTEXT)
        .unwrap();

    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v1/rule-set/version")
        .match_header("x-custodian-id", "usa")
        .with_status(200)
        .with_body(json!({"custodianId": "gbr", "ruleSetVersion": "sha256:feed"}).to_string())
        .create_async()
        .await;
    server
        .mock("GET", "/v1/policy/doc-1")
        .with_status(200)
        .with_body(serde_json::to_string(&object.policy).unwrap())
        .create_async()
        .await;
    server
        .mock("GET", "/v1/policy/doc-2")
        .with_status(404)
        .create_async()
        .await;

    let channel = channel(&server.url());
    assert_eq!(channel.rule_set_version().await.unwrap().0, "sha256:feed");
    assert_eq!(channel.current_policy("doc-1").await.unwrap(), object.policy);
    assert!(matches!(
        channel.current_policy("doc-2").await,
        Err(ChannelError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delegated_oauth_sends_bearer_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v1/rule-set/version")
        .match_header("authorization", "Bearer peer-token-123")
        .with_status(200)
        .with_body(json!({"custodianId": "can", "ruleSetVersion": "sha256:1"}).to_string())
        .expect(1)
        .create_async()
        .await;

    let entry = TrustRegistryEntry::new(
        "can",
        server.url(),
        AuthMethod::DelegatedOAuth,
        TrustTier::Limited,
    );
    let channel = HttpRemoteChannel::new(
        entry,
        LocalIdentity::new("usa").with_oauth_token("peer-token-123"),
        Duration::from_secs(2),
    )
    .unwrap();

    assert_eq!(channel.rule_set_version().await.unwrap().0, "sha256:1");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_router_turns_peer_outage_into_denial() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/v1/key/release")
        .with_status(500)
        .create_async()
        .await;

    let registry = Arc::new(TrustRegistry::from_entries(vec![gbr_entry(&server.url())]).unwrap());
    let router = FederationRouter::new(
        "usa",
        registry,
        Arc::new(HttpChannelProvider::new(
            LocalIdentity::new("usa"),
            Duration::from_secs(2),
        )),
        Duration::from_secs(2),
    );

    let response = router.forward("gbr", request()).await;

    assert!(!response.granted);
    assert!(response.key.is_none());
    assert_eq!(response.denial, Some(DenialCode::UpstreamUnavailable));
}
