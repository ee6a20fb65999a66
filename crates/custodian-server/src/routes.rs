//! HTTP surface of the custodian
//!
//! # Endpoints
//!
//! - `POST /v1/key/release` - release request; 200 on grant, 403 with the same body on denial
//! - `GET /v1/policy/:resource_id` - current policy section, peers only
//! - `GET /v1/rule-set/version` - guardrail version for reconciliation
//! - `GET /health` - liveness and registry generation
//! - `GET /metrics` - Prometheus text exposition

use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use coalition_tdf::custodian::{DenialCode, DirectoryError, ReleaseRequest, ReleaseResponse};
use coalition_tdf::federation::{PeerAuthError, RuleSetVersionBody, HEADER_CUSTODIAN_ID};
use serde_json::json;
use tracing::{debug, warn};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/v1/key/release", post(release))
        .route("/v1/policy/:resource_id", get(policy))
        .route("/v1/rule-set/version", get(rule_set_version))
        .with_state(state)
}

/// Peer custodian making this call, if the caller claims to be one
///
/// Calls without a custodian id header are end-user enforcement points and
/// are rate limited together. A claimed custodian id must be backed by the
/// credential its registry entry names.
fn authenticate_caller(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<String>, PeerAuthError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    if header(HEADER_CUSTODIAN_ID).is_none() {
        return Ok(None);
    }
    let snapshot = state.registry.snapshot();
    let peer = state.peers.authenticate(&snapshot, header, body, Utc::now())?;
    debug!(peer = %peer, "peer custodian authenticated");
    Ok(Some(peer))
}

fn denied(state: &AppState, correlation_id: &str, code: DenialCode) -> ReleaseResponse {
    ReleaseResponse::denied(
        correlation_id,
        state.custodian.custodian_id(),
        state.custodian.rule_set_version().0,
        code,
        Vec::new(),
    )
}

pub async fn release(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<ReleaseResponse>) {
    metrics::increment_gauge!("custodian_requests_in_flight", 1.0);
    let _in_flight = scopeguard::guard((), |_| {
        metrics::decrement_gauge!("custodian_requests_in_flight", 1.0);
    });

    let mut request: ReleaseRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "malformed release request");
            return (
                StatusCode::BAD_REQUEST,
                Json(denied(&state, "", DenialCode::InvalidRequest)),
            );
        }
    };

    match authenticate_caller(&state, &headers, &body) {
        Ok(caller) => request.caller = caller,
        Err(e) => {
            warn!(error = %e, code = e.error_code(), "peer authentication failed");
            metrics::increment_counter!("custodian_peer_auth_failures_total");
            return (
                StatusCode::UNAUTHORIZED,
                Json(denied(&state, &request.correlation_id, DenialCode::AuthenticationInvalid)),
            );
        }
    }

    let response = state.custodian.release(request).await;
    let status = if response.granted {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };
    (status, Json(response))
}

pub async fn policy(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match authenticate_caller(&state, &headers, b"") {
        Ok(Some(_)) => {}
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => {
            warn!(error = %e, "peer authentication failed");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    match state.custodian.current_policy(&resource_id).await {
        Ok(policy) => Json(policy).into_response(),
        Err(DirectoryError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(DirectoryError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(e) => {
            warn!(resource_id = %resource_id, error = %e, "stored policy unreadable");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn rule_set_version(State(state): State<AppState>) -> Json<RuleSetVersionBody> {
    Json(RuleSetVersionBody {
        custodian_id: state.custodian.custodian_id().to_string(),
        rule_set_version: state.custodian.rule_set_version().0,
    })
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "custodianId": state.custodian.custodian_id(),
        "ruleSetVersion": state.custodian.rule_set_version().0,
        "registryGeneration": state.registry.snapshot().generation(),
    }))
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
