//! Append-only decision audit
//!
//! Every key-release decision produces an [`AuditEvent`]. The production sink
//! is a bounded queue drained by a background task that emits each event as a
//! structured `tracing` record on the `audit` target and updates the release
//! metrics. Enqueueing blocks for at most the configured timeout and then
//! surfaces an error to the custodian.

use crate::pdp::{Action, DenyReason};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit queue full after {0:?}")]
    QueueFull(Duration),

    #[error("Audit sink closed")]
    Closed,
}

impl AuditError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuditError::QueueFull(_) => "CTDF_E_AUDIT_QUEUE_FULL",
            AuditError::Closed => "CTDF_E_AUDIT_CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditEventType {
    KeyRelease,
    /// The caller had allowed locally but the custodian denied
    DivergenceDetected,
    /// Request sent on to another deployment's custodian
    Forwarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuditOutcome {
    Granted,
    Denied,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Granted => "granted",
            AuditOutcome::Denied => "denied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub custodian_id: String,
    /// Empty when the credential could not be verified
    pub subject_id: String,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kao_id: Option<String>,
    pub action: Action,
    pub outcome: AuditOutcome,
    /// Stable denial code; absent on grant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<DenyReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub latency_ms: u64,
    pub divergence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    pub rule_set_version: String,
}

impl AuditEvent {
    /// Copy of a denied release event recorded as a divergence
    pub fn as_divergence(&self) -> Self {
        Self {
            event_type: AuditEventType::DivergenceDetected,
            divergence: true,
            ..self.clone()
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<(), AuditError>>;
}

fn emit(event: &AuditEvent) {
    let reasons: Vec<&str> = event.reasons.iter().map(DenyReason::code).collect();
    let json = serde_json::to_string(event).unwrap_or_default();
    match event.event_type {
        AuditEventType::DivergenceDetected => warn!(
            target: "audit",
            correlation_id = %event.correlation_id,
            subject = %event.subject_id,
            resource = %event.resource_id,
            reasons = ?reasons,
            event = %json,
            "divergence detected"
        ),
        _ => info!(
            target: "audit",
            event_type = ?event.event_type,
            correlation_id = %event.correlation_id,
            subject = %event.subject_id,
            resource = %event.resource_id,
            outcome = event.outcome.as_str(),
            denial = event.denial.as_deref().unwrap_or(""),
            latency_ms = event.latency_ms,
            event = %json,
            "audit"
        ),
    }

    match event.event_type {
        AuditEventType::KeyRelease => {
            metrics::increment_counter!("custodian_release_total", "outcome" => event.outcome.as_str());
            metrics::histogram!("custodian_release_latency_ms", event.latency_ms as f64);
        }
        AuditEventType::DivergenceDetected => {
            metrics::increment_counter!("custodian_divergence_total");
        }
        AuditEventType::Forwarded => {
            metrics::increment_counter!("custodian_forward_total", "outcome" => event.outcome.as_str());
        }
    }
}

/// Bounded queue drained by a background task
#[derive(Clone)]
pub struct BoundedAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    enqueue_timeout: Duration,
}

impl BoundedAuditSink {
    /// Start the drain task; it ends when every sender is dropped
    pub fn spawn(capacity: usize, enqueue_timeout: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                emit(&event);
            }
            info!(target: "audit", "audit sink drained");
        });
        (
            Self {
                tx,
                enqueue_timeout,
            },
            handle,
        )
    }
}

impl AuditSink for BoundedAuditSink {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<(), AuditError>> {
        Box::pin(async move {
            match self.tx.send_timeout(event, self.enqueue_timeout).await {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(event)) => {
                    error!(
                        correlation_id = %event.correlation_id,
                        "audit queue full; event not recorded"
                    );
                    Err(AuditError::QueueFull(self.enqueue_timeout))
                }
                Err(SendTimeoutError::Closed(_)) => Err(AuditError::Closed),
            }
        })
    }
}

/// Keeps events in memory; for tests and embedded enforcement points
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> BoxFuture<'_, Result<(), AuditError>> {
        emit(&event);
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> AuditEvent {
        AuditEvent {
            event_type: AuditEventType::KeyRelease,
            timestamp: Utc::now(),
            correlation_id: id.to_string(),
            custodian_id: "usa".to_string(),
            subject_id: "alice".to_string(),
            resource_id: "doc-1".to_string(),
            kao_id: Some("kao-0".to_string()),
            action: Action::Decrypt,
            outcome: AuditOutcome::Denied,
            denial: Some("policyViolation".to_string()),
            reasons: vec![DenyReason::InsufficientClearance {
                required: crate::clearance::Clearance::Secret,
                held: crate::clearance::Clearance::Confidential,
            }],
            detail: None,
            latency_ms: 3,
            divergence: false,
            caller: None,
            rule_set_version: "sha256:00".to_string(),
        }
    }

    #[tokio::test]
    async fn test_memory_sink_records_in_order() {
        let sink = MemoryAuditSink::new();
        sink.record(event("a")).await.unwrap();
        sink.record(event("b").as_divergence()).await.unwrap();
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].correlation_id, "a");
        assert!(events[1].divergence);
        assert_eq!(events[1].event_type, AuditEventType::DivergenceDetected);
    }

    #[tokio::test]
    async fn test_bounded_sink_drains() {
        let (sink, handle) = BoundedAuditSink::spawn(4, Duration::from_millis(50));
        for i in 0..10 {
            sink.record(event(&i.to_string())).await.unwrap();
        }
        drop(sink);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_bounded_sink_surfaces_backpressure() {
        // no drain task: the queue fills and stays full
        let (tx, _rx) = mpsc::channel(1);
        let sink = BoundedAuditSink {
            tx,
            enqueue_timeout: Duration::from_millis(10),
        };
        sink.record(event("first")).await.unwrap();
        assert!(matches!(
            sink.record(event("second")).await,
            Err(AuditError::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_sink() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = BoundedAuditSink {
            tx,
            enqueue_timeout: Duration::from_millis(10),
        };
        assert!(matches!(
            sink.record(event("x")).await,
            Err(AuditError::Closed)
        ));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(event("c")).unwrap();
        assert_eq!(json["eventType"], "keyRelease");
        assert_eq!(json["outcome"], "denied");
        assert_eq!(json["reasons"][0]["reason"], "insufficientClearance");
    }
}
