//! Periodic comparison of rule-set versions across custodians
//!
//! Drift is an operational alert only; it never changes a decision.

use super::router::FederationRouter;
use crate::pdp::RuleSetVersion;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum VersionAlert {
    VersionDrift {
        custodian_id: String,
        local: String,
        remote: String,
    },
    Unreachable {
        custodian_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub checked_at: DateTime<Utc>,
    pub local_version: String,
    pub peers_checked: usize,
    pub alerts: Vec<VersionAlert>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.alerts.is_empty()
    }
}

pub struct Reconciler {
    router: Arc<FederationRouter>,
    local_version: RuleSetVersion,
}

impl Reconciler {
    pub fn new(router: Arc<FederationRouter>, local_version: RuleSetVersion) -> Self {
        Self {
            router,
            local_version,
        }
    }

    /// Ask every non-suspended peer for its version
    pub async fn run_once(&self) -> ReconciliationReport {
        let snapshot = self.router.registry().snapshot();
        let peers: Vec<String> = snapshot
            .entries()
            .filter(|e| !e.is_suspended() && e.custodian_id != self.router.local_id())
            .map(|e| e.custodian_id.clone())
            .collect();

        let answers = join_all(peers.iter().map(|id| self.router.rule_set_version(id))).await;

        let mut alerts = Vec::new();
        for (custodian_id, answer) in peers.iter().zip(answers) {
            match answer {
                Ok(remote) if remote == self.local_version => {}
                Ok(remote) => {
                    warn!(
                        peer = %custodian_id,
                        local = %self.local_version,
                        remote = %remote,
                        "rule-set version drift"
                    );
                    metrics::increment_counter!("federation_version_drift_total", "peer" => custodian_id.clone());
                    alerts.push(VersionAlert::VersionDrift {
                        custodian_id: custodian_id.clone(),
                        local: self.local_version.0.clone(),
                        remote: remote.0,
                    });
                }
                Err(e) => {
                    warn!(peer = %custodian_id, error = %e, "peer version unavailable");
                    alerts.push(VersionAlert::Unreachable {
                        custodian_id: custodian_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let report = ReconciliationReport {
            checked_at: Utc::now(),
            local_version: self.local_version.0.clone(),
            peers_checked: peers.len(),
            alerts,
        };
        info!(
            peers = report.peers_checked,
            alerts = report.alerts.len(),
            "reconciliation complete"
        );
        report
    }

    /// Run every `interval` until the task is aborted
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
