//! Coalition key custodian service
//!
//! Configuration comes from the JSON file named by `CUSTODIAN_CONFIG`, with
//! `CUSTODIAN_ID` and `CUSTODIAN_LISTEN_ADDR` overriding it. Send SIGHUP to
//! reload the trust registry without a restart.

mod error;
mod routes;
mod state;

use coalition_tdf::config::CustodianConfig;
use coalition_tdf::federation::{Reconciler, TrustRegistry};
use error::ServerError;
use metrics_exporter_prometheus::PrometheusBuilder;
use state::Service;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, code = e.error_code(), "custodian stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let config = CustodianConfig::from_env()?;
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;

    let Service { state, audit_task } = state::build(&config)?;
    let state = state.with_metrics(metrics);

    spawn_registry_reload(state.registry.clone());

    let reconciler = if config.reconcile_interval_secs > 0 && !state.registry.snapshot().is_empty() {
        let reconciler = Arc::new(Reconciler::new(
            state.router.clone(),
            state.custodian.rule_set_version(),
        ));
        Some(reconciler.spawn(Duration::from_secs(config.reconcile_interval_secs)))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(
        addr = %config.listen_addr,
        custodian_id = %config.custodian_id,
        "custodian listening"
    );

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = reconciler {
        handle.abort();
    }
    // the drain task ends once the last audit sender is dropped
    if tokio::time::timeout(Duration::from_secs(5), audit_task).await.is_err() {
        warn!("audit queue not drained before exit");
    }
    info!("custodian shut down");
    Ok(())
}

#[cfg(unix)]
fn spawn_registry_reload(registry: Arc<TrustRegistry>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                error!(error = %e, "cannot listen for SIGHUP; registry reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received; reloading trust registry");
            if let Err(e) = registry.reload() {
                metrics::increment_counter!("federation_registry_reload_failures_total");
                warn!(code = e.error_code(), "previous trust registry stays active");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_registry_reload(_registry: Arc<TrustRegistry>) {
    warn!("registry reload on SIGHUP is only available on unix");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl+C");
        futures::future::pending::<()>().await;
    }
    info!("shutting down");
}
