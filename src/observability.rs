//! Tracing and Prometheus metrics for the control plane.

use std::{sync::OnceLock, time::Duration};

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global tracing subscriber. `RUST_LOG` wins when set; JSON
/// output is a deployment choice via `VIGIL_LOG_FORMAT=json`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("VIGIL_LOG_FORMAT").as_deref() == Ok("json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install metrics recorder: {0}")]
    Install(String),
}

/// Install the Prometheus recorder. Idempotent across tests.
pub fn init_metrics() -> Result<(), MetricsError> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

/// Render the current metrics in Prometheus exposition format.
pub fn render() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

pub fn record_config_reload(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("vigil_config_reloads_total", "result" => result).increment(1);
    if success {
        gauge!("vigil_config_last_reload_time").set(now_secs());
    }
}

pub fn record_idp_update(success: bool, duration: Duration) {
    let result = if success { "success" } else { "failure" };
    counter!("vigil_idp_update_total", "result" => result).increment(1);
    gauge!("vigil_idp_last_update_time", "result" => result).set(now_secs());
    if success {
        gauge!("vigil_idp_update_duration").set(duration.as_secs_f64());
    }
}

pub fn record_authz_decision(result: &'static str) {
    counter!("vigil_authz_decisions_total", "result" => result).increment(1);
}

pub fn record_caddy_push(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("vigil_caddy_config_pushes_total", "result" => result).increment(1);
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
