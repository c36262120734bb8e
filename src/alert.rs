//! Webhook alert worker.
//!
//! Posts confirmed signals to an optional webhook, behind a circuit
//! breaker with a hard call timeout. Failures never propagate back into
//! the pipeline; they only trip the breaker and a counter.

use crate::config::AlertConfig;
use crate::metrics::MetricsCollector;
use crate::models::{ConfirmedSignal, WsServerEvent};
use crate::resilience::CircuitBreaker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub async fn run_alert_worker(
    config: AlertConfig,
    metrics: Arc<MetricsCollector>,
    mut rx: broadcast::Receiver<WsServerEvent>,
) {
    let Some(url) = config.webhook_url.clone() else {
        debug!("no webhook configured, alert worker idle");
        return;
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(config.call_timeout_ms))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build alert http client");
            return;
        }
    };

    let mut breaker = CircuitBreaker::new(
        "alert-webhook",
        config.circuit_breaker_threshold,
        Duration::from_millis(config.half_open_after_ms),
    );
    info!(url = %url, "alert worker started");

    loop {
        let signal: ConfirmedSignal = match rx.recv().await {
            Ok(WsServerEvent::Signal { data, .. }) => data,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "alert worker lagged behind broadcast");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if !breaker.allow() {
            MetricsCollector::incr(&metrics.alerts_failed);
            continue;
        }

        match client.post(&url).json(&signal).send().await {
            Ok(resp) if resp.status().is_success() => {
                breaker.record_success();
                MetricsCollector::incr(&metrics.alerts_sent);
            }
            Ok(resp) => {
                breaker.record_failure();
                MetricsCollector::incr(&metrics.alerts_failed);
                warn!(status = %resp.status(), "webhook rejected alert");
            }
            Err(e) => {
                breaker.record_failure();
                MetricsCollector::incr(&metrics.alerts_failed);
                warn!(error = %e, "webhook call failed");
            }
        }
    }
    info!("alert worker stopped");
}
