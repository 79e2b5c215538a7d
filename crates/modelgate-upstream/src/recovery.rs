use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use reqwest::Method;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::manager::ManagerSettings;
use crate::provider::Provider;

const PROBE_MODELS_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// One recovery loop per Manager. Wakes every `health_check_period`, probes
/// unhealthy entries, and exits when the stop signal fires or its sender is
/// dropped.
pub(crate) fn spawn(
    providers: Vec<Arc<Provider>>,
    settings: ManagerSettings,
    mut stop: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.health_check_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Interval fires immediately; discard so the first pass waits a full period.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    run_pass(&providers, &settings).await;
                    // Probes may outlast the period; rearm a full period so a slow
                    // pass is not followed by an immediate re-entry.
                    ticker.reset();
                }
            }
        }
    });
}

async fn run_pass(providers: &[Arc<Provider>], settings: &ManagerSettings) {
    for provider in providers {
        for (upstream, health) in provider.health_entries() {
            if health.is_healthy() {
                continue;
            }
            let Ok(_gate) = health.probe_gate().try_lock() else {
                continue;
            };
            if !health.begin_probe(settings.recovery_interval.as_secs() as i64) {
                continue;
            }
            if probe(provider, upstream).await {
                health.mark_recovered();
                info!(
                    provider = %provider.name(),
                    upstream = %upstream,
                    "upstream recovered after probe"
                );
            } else {
                debug!(
                    provider = %provider.name(),
                    upstream = %upstream,
                    "recovery probe failed"
                );
            }
        }
    }
}

/// Two-step availability probe: the models listing must answer 200, then a
/// minimal one-token completion must answer 200 or 400. A 400 still proves the
/// endpoint is reachable; it merely rejected the probe payload.
async fn probe(provider: &Provider, upstream: &str) -> bool {
    let models = tokio::time::timeout(
        PROBE_MODELS_TIMEOUT,
        provider.request(Method::GET, "/v1/models", Bytes::new(), &HeaderMap::new()),
    )
    .await;
    match models {
        Ok(Ok(response)) if response.status().as_u16() == 200 => {}
        _ => return false,
    }

    let body = json!({
        "model": upstream,
        "messages": [{"role": "user", "content": "hi"}],
        "max_tokens": 1,
        "stream": false,
    });
    let body = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
    let completion = tokio::time::timeout(
        PROBE_COMPLETION_TIMEOUT,
        provider.request(Method::POST, "/v1/chat/completions", body, &HeaderMap::new()),
    )
    .await;
    match completion {
        Ok(Ok(response)) => matches!(response.status().as_u16(), 200 | 400),
        _ => false,
    }
}
