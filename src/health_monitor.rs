// Health & Recovery Monitor - fixed-interval probes of dependent services
// with aggregated status, alert/recovery callbacks, and KV-backed history.

use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state_store::StateStore;

/// Default probe interval.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Default probe deadline.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// Consecutive failures at which an alert fires.
pub const ALERT_THRESHOLD: u32 = 3;

/// Consecutive failures at which recovery fires.
pub const RECOVERY_THRESHOLD: u32 = 5;

/// Health history is retained this long.
const HISTORY_TTL: Duration = Duration::from_secs(60 * 60);

const HISTORY_KEY_PREFIX: &str = "monitoring:health:history:";

/// Probe outcome for a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregate across all services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result a custom probe closure reports.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: ServiceStatus,
    pub detail: Option<String>,
}

type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<ProbeOutcome>> + Send + Sync>;

/// How one service is probed.
#[derive(Clone)]
pub enum ProbeTarget {
    /// HTTP GET; 2xx is healthy, 207 degraded, anything else unhealthy.
    HealthUrl(String),
    /// Arbitrary async closure.
    Custom(ProbeFn),
}

/// One monitored service.
#[derive(Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub target: ProbeTarget,
    /// Latency at or above this always raises an alert.
    pub critical_latency: Duration,
}

impl ServiceSpec {
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ProbeTarget::HealthUrl(url.into()),
            critical_latency: Duration::from_secs(5),
        }
    }

    pub fn custom(name: impl Into<String>, probe: ProbeFn) -> Self {
        Self {
            name: name.into(),
            target: ProbeTarget::Custom(probe),
            critical_latency: Duration::from_secs(5),
        }
    }
}

/// Rolling record for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthRecord {
    pub name: String,
    pub status: ServiceStatus,
    pub consecutive_failures: u32,
    pub last_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_checked: chrono::DateTime<Utc>,
}

/// Snapshot served by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: OverallStatus,
    pub services: Vec<ServiceHealthRecord>,
    pub timestamp: chrono::DateTime<Utc>,
}

type HealthCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Periodic prober with aggregated status.
pub struct HealthMonitor {
    services: Vec<ServiceSpec>,
    records: RwLock<HashMap<String, ServiceHealthRecord>>,
    interval: Duration,
    client: reqwest::Client,
    store: Option<Arc<dyn StateStore>>,
    on_alert: Option<HealthCallback>,
    on_recovery: Option<HealthCallback>,
    shutdown: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(services: Vec<ServiceSpec>) -> Arc<Self> {
        Self::with_options(services, PROBE_INTERVAL, None, None, None)
    }

    pub fn with_options(
        services: Vec<ServiceSpec>,
        interval: Duration,
        store: Option<Arc<dyn StateStore>>,
        on_alert: Option<HealthCallback>,
        on_recovery: Option<HealthCallback>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let records = services
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    ServiceHealthRecord {
                        name: s.name.clone(),
                        status: ServiceStatus::Healthy,
                        consecutive_failures: 0,
                        last_latency_ms: 0,
                        last_status_code: None,
                        last_error: None,
                        last_checked: Utc::now(),
                    },
                )
            })
            .collect();
        let client = reqwest::Client::builder()
            .timeout(PROBE_DEADLINE)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            services,
            records: RwLock::new(records),
            interval,
            client,
            store,
            on_alert,
            on_recovery,
            shutdown,
        })
    }

    /// Spawn the probe loop. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.run_probes_once().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("health monitor stopping");
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run one full probe pass and fire callbacks for qualifying services.
    pub async fn run_probes_once(self: &Arc<Self>) {
        let mut alerts = Vec::new();
        let mut recoveries = Vec::new();

        for service in &self.services {
            let started = Instant::now();
            let result = self.probe_service(service).await;
            let latency = started.elapsed();
            let latency_ms = latency.as_millis() as u64;

            let mut records = self.records.write();
            let Some(record) = records.get_mut(&service.name) else {
                continue;
            };
            record.last_checked = Utc::now();
            record.last_latency_ms = latency_ms;

            match result {
                Ok((status, code, detail)) => {
                    record.last_status_code = code;
                    record.status = status;
                    if status == ServiceStatus::Unhealthy {
                        record.consecutive_failures += 1;
                        record.last_error = detail;
                    } else {
                        if record.consecutive_failures >= RECOVERY_THRESHOLD {
                            recoveries.push(service.name.clone());
                        }
                        record.consecutive_failures = 0;
                        record.last_error = None;
                    }
                }
                Err(e) => {
                    record.status = ServiceStatus::Unhealthy;
                    record.last_status_code = None;
                    record.consecutive_failures += 1;
                    record.last_error = Some(e.to_string());
                }
            }

            if record.consecutive_failures >= ALERT_THRESHOLD
                || latency >= service.critical_latency
            {
                alerts.push(service.name.clone());
            }
        }

        if !alerts.is_empty() {
            warn!(services = ?alerts, "health alert threshold reached");
            if let Some(callback) = &self.on_alert {
                callback(&alerts);
            }
        }
        if !recoveries.is_empty() {
            info!(services = ?recoveries, "services recovered");
            if let Some(callback) = &self.on_recovery {
                callback(&recoveries);
            }
        }

        self.persist_history().await;
    }

    async fn probe_service(
        &self,
        service: &ServiceSpec,
    ) -> Result<(ServiceStatus, Option<u16>, Option<String>)> {
        match &service.target {
            ProbeTarget::HealthUrl(url) => {
                let response = self.client.get(url).send().await?;
                let code = response.status().as_u16();
                let status = match code {
                    207 => ServiceStatus::Degraded,
                    c if (200..300).contains(&c) => ServiceStatus::Healthy,
                    _ => ServiceStatus::Unhealthy,
                };
                let detail =
                    (status == ServiceStatus::Unhealthy).then(|| format!("HTTP {code}"));
                Ok((status, Some(code), detail))
            }
            ProbeTarget::Custom(probe) => {
                let outcome = tokio::time::timeout(PROBE_DEADLINE, probe())
                    .await
                    .map_err(|_| anyhow::anyhow!("probe timed out"))??;
                Ok((outcome.status, None, outcome.detail))
            }
        }
    }

    async fn persist_history(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.snapshot();
        let key = format!("{HISTORY_KEY_PREFIX}{}", snapshot.timestamp.timestamp_millis());
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = store.put(&key, json, Some(HISTORY_TTL)).await {
                    warn!("failed to persist health history: {e:#}");
                }
            }
            Err(e) => warn!("failed to encode health snapshot: {e}"),
        }
    }

    /// Current aggregated view. Healthy iff every service is healthy;
    /// unhealthy if any service is unhealthy; degraded otherwise.
    pub fn snapshot(&self) -> HealthSnapshot {
        let records = self.records.read();
        let mut services: Vec<ServiceHealthRecord> = records.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        let status = if services.iter().any(|s| s.status == ServiceStatus::Unhealthy) {
            OverallStatus::Unhealthy
        } else if services.iter().any(|s| s.status == ServiceStatus::Degraded) {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        HealthSnapshot {
            status,
            services,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_probe(status: ServiceStatus) -> ProbeFn {
        Arc::new(move || {
            Box::pin(async move {
                Ok(ProbeOutcome {
                    status,
                    detail: (status == ServiceStatus::Unhealthy)
                        .then(|| "simulated outage".to_string()),
                })
            })
        })
    }

    fn failing_probe() -> ProbeFn {
        Arc::new(|| Box::pin(async { Err(anyhow::anyhow!("connection refused")) }))
    }

    #[tokio::test]
    async fn test_all_healthy_aggregates_healthy() {
        let monitor = HealthMonitor::new(vec![
            ServiceSpec::custom("vector", custom_probe(ServiceStatus::Healthy)),
            ServiceSpec::custom("graph", custom_probe(ServiceStatus::Healthy)),
        ]);
        monitor.run_probes_once().await;
        assert_eq!(monitor.snapshot().status, OverallStatus::Healthy);
    }

    #[tokio::test]
    async fn test_one_degraded_aggregates_degraded() {
        let monitor = HealthMonitor::new(vec![
            ServiceSpec::custom("vector", custom_probe(ServiceStatus::Healthy)),
            ServiceSpec::custom("graph", custom_probe(ServiceStatus::Degraded)),
        ]);
        monitor.run_probes_once().await;
        assert_eq!(monitor.snapshot().status, OverallStatus::Degraded);
    }

    #[tokio::test]
    async fn test_one_unhealthy_aggregates_unhealthy() {
        let monitor = HealthMonitor::new(vec![
            ServiceSpec::custom("vector", custom_probe(ServiceStatus::Healthy)),
            ServiceSpec::custom("graph", failing_probe()),
        ]);
        monitor.run_probes_once().await;
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.status, OverallStatus::Unhealthy);
        let graph = snapshot.services.iter().find(|s| s.name == "graph").unwrap();
        assert_eq!(graph.consecutive_failures, 1);
        assert!(graph.last_error.as_deref().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_alert_fires_at_threshold() {
        let alerted: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let alerted_clone = Arc::clone(&alerted);
        let monitor = HealthMonitor::with_options(
            vec![ServiceSpec::custom("graph", failing_probe())],
            PROBE_INTERVAL,
            None,
            Some(Arc::new(move |services: &[String]| {
                alerted_clone.lock().extend(services.iter().cloned());
            })),
            None,
        );

        for _ in 0..ALERT_THRESHOLD {
            monitor.run_probes_once().await;
        }
        assert!(alerted.lock().contains(&"graph".to_string()));
    }

    #[tokio::test]
    async fn test_failure_counter_resets_on_success() {
        let flip = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flip_clone = Arc::clone(&flip);
        let probe: ProbeFn = Arc::new(move || {
            let fail = flip_clone.load(std::sync::atomic::Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    Err(anyhow::anyhow!("down"))
                } else {
                    Ok(ProbeOutcome {
                        status: ServiceStatus::Healthy,
                        detail: None,
                    })
                }
            })
        });

        let monitor = HealthMonitor::new(vec![ServiceSpec::custom("kv", probe)]);
        monitor.run_probes_once().await;
        monitor.run_probes_once().await;
        flip.store(false, std::sync::atomic::Ordering::SeqCst);
        monitor.run_probes_once().await;

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.services[0].consecutive_failures, 0);
        assert_eq!(snapshot.status, OverallStatus::Healthy);
    }
}
