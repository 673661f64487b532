//! Per-host health records and the capture circuit breaker.
//!
//! Every probe and every capture attempt lands in [`HealthMonitor::record`].
//! A host whose consecutive failures exceed the threshold is `unhealthy` and
//! its circuit is open: captures fail fast until a success or a manual reset.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;

use crate::error::CamError;
use crate::registry::{CameraConfig, CameraStatus};
use crate::transport::{FetchRequest, Transport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Rolling health of one camera host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub consecutive_failures: u32,
    pub total_requests:       u64,
    pub successful_requests:  u64,
    pub average_response_ms:  f64,
    pub last_check:           Option<DateTime<Utc>>,
    pub status:               HealthStatus,
}

impl HealthRecord {
    /// Percentage of successful requests, rounded.
    pub fn success_rate(&self) -> u32 {
        percent(self.successful_requests, self.total_requests)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSummary {
    pub status:               HealthStatus,
    pub success_rate:         u32,
    pub avg_response_time_ms: u64,
    pub consecutive_failures: u32,
}

/// Fleet-wide health snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub per_host:        BTreeMap<String, HostSummary>,
    pub total_cameras:   usize,
    pub healthy_cameras: usize,
    /// Percentage of hosts currently healthy.
    pub health_rate:     u32,
}

pub struct HealthMonitor {
    records:   Mutex<HashMap<String, HealthRecord>>,
    threshold: u32,
}

impl HealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self { records: Mutex::new(HashMap::new()), threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Fold one outcome into the host's record and return its new status.
    pub fn record(&self, host: &str, success: bool, latency: Duration) -> HealthStatus {
        let mut records = self.lock();
        let rec = records.entry(host.to_string()).or_default();
        let previous = rec.status;

        rec.total_requests += 1;
        rec.last_check = Some(Utc::now());
        let ms = latency.as_secs_f64() * 1000.0;
        rec.average_response_ms += (ms - rec.average_response_ms) / rec.total_requests as f64;

        if success {
            rec.successful_requests += 1;
            rec.consecutive_failures = 0;
            rec.status = HealthStatus::Healthy;
        } else {
            rec.consecutive_failures += 1;
            rec.status = if rec.consecutive_failures > self.threshold {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
        }

        if rec.status != previous {
            match rec.status {
                HealthStatus::Unhealthy => warn!(
                    "{host} unhealthy after {} consecutive failures, circuit open",
                    rec.consecutive_failures
                ),
                HealthStatus::Healthy if previous != HealthStatus::Unknown => {
                    info!("{host} healthy again")
                }
                s => debug!("{host} health {previous:?} → {s:?}"),
            }
        }
        rec.status
    }

    pub fn is_circuit_open(&self, host: &str) -> bool {
        self.lock()
            .get(host)
            .is_some_and(|r| r.consecutive_failures > self.threshold)
    }

    /// Record for `host`, `None` before its first probe or capture.
    pub fn status(&self, host: &str) -> Option<HealthRecord> {
        self.lock().get(host).cloned()
    }

    /// Close the circuit for `host` by clearing its failure streak.
    pub fn reset(&self, host: &str) {
        if let Some(rec) = self.lock().get_mut(host) {
            rec.consecutive_failures = 0;
            if rec.status == HealthStatus::Unhealthy {
                rec.status = HealthStatus::Degraded;
            }
            info!("health reset for {host}");
        }
    }

    pub fn reset_all(&self) {
        let mut records = self.lock();
        for rec in records.values_mut() {
            rec.consecutive_failures = 0;
            if rec.status == HealthStatus::Unhealthy {
                rec.status = HealthStatus::Degraded;
            }
        }
        info!("health reset for all {} hosts", records.len());
    }

    pub fn stats(&self) -> HealthStats {
        let records = self.lock();
        let per_host: BTreeMap<String, HostSummary> = records
            .iter()
            .map(|(host, r)| {
                (host.clone(), HostSummary {
                    status:               r.status,
                    success_rate:         r.success_rate(),
                    avg_response_time_ms: r.average_response_ms.round() as u64,
                    consecutive_failures: r.consecutive_failures,
                })
            })
            .collect();
        let total_cameras = per_host.len();
        let healthy_cameras = per_host
            .values()
            .filter(|s| s.status == HealthStatus::Healthy)
            .count();
        HealthStats {
            per_host,
            total_cameras,
            healthy_cameras,
            health_rate: percent(healthy_cameras as u64, total_cameras as u64),
        }
    }

    /// Probe `cam`'s base URL without credentials and record the outcome.
    ///
    /// Any HTTP answer below 500 counts as reachable. The returned status is
    /// what the registry should store for the camera.
    pub async fn probe(
        &self,
        cam:       &CameraConfig,
        transport: &dyn Transport,
        client:    &Client,
        timeout:   Duration,
    ) -> CameraStatus {
        let started = tokio::time::Instant::now();
        let reply = transport
            .fetch(FetchRequest {
                client,
                url: format!("{}/", cam.base_url()),
                credentials: None,
                timeout,
            })
            .await;
        let elapsed = started.elapsed();

        let status = match reply {
            Ok(r) if r.status < 500 => CameraStatus::Online,
            Ok(r) => {
                debug!("health probe {}: HTTP {}", cam.host, r.status);
                CameraStatus::Error
            }
            Err(CamError::Connection(e)) => {
                debug!("health probe {}: {e}", cam.host);
                CameraStatus::Offline
            }
            Err(e) => {
                debug!("health probe {}: {e}", cam.host);
                CameraStatus::Error
            }
        };
        self.record(&cam.host, status == CameraStatus::Online, elapsed);
        status
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HealthRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn percent(part: u64, total: u64) -> u32 {
    if total == 0 {
        0
    } else {
        ((part as f64 / total as f64) * 100.0).round() as u32
    }
}
