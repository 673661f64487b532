//! Single-camera capture pipeline.
//!
//! [`CameraFleet`] owns the shared stores (config cache, connection pool,
//! health records) and runs one capture end to end: resolve config, check
//! the circuit, lease a pooled client, walk the strategy chain, then record
//! health and write the outcome back to the registry.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ServiceConfig;
use crate::config_store::ConfigStore;
use crate::error::{CamError, Result};
use crate::health::HealthMonitor;
use crate::pool::ConnectionPool;
use crate::registry::{CameraConfig, CameraRegistry, CameraStatus, StatusUpdate};
use crate::strategy::{CaptureChain, CaptureResult};
use crate::transport::Transport;

pub struct CameraFleet {
    settings:  ServiceConfig,
    configs:   ConfigStore,
    pool:      Arc<ConnectionPool>,
    health:    HealthMonitor,
    transport: Arc<dyn Transport>,
    chain:     CaptureChain,
}

impl CameraFleet {
    pub fn new(
        settings:  ServiceConfig,
        registry:  Arc<dyn CameraRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let configs = ConfigStore::new(
            registry,
            settings.cache_ttl,
            settings.excluded.clone(),
            settings.preferred_confirmations,
        );
        let pool = Arc::new(ConnectionPool::new(
            settings.pool_max_per_host,
            settings.pool_idle_timeout,
            settings.user_agent.clone(),
        ));
        let chain = CaptureChain::new(
            Arc::clone(&transport),
            settings.rtsp_timeout,
            settings.onvif_timeout,
        );
        Self {
            health: HealthMonitor::new(settings.failure_threshold),
            settings,
            configs,
            pool,
            transport,
            chain,
        }
    }

    pub fn settings(&self) -> &ServiceConfig {
        &self.settings
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Capture one image from camera `id`.
    ///
    /// Only configuration misuse is an `Err`; every capture failure,
    /// circuit-open included, comes back as a failed [`CaptureResult`].
    pub async fn capture(&self, id: &str, timeout: Duration) -> Result<CaptureResult> {
        let cam = self.configs.get(id).await?;

        if self.health.is_circuit_open(&cam.host) {
            warn!("circuit open for {} ({}), capture skipped", cam.id, cam.host);
            return Ok(CaptureResult::failed(&CamError::CircuitOpen(cam.host.clone()), Vec::new()));
        }

        let lease = match self.pool.acquire(&cam.host).await {
            Ok(lease) => lease,
            Err(e) => return Ok(CaptureResult::failed(&e, Vec::new())),
        };
        let started = Instant::now();
        let result = self.chain.capture(&cam, lease.client(), timeout).await;
        drop(lease);
        self.health.record(&cam.host, result.success, started.elapsed());

        let update = match result.method.as_deref() {
            Some(method) if result.success => {
                StatusUpdate::succeeded(self.configs.note_success(&cam.id, method))
            }
            _ => StatusUpdate::checked(CameraStatus::Error),
        };
        self.write_back(&cam.id, update).await;
        Ok(result)
    }

    /// Register a camera (e.g. one found by discovery) and prime the cache.
    pub async fn register(&self, config: CameraConfig) -> Result<()> {
        info!("registering camera {} at {}", config.id, config.host);
        self.configs.register(config).await
    }

    /// Probe every active, non-excluded camera once and store its status.
    ///
    /// Returns `(camera id, status)` per probed camera. Registry failures are
    /// logged and never propagated.
    pub async fn health_sweep(&self) -> Vec<(String, CameraStatus)> {
        let cameras = match self.configs.registry().list().await {
            Ok(c) => c,
            Err(e) => {
                warn!("health sweep: cannot list cameras: {e}");
                return Vec::new();
            }
        };

        let probes = cameras
            .iter()
            .filter(|c| !self.settings.excluded.contains(&c.host))
            .map(|cam| async move {
                let status = match self.pool.acquire(&cam.host).await {
                    Ok(lease) => {
                        self.health
                            .probe(
                                cam,
                                self.transport.as_ref(),
                                lease.client(),
                                self.settings.health_probe_timeout,
                            )
                            .await
                    }
                    Err(e) => {
                        warn!("health sweep: no client for {}: {e}", cam.host);
                        CameraStatus::Error
                    }
                };
                self.write_back(&cam.id, StatusUpdate::checked(status)).await;
                (cam.id.clone(), status)
            });
        let statuses = join_all(probes).await;

        let online = statuses.iter().filter(|(_, s)| *s == CameraStatus::Online).count();
        info!("health sweep: {online}/{} cameras online", statuses.len());
        statuses
    }

    /// Run [`health_sweep`](Self::health_sweep) every `every`, first sweep immediately.
    pub fn spawn_health_loop(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                self.health_sweep().await;
            }
        })
    }

    async fn write_back(&self, id: &str, update: StatusUpdate) {
        if let Err(e) = self.configs.registry().update(id, update).await {
            warn!("registry update for {id} failed: {e}");
        }
    }
}
