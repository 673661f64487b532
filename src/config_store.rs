//! Read-through cache over the camera registry.
//!
//! Entries live for `ttl`; an older entry is never handed out without a fresh
//! registry read. The store also owns the preferred-method promotion policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use tokio::time::Instant;

use crate::config::ExcludedHosts;
use crate::error::{CamError, Result};
use crate::registry::{CameraConfig, CameraRegistry};

struct CachedConfig {
    config:    Arc<CameraConfig>,
    refreshed: Instant,
}

/// Candidate preferred method and how many consecutive wins it has.
struct PendingPreference {
    method: String,
    wins:   u32,
}

pub struct ConfigStore {
    registry:      Arc<dyn CameraRegistry>,
    ttl:           Duration,
    excluded:      ExcludedHosts,
    confirmations: u32,
    cache:         Mutex<HashMap<String, CachedConfig>>,
    pending:       Mutex<HashMap<String, PendingPreference>>,
}

impl ConfigStore {
    pub fn new(
        registry:      Arc<dyn CameraRegistry>,
        ttl:           Duration,
        excluded:      ExcludedHosts,
        confirmations: u32,
    ) -> Self {
        Self {
            registry,
            ttl,
            excluded,
            confirmations: confirmations.max(1),
            cache:   Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn CameraRegistry> {
        &self.registry
    }

    /// Resolve a camera id, reading the registry on a miss or an expired entry.
    ///
    /// Unregistered ids, cameras without an address and excluded addresses
    /// are `CamError::Configuration`.
    pub async fn get(&self, id: &str) -> Result<Arc<CameraConfig>> {
        if let Some(hit) = self.fresh(id) {
            return Ok(hit);
        }

        let config = self
            .registry
            .fetch(id)
            .await?
            .ok_or_else(|| CamError::Configuration(format!("camera {id} is not registered")))?;
        if config.host.trim().is_empty() {
            return Err(CamError::Configuration(format!("camera {id} has no address")));
        }
        if self.excluded.contains(&config.host) {
            return Err(CamError::Configuration(format!(
                "camera {id} address {} is excluded",
                config.host
            )));
        }

        debug!("config for {id} refreshed from registry");
        let config = Arc::new(config);
        self.lock_cache().insert(
            id.to_string(),
            CachedConfig { config: Arc::clone(&config), refreshed: Instant::now() },
        );
        Ok(config)
    }

    fn fresh(&self, id: &str) -> Option<Arc<CameraConfig>> {
        let cache = self.lock_cache();
        cache
            .get(id)
            .filter(|c| c.refreshed.elapsed() < self.ttl)
            .map(|c| Arc::clone(&c.config))
    }

    /// Record that `method` produced an image for `id`.
    ///
    /// Returns the method when it becomes the new preference, after
    /// `confirmations` consecutive wins. The caller persists it.
    pub fn note_success(&self, id: &str, method: &str) -> Option<String> {
        let current = self.lock_cache().get(id).and_then(|c| c.config.preferred_method.clone());
        if current.as_deref() == Some(method) {
            self.lock_pending().remove(id);
            return None;
        }

        let promote = {
            let mut pending = self.lock_pending();
            let entry = pending
                .entry(id.to_string())
                .or_insert_with(|| PendingPreference { method: method.to_string(), wins: 0 });
            if entry.method != method {
                entry.method = method.to_string();
                entry.wins = 0;
            }
            entry.wins += 1;
            if entry.wins >= self.confirmations {
                pending.remove(id);
                true
            } else {
                false
            }
        };
        if !promote {
            return None;
        }

        if let Some(cached) = self.lock_cache().get_mut(id) {
            let mut updated = (*cached.config).clone();
            updated.preferred_method = Some(method.to_string());
            cached.config = Arc::new(updated);
        }
        info!("preferred capture method for {id} is now {method}");
        Some(method.to_string())
    }

    /// Insert or replace a camera in the registry and prime the cache.
    pub async fn register(&self, config: CameraConfig) -> Result<()> {
        if self.excluded.contains(&config.host) {
            return Err(CamError::Configuration(format!("{} is excluded", config.host)));
        }
        self.registry.register(config.clone()).await?;
        let id = config.id.clone();
        self.lock_cache().insert(
            id,
            CachedConfig { config: Arc::new(config), refreshed: Instant::now() },
        );
        Ok(())
    }

    pub fn invalidate(&self, id: &str) {
        self.lock_cache().remove(id);
    }

    pub fn clear(&self) {
        self.lock_cache().clear();
        self.lock_pending().clear();
    }

    pub fn len(&self) -> usize {
        self.lock_cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedConfig>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingPreference>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
