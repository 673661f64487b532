//! Per-host connection reuse.
//!
//! Each camera host gets its own keep-alive HTTP client and a semaphore
//! capping how many captures may talk to that host at once. Entries idle
//! longer than `idle_timeout` are dropped by the sweeper, which closes their
//! sockets.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info};
use reqwest::Client;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{CamError, Result};
use crate::transport::build_camera_http_client;

struct PoolEntry {
    client:         Client,
    permits:        Arc<Semaphore>,
    last_used:      Instant,
    total_requests: u64,
}

/// A checked-out slot on one host. The slot is returned on drop.
pub struct PoolLease {
    host:           String,
    client:         Client,
    total_requests: u64,
    _permit:        OwnedSemaphorePermit,
}

impl PoolLease {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Acquisitions of this host's entry, this one included.
    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }
}

pub struct ConnectionPool {
    entries:      Mutex<HashMap<String, PoolEntry>>,
    max_per_host: usize,
    idle_timeout: Duration,
    user_agent:   String,
}

impl ConnectionPool {
    pub fn new(max_per_host: usize, idle_timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            entries:      Mutex::new(HashMap::new()),
            max_per_host: max_per_host.max(1),
            idle_timeout,
            user_agent:   user_agent.into(),
        }
    }

    /// Check out a slot for `host`, creating the entry on first use.
    ///
    /// Waits while `max_per_host` leases for the host are outstanding.
    pub async fn acquire(&self, host: &str) -> Result<PoolLease> {
        let (client, permits, total_requests) = {
            let mut entries = self.lock();
            let entry = match entries.entry(host.to_string()) {
                Entry::Occupied(o) => o.into_mut(),
                Entry::Vacant(v) => {
                    let client = build_camera_http_client(
                        &self.user_agent,
                        self.max_per_host,
                        self.idle_timeout,
                    )?;
                    debug!("connection pool: new entry for {host}");
                    v.insert(PoolEntry {
                        client,
                        permits:        Arc::new(Semaphore::new(self.max_per_host)),
                        last_used:      Instant::now(),
                        total_requests: 0,
                    })
                }
            };
            entry.last_used = Instant::now();
            entry.total_requests += 1;
            (entry.client.clone(), Arc::clone(&entry.permits), entry.total_requests)
        };

        let permit = permits
            .acquire_owned()
            .await
            .map_err(|_| CamError::Internal(format!("connection pool for {host} closed")))?;

        Ok(PoolLease { host: host.to_string(), client, total_requests, _permit: permit })
    }

    /// Drop entries unused for longer than the idle timeout. Entries with a
    /// lease outstanding are kept. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|host, entry| {
            let in_use = entry.permits.available_permits() < self.max_per_host;
            let keep = in_use || entry.last_used.elapsed() < self.idle_timeout;
            if !keep {
                info!("connection pool cleanup: {host} ({} requests)", entry.total_requests);
            }
            keep
        });
        before - entries.len()
    }

    /// Run [`evict_idle`](Self::evict_idle) every `every`.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = self.evict_idle();
                if evicted > 0 {
                    debug!("connection pool: evicted {evicted} idle hosts");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cumulative acquisitions for `host`, `None` if it has no entry.
    pub fn requests_for(&self, host: &str) -> Option<u64> {
        self.lock().get(host).map(|e| e.total_requests)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(300);

    fn pool() -> ConnectionPool {
        ConnectionPool::new(3, IDLE, "classcam-test")
    }

    #[tokio::test]
    async fn entries_are_reused_per_host() {
        let pool = pool();
        let a = pool.acquire("10.0.0.2").await.unwrap();
        drop(a);
        let b = pool.acquire("10.0.0.2").await.unwrap();
        assert_eq!(b.total_requests(), 2);
        pool.acquire("10.0.0.3").await.unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.requests_for("10.0.0.2"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_max_per_host_leases() {
        let pool = pool();
        let held: Vec<_> = futures_util::future::join_all((0..3).map(|_| pool.acquire("10.0.0.2")))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let fourth = tokio::time::timeout(Duration::from_secs(1), pool.acquire("10.0.0.2")).await;
        assert!(fourth.is_err(), "fourth lease must wait");

        drop(held);
        let fifth = tokio::time::timeout(Duration::from_secs(1), pool.acquire("10.0.0.2")).await;
        assert!(fifth.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_evicted() {
        let pool = pool();
        drop(pool.acquire("10.0.0.2").await.unwrap());
        let busy = pool.acquire("10.0.0.3").await.unwrap();

        tokio::time::advance(IDLE - Duration::from_secs(1)).await;
        assert_eq!(pool.evict_idle(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(pool.evict_idle(), 1, "only the host without a lease goes");
        assert_eq!(pool.requests_for("10.0.0.2"), None);

        drop(busy);
        assert_eq!(pool.evict_idle(), 1);
        assert!(pool.is_empty());
    }
}
