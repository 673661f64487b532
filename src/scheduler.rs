//! Bounded-concurrency capture scheduling.
//!
//! Single captures go through a FIFO queue; at most `max_concurrent` are
//! dispatched at once and each completion dispatches the next queued item.
//! Fleet-wide captures are split into batches run through the same queue,
//! followed by one sequential retry pass over the failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CamError, FailureKind, Result};
use crate::fleet::CameraFleet;
use crate::strategy::CaptureResult;

/// Batch times kept for the rolling average.
const METRICS_WINDOW: usize = 1000;

struct QueueItem {
    camera_id:   String,
    timeout:     Duration,
    enqueued_at: Instant,
    reply:       oneshot::Sender<Result<CaptureResult>>,
}

#[derive(Default)]
struct QueueState {
    queue:  VecDeque<QueueItem>,
    active: usize,
}

/// Options for [`CaptureScheduler::capture_many`]; `None` uses the service setting.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_concurrent: Option<usize>,
    pub timeout:        Option<Duration>,
    pub retry_failed:   bool,
    pub pause:          Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { max_concurrent: None, timeout: None, retry_failed: true, pause: None }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraOutcome {
    pub camera_id: String,
    /// Captures issued for this camera, retry included.
    pub attempts:  u32,
    #[serde(flatten)]
    pub result:    CaptureResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total:           usize,
    pub successful:      usize,
    pub failed:          usize,
    pub success_rate:    u32,
    pub total_time_ms:   u64,
    pub average_time_ms: u64,
    pub batches:         usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: Uuid,
    /// At least one camera produced an image.
    pub success:  bool,
    pub summary:  BatchSummary,
    pub results:  Vec<CameraOutcome>,
}

/// Receives every finished batch.
pub trait BatchObserver: Send + Sync {
    fn batch_completed(&self, batch: &BatchResult);
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_captures:      u64,
    pub successful_captures: u64,
    pub failed_captures:     u64,
    pub average_batch_ms:    u64,
    #[serde(skip)]
    batch_times: VecDeque<u64>,
}

impl PerformanceMetrics {
    fn record_batch(&mut self, summary: &BatchSummary) {
        self.total_captures += summary.total as u64;
        self.successful_captures += summary.successful as u64;
        self.failed_captures += summary.failed as u64;

        self.batch_times.push_back(summary.total_time_ms);
        while self.batch_times.len() > METRICS_WINDOW {
            self.batch_times.pop_front();
        }
        let sum: u64 = self.batch_times.iter().sum();
        self.average_batch_ms = sum / self.batch_times.len() as u64;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub active_captures:      usize,
    pub queue_length:         usize,
    pub max_concurrent:       usize,
    /// Highest number of simultaneously active captures seen.
    pub peak_active:          usize,
    pub connection_pool_size: usize,
    pub performance:          PerformanceMetrics,
}

struct Inner {
    fleet:          Arc<CameraFleet>,
    max_concurrent: usize,
    state:          Mutex<QueueState>,
    peak_active:    AtomicUsize,
    metrics:        Mutex<PerformanceMetrics>,
    observers:      Mutex<Vec<Arc<dyn BatchObserver>>>,
}

/// Releases an active slot and dispatches the next item when dropped.
struct ActiveSlot(Arc<Inner>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.lock_state().active -= 1;
        self.0.pump();
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dispatch queued items while slots are free.
    fn pump(self: &Arc<Self>) {
        let mut state = self.lock_state();
        while state.active < self.max_concurrent {
            let Some(item) = state.queue.pop_front() else { break };
            if item.reply.is_closed() {
                debug!("dropping queued capture of {}, caller is gone", item.camera_id);
                continue;
            }
            state.active += 1;
            self.peak_active.fetch_max(state.active, Ordering::SeqCst);

            let slot = ActiveSlot(Arc::clone(self));
            tokio::spawn(async move {
                debug!(
                    "dispatch {} after {}ms in queue",
                    item.camera_id,
                    item.enqueued_at.elapsed().as_millis()
                );
                let result = slot.0.fleet.capture(&item.camera_id, item.timeout).await;
                drop(slot);
                // The caller may have gone away; nothing to do then.
                let _ = item.reply.send(result);
            });
        }
    }
}

#[derive(Clone)]
pub struct CaptureScheduler {
    inner: Arc<Inner>,
}

impl CaptureScheduler {
    pub fn new(fleet: Arc<CameraFleet>) -> Self {
        let max_concurrent = fleet.settings().max_concurrent_captures.max(1);
        Self {
            inner: Arc::new(Inner {
                fleet,
                max_concurrent,
                state:       Mutex::new(QueueState::default()),
                peak_active: AtomicUsize::new(0),
                metrics:     Mutex::new(PerformanceMetrics::default()),
                observers:   Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn fleet(&self) -> &Arc<CameraFleet> {
        &self.inner.fleet
    }

    pub fn subscribe(&self, observer: Arc<dyn BatchObserver>) {
        self.inner.observers.lock().unwrap_or_else(|e| e.into_inner()).push(observer);
    }

    /// Queue one capture and wait for its result.
    pub async fn capture_one(&self, camera_id: &str, timeout: Duration) -> Result<CaptureResult> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock_state().queue.push_back(QueueItem {
            camera_id:   camera_id.to_string(),
            timeout,
            enqueued_at: Instant::now(),
            reply:       tx,
        });
        self.inner.pump();
        rx.await
            .map_err(|_| CamError::Internal(format!("capture of {camera_id} was dropped")))?
    }

    /// Capture every camera in `ids`, batch by batch, then retry failures once.
    ///
    /// Never fails as a whole: per-camera errors become failed results.
    pub async fn capture_many(&self, ids: &[String], opts: BatchOptions) -> BatchResult {
        let settings = self.inner.fleet.settings();
        let batch_size = opts.max_concurrent.unwrap_or(self.inner.max_concurrent).max(1);
        let timeout = opts.timeout.unwrap_or(settings.capture_timeout);
        let pause = opts.pause.unwrap_or(settings.batch_pause);
        let batch_id = Uuid::new_v4();
        let started = Instant::now();

        let batches: Vec<&[String]> = ids.chunks(batch_size).collect();
        info!(
            "batch {batch_id}: {} cameras in {} batches of up to {batch_size}",
            ids.len(),
            batches.len()
        );

        let mut outcomes: Vec<CameraOutcome> = Vec::with_capacity(ids.len());
        for (n, batch) in batches.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(pause).await;
            }
            debug!("batch {batch_id}: running part {}/{} ({} cameras)", n + 1, batches.len(), batch.len());
            let results = join_all(batch.iter().map(|id| self.capture_settled(id, timeout))).await;
            outcomes.extend(batch.iter().zip(results).map(|(id, result)| CameraOutcome {
                camera_id: id.clone(),
                attempts:  1,
                result,
            }));
        }

        if opts.retry_failed {
            let retry: Vec<usize> = outcomes
                .iter()
                .enumerate()
                .filter(|(_, o)| {
                    !o.result.success && o.result.error_kind != Some(FailureKind::Configuration)
                })
                .map(|(i, _)| i)
                .collect();
            if !retry.is_empty() {
                info!("batch {batch_id}: retrying {} failed cameras", retry.len());
            }
            for i in retry {
                let result = self.capture_settled(&outcomes[i].camera_id, timeout).await;
                outcomes[i].attempts += 1;
                outcomes[i].result = result;
            }
        }

        let total = outcomes.len();
        let successful = outcomes.iter().filter(|o| o.result.success).count();
        let total_time_ms = started.elapsed().as_millis() as u64;
        let summary = BatchSummary {
            total,
            successful,
            failed:          total - successful,
            success_rate:    rate(successful, total),
            total_time_ms,
            average_time_ms: if total == 0 { 0 } else { total_time_ms / total as u64 },
            batches:         batches.len(),
        };
        info!(
            "batch {batch_id} done in {total_time_ms}ms: {successful}/{total} captured ({}%)",
            summary.success_rate
        );

        self.inner
            .metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_batch(&summary);

        let result = BatchResult { batch_id, success: successful > 0, summary, results: outcomes };
        let observers = self.inner.observers.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for observer in observers {
            observer.batch_completed(&result);
        }
        result
    }

    async fn capture_settled(&self, camera_id: &str, timeout: Duration) -> CaptureResult {
        match self.capture_one(camera_id, timeout).await {
            Ok(result) => result,
            Err(e) => {
                warn!("capture of {camera_id} failed: {e}");
                CaptureResult::failed(&e, Vec::new())
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let (active_captures, queue_length) = {
            let state = self.inner.lock_state();
            (state.active, state.queue.len())
        };
        SchedulerStats {
            active_captures,
            queue_length,
            max_concurrent:       self.inner.max_concurrent,
            peak_active:          self.inner.peak_active.load(Ordering::SeqCst),
            connection_pool_size: self.inner.fleet.pool().len(),
            performance:          self.inner.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }
}

fn rate(part: usize, total: usize) -> u32 {
    if total == 0 {
        0
    } else {
        ((part as f64 / total as f64) * 100.0).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::VENDOR_ENDPOINTS;
    use crate::testing::{
        host_of, http_camera, jpeg, reply, test_settings, unreachable, FakeTransport, MemoryRegistry,
    };

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("aula-{i}")).collect()
    }

    fn scheduler(n: usize, transport: &Arc<FakeTransport>) -> (CaptureScheduler, Arc<MemoryRegistry>) {
        let reg = MemoryRegistry::with_cameras(
            (0..n).map(|i| http_camera(&format!("aula-{i}"), &format!("192.168.1.{}", 100 + i))),
        );
        let fleet = CameraFleet::new(test_settings(), reg.clone(), transport.clone());
        (CaptureScheduler::new(Arc::new(fleet)), reg)
    }

    #[tokio::test(start_paused = true)]
    async fn batches_never_exceed_the_bound() {
        let t = Arc::new(
            FakeTransport::new(|_, _| reply(200, jpeg(4096))).with_delay(Duration::from_millis(100)),
        );
        let (sched, _) = scheduler(25, &t);

        let batch = sched
            .capture_many(&ids(25), BatchOptions { max_concurrent: Some(10), ..BatchOptions::default() })
            .await;
        assert_eq!(batch.summary.batches, 3);
        assert_eq!(batch.summary.total, 25);
        assert_eq!(batch.summary.successful, 25);
        assert_eq!(batch.summary.success_rate, 100);
        assert!(batch.success);

        let stats = sched.stats();
        assert!(stats.peak_active <= 10, "peak {}", stats.peak_active);
        assert_eq!(stats.active_captures, 0);
        assert_eq!(stats.performance.total_captures, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_dispatches_up_to_max_concurrent() {
        let t = Arc::new(
            FakeTransport::new(|_, _| reply(200, jpeg(4096))).with_delay(Duration::from_millis(100)),
        );
        let (sched, _) = scheduler(25, &t);
        let ids = ids(25);

        let results = join_all(ids.iter().map(|id| sched.capture_one(id, Duration::from_secs(5)))).await;
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|c| c.success)));

        let stats = sched.stats();
        assert_eq!(stats.peak_active, test_settings().max_concurrent_captures);
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.active_captures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_queue_items_are_never_dispatched() {
        let t = Arc::new(
            FakeTransport::new(|_, _| reply(200, jpeg(4096))).with_delay(Duration::from_millis(100)),
        );
        let (sched, _) = scheduler(11, &t);

        let busy = {
            let sched = sched.clone();
            tokio::spawn(async move {
                let ids = ids(10);
                join_all(ids.iter().map(|id| sched.capture_one(id, Duration::from_secs(5)))).await
            })
        };
        while sched.stats().active_captures < 10 {
            tokio::task::yield_now().await;
        }

        let waiting = sched.capture_one("aula-10", Duration::from_secs(5));
        assert!(tokio::time::timeout(Duration::from_millis(10), waiting).await.is_err());
        assert_eq!(sched.stats().queue_length, 1);

        let results = busy.await.unwrap();
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|c| c.success)));
        assert_eq!(sched.stats().queue_length, 0);
        assert_eq!(sched.stats().active_captures, 0);
        assert_eq!(t.fetch_count(), 10);
        assert!(t.urls().iter().all(|u| host_of(u) != "192.168.1.110"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_retried_exactly_once() {
        let t = Arc::new(FakeTransport::new(|url, _| match host_of(url).as_str() {
            "192.168.1.101" => unreachable(),
            _ => reply(200, jpeg(4096)),
        }));
        let (sched, _) = scheduler(3, &t);

        let batch = sched.capture_many(&ids(3), BatchOptions::default()).await;
        let attempts: Vec<u32> = batch.results.iter().map(|o| o.attempts).collect();
        assert_eq!(attempts, vec![1, 2, 1]);
        assert_eq!(batch.summary.failed, 1);
        assert_eq!(batch.summary.success_rate, 67);

        let per_capture = VENDOR_ENDPOINTS.len() * 2;
        let hits = t.urls().iter().filter(|u| host_of(u) == "192.168.1.101").count();
        assert_eq!(hits, 2 * per_capture, "initial attempt plus one retry");
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_failures_are_not_retried() {
        let t = Arc::new(FakeTransport::new(|_, _| reply(200, jpeg(4096))));
        let (sched, _) = scheduler(1, &t);

        let batch = sched
            .capture_many(&["aula-0".to_string(), "ghost".to_string()], BatchOptions::default())
            .await;
        let ghost = &batch.results[1];
        assert_eq!(ghost.camera_id, "ghost");
        assert_eq!(ghost.attempts, 1);
        assert_eq!(ghost.result.error_kind, Some(FailureKind::Configuration));
        assert!(sched.capture_one("ghost", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_every_batch() {
        struct Recorder(Mutex<Vec<(Uuid, usize)>>);
        impl BatchObserver for Recorder {
            fn batch_completed(&self, batch: &BatchResult) {
                self.0.lock().unwrap().push((batch.batch_id, batch.summary.total));
            }
        }

        let t = Arc::new(FakeTransport::new(|_, _| reply(200, jpeg(4096))));
        let (sched, _) = scheduler(2, &t);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        sched.subscribe(recorder.clone());

        let batch = sched.capture_many(&ids(2), BatchOptions::default()).await;
        assert_eq!(*recorder.0.lock().unwrap(), vec![(batch.batch_id, 2)]);
    }
}
