//! Scripted fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::ServiceConfig;
use crate::error::{CamError, Result};
use crate::registry::{CameraConfig, CameraRegistry, Credentials, RegistryEntry, StatusUpdate};
use crate::transport::{FetchRequest, HttpReply, Transport};

type Responder = dyn Fn(&str, Option<&Credentials>) -> Result<HttpReply> + Send + Sync;
type FrameSource = dyn Fn(&str) -> Result<Vec<u8>> + Send + Sync;

/// Bytes that pass image validation.
pub fn jpeg(len: usize) -> Vec<u8> {
    let mut v = vec![0x11u8; len];
    v[..3].copy_from_slice(&[0xFF, 0xD8, 0xFF]);
    v
}

pub fn reply(status: u16, body: Vec<u8>) -> Result<HttpReply> {
    Ok(HttpReply { status, body, server: None })
}

pub fn not_found() -> Result<HttpReply> {
    reply(404, b"not found".to_vec())
}

pub fn unreachable() -> Result<HttpReply> {
    Err(CamError::Connection("connect timeout".into()))
}

pub fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

pub fn path_of(url: &str) -> String {
    Url::parse(url).map(|u| u.path().to_string()).unwrap_or_default()
}

/// Transport answering from closures and counting every call.
pub struct FakeTransport {
    responder: Box<Responder>,
    frames:    Box<FrameSource>,
    delay:     Duration,
    fetches:   AtomicUsize,
    grabs:     AtomicUsize,
    urls:      Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, Option<&Credentials>) -> Result<HttpReply> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            frames:    Box::new(|_| Err(CamError::Connection("no rtsp".into()))),
            delay:     Duration::ZERO,
            fetches:   AtomicUsize::new(0),
            grabs:     AtomicUsize::new(0),
            urls:      Mutex::new(Vec::new()),
        }
    }

    pub fn with_frames<F>(mut self, frames: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.frames = Box::new(frames);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn grab_count(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }

    /// Every fetched and grabbed URL, in call order.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(&self, req: FetchRequest<'_>) -> Result<HttpReply> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(req.url.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.responder)(&req.url, req.credentials)
    }

    async fn grab_frame(&self, rtsp_url: &str, _timeout: Duration) -> Result<Vec<u8>> {
        self.grabs.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(rtsp_url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.frames)(rtsp_url)
    }
}

/// In-memory registry counting `fetch` calls.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    fetches: AtomicUsize,
}

impl MemoryRegistry {
    pub fn with_cameras(cameras: impl IntoIterator<Item = CameraConfig>) -> Arc<Self> {
        let reg = Self::default();
        {
            let mut entries = reg.entries.lock().unwrap();
            for cam in cameras {
                entries.insert(cam.id.clone(), RegistryEntry::new(cam));
            }
        }
        Arc::new(reg)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn entry(&self, id: &str) -> Option<RegistryEntry> {
        self.entries.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl CameraRegistry for MemoryRegistry {
    async fn fetch(&self, id: &str) -> Result<Option<CameraConfig>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().unwrap().get(id).map(|e| e.config.clone()))
    }

    async fn list(&self) -> Result<Vec<CameraConfig>> {
        let mut cams: Vec<CameraConfig> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status != crate::registry::CameraStatus::Disabled)
            .map(|e| e.config.clone())
            .collect();
        cams.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(cams)
    }

    async fn update(&self, id: &str, update: StatusUpdate) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| CamError::Configuration(format!("camera {id} is not registered")))?;
        entry.apply(update);
        Ok(())
    }

    async fn register(&self, config: CameraConfig) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(config.id.clone(), RegistryEntry::new(config));
        Ok(())
    }
}

/// Settings with every pause and timeout small enough for tests.
pub fn test_settings() -> ServiceConfig {
    ServiceConfig {
        batch_pause:             Duration::from_millis(10),
        capture_timeout:         Duration::from_secs(5),
        discovery_base_timeout:  Duration::from_millis(200),
        discovery_probe_timeout: Duration::from_millis(200),
        ..ServiceConfig::default()
    }
}

/// A plain HTTP camera with credentials and no RTSP/ONVIF.
pub fn http_camera(id: &str, host: &str) -> CameraConfig {
    CameraConfig {
        password: "pw".into(),
        ..CameraConfig::new(id, host)
    }
}
