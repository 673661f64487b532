//! Durable camera registry.
//!
//! The registry owns camera configuration; everything else reads it through
//! [`ConfigStore`](crate::config_store::ConfigStore). The shipped backend is a
//! JSON file rewritten atomically on every update.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{CamError, Result};

/// Username/password pair for a camera.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

// Never print the password.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pass = if self.password.is_empty() { "empty" } else { "***" };
        write!(f, "{}:{pass}", self.username)
    }
}

/// Capability flags stored alongside each camera.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub onvif: bool,
    pub rtsp: bool,
    /// HTTP is unusable on this camera; only RTSP frame grabs are attempted.
    pub rtsp_only: bool,
    /// Full RTSP URL tried before the templated ones.
    pub rtsp_url: Option<String>,
    pub rtsp_port: Option<u16>,
}

/// Configuration of one classroom camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraConfig {
    pub id: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_unknown")]
    pub model: String,
    #[serde(default = "default_unknown")]
    pub manufacturer: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Name of the last strategy that produced a valid image.
    #[serde(default)]
    pub preferred_method: Option<String>,
    /// Snapshot path override, tried right after the preferred method.
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

fn default_port() -> u16 { 80 }
fn default_username() -> String { "admin".to_string() }
fn default_unknown() -> String { "Unknown".to_string() }

impl CameraConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id:               id.into(),
            host:             host.into(),
            port:             default_port(),
            username:         default_username(),
            password:         String::new(),
            model:            default_unknown(),
            manufacturer:     default_unknown(),
            capabilities:     Capabilities::default(),
            preferred_method: None,
            snapshot_path:    None,
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }

    /// `http://host[:port]` without trailing slash.
    pub fn base_url(&self) -> String {
        if self.port == 80 {
            format!("http://{}", self.host)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn uses_rtsp(&self) -> bool {
        self.capabilities.rtsp
            || self.capabilities.rtsp_only
            || self.model.to_ascii_uppercase().contains("RTSP")
    }
}

/// Status as persisted in the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Error,
    Disabled,
}

/// Fields written back after a capture or a health probe. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status:           Option<CameraStatus>,
    pub last_check:       Option<DateTime<Utc>>,
    pub last_success:     Option<DateTime<Utc>>,
    pub preferred_method: Option<String>,
}

impl StatusUpdate {
    pub fn checked(status: CameraStatus) -> Self {
        Self {
            status:     Some(status),
            last_check: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn succeeded(method: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            status:           Some(CameraStatus::Online),
            last_check:       Some(now),
            last_success:     Some(now),
            preferred_method: method,
        }
    }
}

/// Backing store for camera configuration.
#[async_trait]
pub trait CameraRegistry: Send + Sync {
    /// Read one camera; `Ok(None)` when the id is unknown.
    async fn fetch(&self, id: &str) -> Result<Option<CameraConfig>>;

    /// Every camera with an address whose status is not `disabled`.
    async fn list(&self) -> Result<Vec<CameraConfig>>;

    async fn update(&self, id: &str, update: StatusUpdate) -> Result<()>;

    /// Insert or replace a camera.
    async fn register(&self, config: CameraConfig) -> Result<()>;
}

/// One persisted registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(flatten)]
    pub config: CameraConfig,
    #[serde(default)]
    pub status: CameraStatus,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    pub fn new(config: CameraConfig) -> Self {
        Self { config, status: CameraStatus::Unknown, last_check: None, last_success: None }
    }

    pub fn apply(&mut self, update: StatusUpdate) {
        if let Some(s) = update.status {
            self.status = s;
        }
        if let Some(t) = update.last_check {
            self.last_check = Some(t);
        }
        if let Some(t) = update.last_success {
            self.last_success = Some(t);
        }
        if let Some(m) = update.preferred_method {
            self.config.preferred_method = Some(m);
        }
    }

    fn is_active(&self) -> bool {
        !self.config.host.is_empty() && self.status != CameraStatus::Disabled
    }
}

/// Registry persisted as a JSON array of [`RegistryEntry`].
pub struct JsonFileRegistry {
    path:    PathBuf,
    entries: RwLock<Vec<RegistryEntry>>,
}

impl JsonFileRegistry {
    /// Load `path`; a missing file starts an empty registry.
    pub async fn open(path: &Path) -> Result<Self> {
        let entries = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("registry {} not found, starting empty", path.display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path: path.to_path_buf(), entries: RwLock::new(entries) })
    }

    async fn persist(&self, entries: &[RegistryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("registry saved: {} cameras", entries.len());
        Ok(())
    }
}

#[async_trait]
impl CameraRegistry for JsonFileRegistry {
    async fn fetch(&self, id: &str) -> Result<Option<CameraConfig>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.config.id == id).map(|e| e.config.clone()))
    }

    async fn list(&self) -> Result<Vec<CameraConfig>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| e.is_active()).map(|e| e.config.clone()).collect())
    }

    async fn update(&self, id: &str, update: StatusUpdate) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.config.id == id)
            .ok_or_else(|| CamError::Configuration(format!("camera {id} is not registered")))?;
        entry.apply(update);
        self.persist(&entries).await
    }

    async fn register(&self, config: CameraConfig) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries.iter_mut().find(|e| e.config.id == config.id) {
            Some(existing) => existing.config = config,
            None => entries.push(RegistryEntry::new(config)),
        }
        self.persist(&entries).await
    }
}
