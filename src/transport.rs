//! Network access to cameras.
//!
//! Every byte that leaves the process for a camera goes through
//! [`Transport`]: plain HTTP GETs (snapshot endpoints, ONVIF snapshot, base
//! probes) and single-frame RTSP grabs through an external ffmpeg process.
//!
//! Camera HTTP calls use a permissive TLS client (all cert errors accepted);
//! classroom cameras ship self-signed certificates.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{ACCEPT, CACHE_CONTROL, SERVER};
use reqwest::Client;
use tokio::process::Command;
use url::Url;

use crate::error::{CamError, Result};
use crate::registry::Credentials;

/// One HTTP GET against a camera.
pub struct FetchRequest<'a> {
    /// Pooled client for the camera's host.
    pub client: &'a Client,
    pub url: String,
    /// Basic-auth credentials, `None` for an anonymous request.
    pub credentials: Option<&'a Credentials>,
    pub timeout: Duration,
}

/// Raw reply; status classification is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
    /// `Server` response header, used for vendor fingerprinting.
    pub server: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET. Network failures and timeouts are `CamError::Connection`;
    /// any HTTP status is returned as a reply.
    async fn fetch(&self, req: FetchRequest<'_>) -> Result<HttpReply>;

    /// Pull a single JPEG frame out of an RTSP stream.
    async fn grab_frame(&self, rtsp_url: &str, timeout: Duration) -> Result<Vec<u8>>;
}

/// Build the permissive HTTP client used for all camera calls.
///
/// `max_idle_per_host` keep-alive connections are retained per camera host.
pub fn build_camera_http_client(
    user_agent:        &str,
    max_idle_per_host: usize,
    idle_timeout:      Duration,
) -> Result<Client> {
    Client::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .user_agent(user_agent)
        .pool_max_idle_per_host(max_idle_per_host)
        .pool_idle_timeout(idle_timeout)
        .redirect(reqwest::redirect::Policy::limited(2))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(CamError::Http)
}

/// Replace the password of a URL with `***` for logging.
pub fn mask_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

/// Production transport: reqwest for HTTP, ffmpeg for RTSP.
pub struct NetTransport {
    ffmpeg_path: String,
}

impl NetTransport {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self { ffmpeg_path: ffmpeg_path.into() }
    }

    /// Return the ffmpeg version line, or an error if it cannot be run.
    pub async fn check_ffmpeg(&self) -> Result<String> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .output()
            .await
            .map_err(|e| CamError::Internal(format!("ffmpeg not found: {e}")))?;
        if !output.status.success() {
            return Err(CamError::Internal("ffmpeg version check failed".into()));
        }
        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn fetch(&self, req: FetchRequest<'_>) -> Result<HttpReply> {
        let mut builder = req
            .client
            .get(&req.url)
            .timeout(req.timeout)
            .header(ACCEPT, "image/jpeg,image/*,*/*")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(creds) = req.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }

        let resp = builder.send().await.map_err(|e| connection_error(&req.url, e))?;
        let status = resp.status().as_u16();
        let server = resp
            .headers()
            .get(SERVER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(|e| connection_error(&req.url, e))?;

        debug!("GET {} → {status} ({} bytes)", req.url, body.len());
        Ok(HttpReply { status, body: body.to_vec(), server })
    }

    /// `kill_on_drop` makes a timed-out ffmpeg die with the dropped future
    /// instead of lingering as a zombie.
    async fn grab_frame(&self, rtsp_url: &str, timeout: Duration) -> Result<Vec<u8>> {
        let child = Command::new(&self.ffmpeg_path)
            .args([
                "-rtsp_transport", "tcp",
                "-i", rtsp_url,
                "-frames:v", "1",
                "-f", "image2pipe",
                "-vcodec", "mjpeg",
                "-q:v", "2",
                "-loglevel", "error",
                "-y",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CamError::Internal(format!("ffmpeg spawn failed: {e}")))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => {
                if output.stdout.is_empty() {
                    return Err(CamError::InvalidPayload("ffmpeg returned empty output".into()));
                }
                Ok(output.stdout)
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(CamError::Connection(format!("ffmpeg failed: {}", stderr.trim())))
            }
            Ok(Err(e)) => Err(CamError::Internal(format!("ffmpeg execution failed: {e}"))),
            Err(_) => {
                warn!("ffmpeg timeout ({}s) on {}", timeout.as_secs(), mask_url(rtsp_url));
                Err(CamError::Connection(format!("ffmpeg timeout ({}s)", timeout.as_secs())))
            }
        }
    }
}

fn connection_error(url: &str, e: reqwest::Error) -> CamError {
    if e.is_timeout() {
        CamError::Connection(format!("{url}: timeout"))
    } else {
        CamError::Connection(format!("{url}: {e}"))
    }
}
