//! Protocol fallback for a single camera capture.
//!
//! A camera's capture plan is an ordered list of [`Candidate`]s built from
//! declarative tables: preferred method first, then the snapshot override,
//! RTSP frame grabs, the ONVIF snapshot and finally every vendor snapshot
//! path with and then without credentials. [`CaptureChain::capture`] walks
//! the plan and the first payload that passes image validation wins.
//!
//! Supporting a new vendor quirk means adding a row to [`VENDOR_ENDPOINTS`]
//! or [`RTSP_PATHS`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::error::{CamError, FailureKind, Result};
use crate::image;
use crate::registry::CameraConfig;
use crate::transport::{mask_url, FetchRequest, HttpReply, Transport};

pub const RTSP_METHOD:      &str = "rtsp_ffmpeg";
pub const ONVIF_METHOD:     &str = "onvif";
pub const CUSTOM_METHOD:    &str = "custom_endpoint";

const ONVIF_SNAPSHOT_PATH: &str = "/onvif/snapshot";
const DEFAULT_RTSP_PORT:   u16  = 554;
const OVERRIDE_TIMEOUT:    Duration = Duration::from_secs(10);

/// A vendor HTTP snapshot path.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotEndpoint {
    pub name:         &'static str,
    pub path:         &'static str,
    pub timeout_secs: u64,
}

/// Vendor snapshot endpoints in priority order. IMOU firmware is slow to
/// encode a fresh frame, hence the longer timeouts on its paths.
pub const VENDOR_ENDPOINTS: &[SnapshotEndpoint] = &[
    SnapshotEndpoint { name: "imou_main",    path: "/tmpfs/snap.jpg",         timeout_secs: 20 },
    SnapshotEndpoint { name: "imou_alt",     path: "/tmpfs/snapshot.jpg",     timeout_secs: 15 },
    SnapshotEndpoint { name: "generic_cgi",  path: "/cgi-bin/snapshot.cgi",   timeout_secs: 15 },
    SnapshotEndpoint { name: "generic_snap", path: "/snapshot.jpg",           timeout_secs: 10 },
    SnapshotEndpoint { name: "dahua",        path: "/cgi-bin/currentpic.cgi", timeout_secs: 15 },
    SnapshotEndpoint { name: "foscam",       path: "/image/jpeg.cgi",         timeout_secs: 10 },
    SnapshotEndpoint { name: "axis",         path: "/axis-cgi/jpg/image.cgi", timeout_secs: 15 },
];

/// RTSP stream paths (Dahua/IMOU main stream, sub stream, root).
pub const RTSP_PATHS: &[&str] = &[
    "/cam/realmonitor?channel=1&subtype=0",
    "/cam/realmonitor?channel=1&subtype=1",
    "/",
];

/// Where a candidate gets its bytes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Rtsp { url: String },
    Http { path: String, with_auth: bool },
}

/// One step of a capture plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Strategy name reported on success and stored as the preferred method.
    pub method:  String,
    pub source:  Source,
    pub timeout: Duration,
}

impl Candidate {
    fn http(method: impl Into<String>, path: impl Into<String>, with_auth: bool, timeout: Duration) -> Self {
        Self {
            method: method.into(),
            source: Source::Http { path: path.into(), with_auth },
            timeout,
        }
    }
}

/// Outcome of one capture request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub success: bool,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
    pub method: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub file_size_bytes: usize,
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempted_methods: Vec<String>,
}

impl CaptureResult {
    pub fn captured(method: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            success:           true,
            method:            Some(method.into()),
            timestamp:         Utc::now(),
            file_size_bytes:   image.len(),
            resolution:        Some(image::estimate_resolution(&image).to_string()),
            image:             Some(image),
            error:             None,
            error_kind:        None,
            attempted_methods: Vec::new(),
        }
    }

    pub fn failed(err: &CamError, attempted_methods: Vec<String>) -> Self {
        Self {
            success:         false,
            image:           None,
            method:          None,
            timestamp:       Utc::now(),
            file_size_bytes: 0,
            resolution:      None,
            error:           Some(err.to_string()),
            error_kind:      Some(err.kind()),
            attempted_methods,
        }
    }

    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }
}

/// Ordered capture strategies for one camera.
pub struct CaptureChain {
    transport:     Arc<dyn Transport>,
    rtsp_timeout:  Duration,
    onvif_timeout: Duration,
}

impl CaptureChain {
    pub fn new(transport: Arc<dyn Transport>, rtsp_timeout: Duration, onvif_timeout: Duration) -> Self {
        Self { transport, rtsp_timeout, onvif_timeout }
    }

    /// Build the ordered candidate list for `cam`.
    ///
    /// RTSP-only cameras get RTSP candidates and nothing else, so a failed
    /// frame grab ends the chain.
    pub fn plan(&self, cam: &CameraConfig) -> Vec<Candidate> {
        let rtsp_only = cam.capabilities.rtsp_only;
        let mut plan = Vec::new();

        if !rtsp_only {
            if let Some(path) = cam.snapshot_path.as_deref().filter(|p| !p.is_empty()) {
                plan.push(Candidate::http(CUSTOM_METHOD, path, true, OVERRIDE_TIMEOUT));
            }
        }
        if cam.uses_rtsp() {
            plan.extend(self.rtsp_candidates(cam));
        }
        if !rtsp_only {
            if cam.capabilities.onvif {
                plan.push(Candidate::http(ONVIF_METHOD, ONVIF_SNAPSHOT_PATH, true, self.onvif_timeout));
            }
            let anonymous = cam.username.is_empty() && cam.password.is_empty();
            for ep in VENDOR_ENDPOINTS {
                let timeout = Duration::from_secs(ep.timeout_secs);
                if !anonymous {
                    plan.push(Candidate::http(ep.name, ep.path, true, timeout));
                }
                plan.push(Candidate::http(format!("{}_no_auth", ep.name), ep.path, false, timeout));
            }
        }

        match cam.preferred_method.as_deref() {
            // Older registries stored the working path instead of a method name.
            // A known path is promoted under its table name; an unknown one keeps
            // the path as its method so a win stores the same value again.
            Some(path) if path.starts_with('/') && !rtsp_only => {
                let known = plan.iter().position(|c| {
                    matches!(&c.source, Source::Http { path: p, .. } if p == path)
                });
                let front = match known {
                    Some(i) => plan.remove(i),
                    None => Candidate::http(path, path, true, OVERRIDE_TIMEOUT),
                };
                plan.insert(0, front);
            }
            Some(method) => {
                let (mut front, rest): (Vec<_>, Vec<_>) =
                    plan.into_iter().partition(|c| c.method == method);
                front.extend(rest);
                plan = front;
            }
            None => {}
        }
        plan
    }

    fn rtsp_candidates(&self, cam: &CameraConfig) -> Vec<Candidate> {
        let mut urls: Vec<String> = Vec::new();
        if let Some(url) = cam.capabilities.rtsp_url.as_deref().filter(|u| !u.is_empty()) {
            urls.push(url.to_string());
        }
        let port = cam.capabilities.rtsp_port.unwrap_or(DEFAULT_RTSP_PORT);
        for path in RTSP_PATHS {
            match rtsp_url(cam, port, path) {
                Some(url) if !urls.contains(&url) => urls.push(url),
                Some(_) => {}
                None => warn!("cannot build RTSP URL for {} path {path}", cam.host),
            }
        }
        urls.into_iter()
            .map(|url| Candidate {
                method:  RTSP_METHOD.to_string(),
                source:  Source::Rtsp { url },
                timeout: self.rtsp_timeout,
            })
            .collect()
    }

    /// Walk the plan until a candidate yields a valid image.
    ///
    /// `item_timeout` caps each individual attempt. Failures of single
    /// candidates are logged and swallowed; only exhaustion is reported.
    pub async fn capture(&self, cam: &CameraConfig, client: &Client, item_timeout: Duration) -> CaptureResult {
        let plan = self.plan(cam);
        if plan.is_empty() {
            let err = CamError::Configuration(format!("no capture strategy for {}", cam.id));
            return CaptureResult::failed(&err, Vec::new());
        }

        let mut attempted: Vec<String> = Vec::new();
        let mut last_error = None;

        for candidate in &plan {
            if !attempted.contains(&candidate.method) {
                attempted.push(candidate.method.clone());
            }
            let timeout = candidate.timeout.min(item_timeout);
            match self.attempt(cam, client, candidate, timeout).await {
                Ok(bytes) => {
                    info!(
                        "captured {:.1}KB from {} via {}",
                        bytes.len() as f64 / 1024.0,
                        cam.host,
                        candidate.method
                    );
                    return CaptureResult::captured(candidate.method.clone(), bytes);
                }
                Err(e) => {
                    debug!("{} via {}: {e}", cam.host, candidate.method);
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| CamError::Internal("empty capture plan".into()));
        warn!(
            "no strategy produced an image for {} ({}) after {} attempts: {err}",
            cam.id,
            cam.host,
            plan.len()
        );
        CaptureResult::failed(&err, attempted)
    }

    async fn attempt(
        &self,
        cam:       &CameraConfig,
        client:    &Client,
        candidate: &Candidate,
        timeout:   Duration,
    ) -> Result<Vec<u8>> {
        let bytes = match &candidate.source {
            Source::Rtsp { url } => {
                debug!("RTSP grab {}", mask_url(url));
                self.transport.grab_frame(url, timeout).await?
            }
            Source::Http { path, with_auth } => {
                let creds = cam.credentials();
                let url = format!("{}{path}", cam.base_url());
                let reply = self
                    .transport
                    .fetch(FetchRequest {
                        client,
                        url: url.clone(),
                        credentials: with_auth.then_some(&creds),
                        timeout,
                    })
                    .await?;
                snapshot_body(&url, reply)?
            }
        };

        if image::is_valid_image(&bytes) {
            Ok(bytes)
        } else {
            Err(CamError::InvalidPayload(format!(
                "{} bytes from {} is not a JPEG image",
                bytes.len(),
                candidate.method
            )))
        }
    }
}

/// Map an HTTP reply to its body or to the matching error.
pub fn snapshot_body(url: &str, reply: HttpReply) -> Result<Vec<u8>> {
    match reply.status {
        200..=299 => Ok(reply.body),
        401 | 403 => Err(CamError::Authentication(format!("{url}: HTTP {}", reply.status))),
        404 => Err(CamError::EndpointNotFound(url.to_string())),
        s => Err(CamError::Connection(format!("{url}: HTTP {s}"))),
    }
}

fn rtsp_url(cam: &CameraConfig, port: u16, path: &str) -> Option<String> {
    let mut url = Url::parse(&format!("rtsp://{}:{port}{path}", cam.host)).ok()?;
    if !cam.username.is_empty() {
        url.set_username(&cam.username).ok()?;
        let password = Some(cam.password.as_str()).filter(|p| !p.is_empty());
        url.set_password(password).ok()?;
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{http_camera, jpeg, not_found, path_of, reply, FakeTransport};

    fn chain(transport: &Arc<FakeTransport>) -> CaptureChain {
        let t: Arc<dyn Transport> = transport.clone();
        CaptureChain::new(t, Duration::from_secs(15), Duration::from_secs(15))
    }

    const ITEM: Duration = Duration::from_secs(15);

    #[test]
    fn plan_order_follows_priority() {
        let t = Arc::new(FakeTransport::new(|_, _| not_found()));
        let mut cam = http_camera("aula-1", "192.168.1.21");
        cam.capabilities.rtsp = true;
        cam.capabilities.onvif = true;
        cam.snapshot_path = Some("/custom/snap.jpg".into());
        cam.preferred_method = Some("generic_cgi".into());

        let plan = chain(&t).plan(&cam);
        let methods: Vec<&str> = plan.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(methods[0], "generic_cgi");
        assert_eq!(methods[1], CUSTOM_METHOD);
        assert_eq!(&methods[2..2 + RTSP_PATHS.len()], &[RTSP_METHOD; 3]);
        assert_eq!(methods[5], ONVIF_METHOD);
        assert_eq!(methods[6], "imou_main");
        assert_eq!(methods[7], "imou_main_no_auth");
        assert!(!methods[8..].contains(&"generic_cgi"), "preferred is not tried twice");
    }

    #[test]
    fn rtsp_urls_carry_credentials_and_override_first() {
        let t = Arc::new(FakeTransport::new(|_, _| not_found()));
        let mut cam = http_camera("aula-2", "192.168.1.22");
        cam.capabilities.rtsp_only = true;
        cam.capabilities.rtsp_url = Some("rtsp://192.168.1.22:8554/live".into());

        let plan = chain(&t).plan(&cam);
        assert_eq!(plan.len(), 1 + RTSP_PATHS.len());
        assert!(plan.iter().all(|c| c.method == RTSP_METHOD));
        assert_eq!(plan[0].source, Source::Rtsp { url: "rtsp://192.168.1.22:8554/live".into() });
        assert_eq!(
            plan[1].source,
            Source::Rtsp {
                url: "rtsp://admin:pw@192.168.1.22:554/cam/realmonitor?channel=1&subtype=0".into()
            }
        );
    }

    #[test]
    fn legacy_path_preference_goes_first() {
        let t = Arc::new(FakeTransport::new(|_, _| not_found()));
        let mut cam = http_camera("aula-3", "192.168.1.23");
        cam.preferred_method = Some("/cgi-bin/currentpic.cgi".into());
        let plan = chain(&t).plan(&cam);
        assert_eq!(plan[0].method, "dahua");
        assert_eq!(plan.iter().filter(|c| c.method == "dahua").count(), 1);
        assert_eq!(plan.len(), VENDOR_ENDPOINTS.len() * 2);

        cam.preferred_method = Some("/live/still.jpg".into());
        let plan = chain(&t).plan(&cam);
        assert_eq!(plan[0].method, "/live/still.jpg");
        assert_eq!(plan[0].source, Source::Http { path: "/live/still.jpg".into(), with_auth: true });
        assert_eq!(plan.len(), VENDOR_ENDPOINTS.len() * 2 + 1);
    }

    #[tokio::test]
    async fn second_endpoint_wins_after_404() {
        let t = Arc::new(FakeTransport::new(|url, _| {
            if path_of(url) == "/tmpfs/snapshot.jpg" {
                reply(200, jpeg(2000))
            } else {
                not_found()
            }
        }));
        let cam = http_camera("aula-4", "192.168.1.24");

        let result = chain(&t).capture(&cam, &Client::new(), ITEM).await;
        assert!(result.success);
        assert_eq!(result.method.as_deref(), Some("imou_alt"));
        assert_eq!(result.file_size_bytes, 2000);
        assert_eq!(result.image().map(<[u8]>::len), Some(2000));
        assert_eq!(
            t.urls(),
            vec![
                "http://192.168.1.24/tmpfs/snap.jpg",
                "http://192.168.1.24/tmpfs/snap.jpg",
                "http://192.168.1.24/tmpfs/snapshot.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn anonymous_retry_uses_no_credentials() {
        let t = Arc::new(FakeTransport::new(|_, creds| match creds {
            Some(_) => reply(401, Vec::new()),
            None => reply(200, jpeg(4096)),
        }));
        let cam = http_camera("aula-5", "192.168.1.25");
        let result = chain(&t).capture(&cam, &Client::new(), ITEM).await;
        assert_eq!(result.method.as_deref(), Some("imou_main_no_auth"));
    }

    #[tokio::test]
    async fn rtsp_only_failure_stops_the_chain() {
        let t = Arc::new(
            FakeTransport::new(|_, _| reply(200, jpeg(4096)))
                .with_frames(|_| Err(CamError::Connection("refused".into()))),
        );
        let mut cam = http_camera("aula-6", "192.168.1.26");
        cam.capabilities.rtsp_only = true;

        let result = chain(&t).capture(&cam, &Client::new(), ITEM).await;
        assert!(!result.success);
        assert_eq!(result.attempted_methods, vec![RTSP_METHOD.to_string()]);
        assert_eq!(t.grab_count(), RTSP_PATHS.len());
        assert_eq!(t.fetch_count(), 0, "HTTP is never tried on RTSP-only cameras");
    }

    #[tokio::test]
    async fn rtsp_frame_wins_before_http() {
        let t = Arc::new(
            FakeTransport::new(|_, _| reply(200, jpeg(4096))).with_frames(|_| Ok(jpeg(8000))),
        );
        let mut cam = http_camera("aula-7", "192.168.1.27");
        cam.capabilities.rtsp = true;
        let result = chain(&t).capture(&cam, &Client::new(), ITEM).await;
        assert_eq!(result.method.as_deref(), Some(RTSP_METHOD));
        assert_eq!(t.fetch_count(), 0);
    }

    #[tokio::test]
    async fn html_everywhere_is_invalid_payload() {
        let t = Arc::new(FakeTransport::new(|_, _| reply(200, vec![b'<'; 3000])));
        let mut cam = http_camera("aula-8", "192.168.1.28");
        cam.capabilities.onvif = true;

        let result = chain(&t).capture(&cam, &Client::new(), ITEM).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(FailureKind::InvalidPayload));
        assert_eq!(result.attempted_methods.len(), 1 + VENDOR_ENDPOINTS.len() * 2);
        assert_eq!(result.attempted_methods[0], ONVIF_METHOD);
        assert!(result.image.is_none());
    }

    #[test]
    fn reply_statuses_map_to_taxonomy() {
        let body = |s| HttpReply { status: s, body: vec![1], server: None };
        assert!(snapshot_body("u", body(200)).is_ok());
        assert!(matches!(snapshot_body("u", body(401)), Err(CamError::Authentication(_))));
        assert!(matches!(snapshot_body("u", body(404)), Err(CamError::EndpointNotFound(_))));
        assert!(matches!(snapshot_body("u", body(503)), Err(CamError::Connection(_))));
    }
}
