//! Best-effort camera discovery on a /24 segment.
//!
//! Each address gets a short anonymous probe of `/` (only used to read the
//! `Server` header) and then every snapshot path is tried with every probe
//! credential. An address counts as a camera only when some combination
//! returns a valid image. Hosts are scanned concurrently; the whole sweep is
//! bounded by an optional wall-clock budget after which the matches found so
//! far are returned.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::ready;
use futures_util::{stream, StreamExt};
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Serialize, Serializer};
use tokio::time::Instant;

use crate::config::{ExcludedHosts, ServiceConfig};
use crate::error::{CamError, Result};
use crate::image;
use crate::registry::{CameraConfig, Credentials};
use crate::strategy::snapshot_body;
use crate::transport::{build_camera_http_client, FetchRequest, HttpReply, Transport};

/// Snapshot paths probed during discovery, most common first.
pub const DISCOVERY_PATHS: &[&str] = &[
    "/tmpfs/snap.jpg",
    "/cgi-bin/snapshot.cgi",
    "/snapshot.jpg",
    "/axis-cgi/jpg/image.cgi",
];

const QUICK_FIRST:       u8    = 1;
const QUICK_LAST:        u8    = 50;
const QUICK_CREDENTIALS: usize = 2;

/// Inclusive host range inside one /24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    prefix: [u8; 3],
    first:  u8,
    last:   u8,
}

impl AddressRange {
    /// Every usable host of the /24 (`.1` to `.254`).
    pub fn subnet(prefix: [u8; 3]) -> Self {
        Self { prefix, first: 1, last: 254 }
    }

    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let [a, b, c] = self.prefix;
        (self.first..=self.last).map(move |d| Ipv4Addr::new(a, b, c, d))
    }

    pub fn len(&self) -> usize {
        usize::from(self.last - self.first) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Intersect with hosts `first..=last`; `None` when nothing overlaps.
    pub fn clamp(&self, first: u8, last: u8) -> Option<Self> {
        let lo = self.first.max(first);
        let hi = self.last.min(last);
        (lo <= hi).then_some(Self { prefix: self.prefix, first: lo, last: hi })
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.prefix;
        write!(f, "{a}.{b}.{c}.{}-{}", self.first, self.last)
    }
}

/// Accepts `192.168.1`, `192.168.1.0/24`, `192.168.1.10-50` and `192.168.1.7`.
impl FromStr for AddressRange {
    type Err = CamError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || CamError::Configuration(format!("malformed address range '{s}'"));
        let s = s.trim();

        let (base, cidr) = match s.split_once('/') {
            Some((base, "24")) => (base, true),
            Some(_) => return Err(bad()),
            None => (s, false),
        };

        let octets: Vec<&str> = base.split('.').collect();
        let parse = |o: &str| o.trim().parse::<u8>().map_err(|_| bad());
        if octets.len() < 3 || octets.len() > 4 {
            return Err(bad());
        }
        let prefix = [parse(octets[0])?, parse(octets[1])?, parse(octets[2])?];

        let Some(last) = octets.get(3) else {
            return Ok(Self::subnet(prefix));
        };
        if cidr {
            return Ok(Self::subnet(prefix));
        }
        let (first, last) = match last.split_once('-') {
            Some((lo, hi)) => (parse(lo)?, parse(hi)?),
            None => {
                let host = parse(last)?;
                (host, host)
            }
        };
        if first == 0 || first > last || last == 255 {
            return Err(bad());
        }
        Ok(Self { prefix, first, last })
    }
}

/// An address that answered a snapshot request with a valid image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMatch {
    pub address:             Ipv4Addr,
    pub model:               String,
    #[serde(skip)]
    pub manufacturer:        String,
    pub working_endpoint:    String,
    #[serde(serialize_with = "credential_summary")]
    pub working_credentials: Credentials,
    pub image_size_bytes:    usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialSummary<'a> {
    username:         &'a str,
    password_present: bool,
}

fn credential_summary<S: Serializer>(c: &Credentials, s: S) -> std::result::Result<S::Ok, S::Error> {
    CredentialSummary { username: &c.username, password_present: !c.password.is_empty() }.serialize(s)
}

impl DiscoveryMatch {
    /// Camera entry for the registry: the working path becomes the snapshot
    /// override and the working credentials the camera's own.
    pub fn to_camera_config(&self, id: impl Into<String>) -> CameraConfig {
        CameraConfig {
            username:      self.working_credentials.username.clone(),
            password:      self.working_credentials.password.clone(),
            model:         self.model.clone(),
            manufacturer:  self.manufacturer.clone(),
            snapshot_path: Some(self.working_endpoint.clone()),
            ..CameraConfig::new(id, self.address.to_string())
        }
    }
}

/// `(manufacturer, model)` guess from the `Server` header, falling back to
/// the snapshot path that worked.
pub fn fingerprint(server: Option<&str>, path: &str) -> (&'static str, &'static str) {
    let server = server.unwrap_or_default().to_ascii_lowercase();
    if server.contains("hikvision") {
        ("Hikvision", "Hikvision Camera")
    } else if server.contains("dahua") || server.contains("imou") {
        ("Dahua", "Dahua/IMOU Camera")
    } else if server.contains("axis") {
        ("Axis", "Axis Camera")
    } else if server.contains("simulator") {
        ("Simulator", "Test Simulator")
    } else if path.starts_with("/tmpfs/") {
        ("Dahua", "Dahua/IMOU Camera")
    } else if path.starts_with("/axis-cgi/") {
        ("Axis", "Axis Camera")
    } else {
        ("Unknown", "Generic IP Camera")
    }
}

pub struct DiscoveryScanner {
    transport:     Arc<dyn Transport>,
    client:        Client,
    credentials:   Vec<Credentials>,
    base_timeout:  Duration,
    probe_timeout: Duration,
    concurrency:   usize,
    budget:        Option<Duration>,
}

impl DiscoveryScanner {
    pub fn new(transport: Arc<dyn Transport>, settings: &ServiceConfig) -> Result<Self> {
        let client = build_camera_http_client(&settings.user_agent, 1, Duration::from_secs(10))?;
        Ok(Self {
            transport,
            client,
            credentials:   settings.probe_credentials.clone(),
            base_timeout:  settings.discovery_base_timeout,
            probe_timeout: settings.discovery_probe_timeout,
            concurrency:   settings.discovery_concurrency.max(1),
            budget:        settings.discovery_budget,
        })
    }

    /// Scan every host in `range` except `excluded` with all probe credentials.
    pub async fn discover(&self, range: &AddressRange, excluded: &ExcludedHosts) -> Vec<DiscoveryMatch> {
        self.scan(range, excluded, &self.credentials).await
    }

    /// Interactive variant: hosts 1-50 of `range`, first two credentials.
    pub async fn discover_quick(&self, range: &AddressRange, excluded: &ExcludedHosts) -> Vec<DiscoveryMatch> {
        let Some(limited) = range.clamp(QUICK_FIRST, QUICK_LAST) else {
            warn!("discovery: {range} lies outside hosts {QUICK_FIRST}-{QUICK_LAST}, nothing to scan");
            return Vec::new();
        };
        let n = self.credentials.len().min(QUICK_CREDENTIALS);
        self.scan(&limited, excluded, &self.credentials[..n]).await
    }

    async fn scan(
        &self,
        range:       &AddressRange,
        excluded:    &ExcludedHosts,
        credentials: &[Credentials],
    ) -> Vec<DiscoveryMatch> {
        let targets: Vec<Ipv4Addr> = range
            .hosts()
            .filter(|ip| !excluded.contains(&ip.to_string()))
            .collect();
        info!(
            "discovery: scanning {} addresses in {range} ({} excluded, {} credentials)",
            targets.len(),
            range.len() - targets.len(),
            credentials.len()
        );

        let started = Instant::now();
        let probes = stream::iter(targets)
            .map(|ip| self.probe_host(ip, credentials))
            .buffer_unordered(self.concurrency)
            .filter_map(ready);

        let mut found: Vec<DiscoveryMatch> = match self.budget {
            Some(budget) => {
                let found: Vec<_> = probes.take_until(tokio::time::sleep(budget)).collect().await;
                if started.elapsed() >= budget {
                    warn!(
                        "discovery budget of {}s exhausted, returning {} partial matches",
                        budget.as_secs(),
                        found.len()
                    );
                }
                found
            }
            None => probes.collect().await,
        };
        found.sort_by_key(|m| m.address);

        info!(
            "discovery: {} cameras found in {range} after {}ms",
            found.len(),
            started.elapsed().as_millis()
        );
        found
    }

    async fn probe_host(&self, ip: Ipv4Addr, credentials: &[Credentials]) -> Option<DiscoveryMatch> {
        let base_url = format!("http://{ip}");

        let server = match self.get(format!("{base_url}/"), None, self.base_timeout).await {
            Ok(reply) => reply.server,
            Err(e) => {
                debug!("{ip}: no answer on / ({e}), trying snapshot paths anyway");
                None
            }
        };

        for path in DISCOVERY_PATHS {
            let url = format!("{base_url}{path}");
            for cred in credentials {
                let body = self
                    .get(url.clone(), Some(cred), self.probe_timeout)
                    .await
                    .and_then(|reply| snapshot_body(&url, reply));
                match body {
                    Ok(bytes) if image::is_valid_image(&bytes) => {
                        let (manufacturer, model) = fingerprint(server.as_deref(), path);
                        info!("camera found at {ip}{path} with {cred}: {model}");
                        return Some(DiscoveryMatch {
                            address:             ip,
                            model:               model.to_string(),
                            manufacturer:        manufacturer.to_string(),
                            working_endpoint:    path.to_string(),
                            working_credentials: cred.clone(),
                            image_size_bytes:    bytes.len(),
                        });
                    }
                    Ok(bytes) => debug!("{url}: {} bytes, not an image", bytes.len()),
                    Err(e) => debug!("{url} with {cred}: {e}"),
                }
            }
        }
        None
    }

    async fn get(
        &self,
        url:         String,
        credentials: Option<&Credentials>,
        timeout:     Duration,
    ) -> Result<HttpReply> {
        self.transport
            .fetch(FetchRequest { client: &self.client, url, credentials, timeout })
            .await
    }
}
