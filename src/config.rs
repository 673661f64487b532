//! Service configuration file parser.
//!
//! Plain `key = value` lines, `#` comments. Unknown keys are ignored and
//! unparsable numbers keep their compiled-in default.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CamError, Result};
use crate::registry::Credentials;

// Default constants
const MAX_CONCURRENT:     usize = 10;
const CAPTURE_TIMEOUT_MS: u64   = 15_000;
const BATCH_PAUSE_MS:     u64   = 500;
const CAPTURE_INTERVAL:   u64   = 360;
const CACHE_TTL:          u64   = 300;
const POOL_MAX_PER_HOST:  usize = 3;
const POOL_IDLE_TIMEOUT:  u64   = 300;
const POOL_SWEEP:         u64   = 600;
const HEALTH_INTERVAL:    u64   = 30;
const HEALTH_TIMEOUT:     u64   = 5;
const FAILURE_THRESHOLD:  u32   = 3;
const RTSP_TIMEOUT:       u64   = 15;
const ONVIF_TIMEOUT:      u64   = 15;
const DISCOVERY_WORKERS:  usize = 20;
const DISCOVERY_BASE:     u64   = 2;
const DISCOVERY_PROBE:    u64   = 5;
const DISCOVERY_BUDGET:   u64   = 180;

const DEFAULT_PROBE_CREDENTIALS: &str = "admin:admin123,admin:admin,admin:";

/// Addresses that are never treated as cameras (gateways, workstations, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedHosts(HashSet<String>);

impl ExcludedHosts {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            hosts
                .into_iter()
                .map(|h| h.as_ref().trim().to_string())
                .filter(|h| !h.is_empty())
                .collect(),
        )
    }

    pub fn insert(&mut self, host: &str) {
        let host = host.trim();
        if !host.is_empty() {
            self.0.insert(host.to_string());
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        self.0.contains(host.trim())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // ── Files ─────────────────────────────────────────────────────────────────
    /// JSON camera registry.
    pub registry_file: PathBuf,
    /// Where serve mode drops captured images for the analysis pipeline.
    pub img_dir:  PathBuf,
    pub pid_file: PathBuf,
    pub log_syslog: bool,
    // ── Scheduler ─────────────────────────────────────────────────────────────
    pub max_concurrent_captures: usize,
    pub capture_timeout:  Duration,
    pub batch_pause:      Duration,
    pub capture_interval: Duration,
    // ── Config cache ──────────────────────────────────────────────────────────
    pub cache_ttl: Duration,
    /// Consecutive wins a new method needs before it replaces a stored preference.
    pub preferred_confirmations: u32,
    // ── Connection pool ───────────────────────────────────────────────────────
    pub pool_max_per_host:   usize,
    pub pool_idle_timeout:   Duration,
    pub pool_sweep_interval: Duration,
    // ── Health ────────────────────────────────────────────────────────────────
    pub health_interval:      Duration,
    pub health_probe_timeout: Duration,
    pub failure_threshold:    u32,
    // ── Capture strategies ────────────────────────────────────────────────────
    pub rtsp_timeout:  Duration,
    pub onvif_timeout: Duration,
    pub ffmpeg_path:   String,
    pub user_agent:    String,
    // ── Discovery ─────────────────────────────────────────────────────────────
    pub excluded:                ExcludedHosts,
    pub probe_credentials:       Vec<Credentials>,
    pub discovery_concurrency:   usize,
    pub discovery_base_timeout:  Duration,
    pub discovery_probe_timeout: Duration,
    /// Overall discovery wall-clock bound; `None` means per-probe timeouts only.
    pub discovery_budget: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            registry_file:           PathBuf::from("/var/lib/classcam/cameras.json"),
            img_dir:                 PathBuf::from("/var/lib/classcam/images"),
            pid_file:                PathBuf::from("/var/run/classcam.pid"),
            log_syslog:              true,
            max_concurrent_captures: MAX_CONCURRENT,
            capture_timeout:         Duration::from_millis(CAPTURE_TIMEOUT_MS),
            batch_pause:             Duration::from_millis(BATCH_PAUSE_MS),
            capture_interval:        Duration::from_secs(CAPTURE_INTERVAL),
            cache_ttl:               Duration::from_secs(CACHE_TTL),
            preferred_confirmations: 1,
            pool_max_per_host:       POOL_MAX_PER_HOST,
            pool_idle_timeout:       Duration::from_secs(POOL_IDLE_TIMEOUT),
            pool_sweep_interval:     Duration::from_secs(POOL_SWEEP),
            health_interval:         Duration::from_secs(HEALTH_INTERVAL),
            health_probe_timeout:    Duration::from_secs(HEALTH_TIMEOUT),
            failure_threshold:       FAILURE_THRESHOLD,
            rtsp_timeout:            Duration::from_secs(RTSP_TIMEOUT),
            onvif_timeout:           Duration::from_secs(ONVIF_TIMEOUT),
            ffmpeg_path:             "ffmpeg".to_string(),
            user_agent:              format!("classcam/{}", env!("CARGO_PKG_VERSION")),
            excluded:                ExcludedHosts::default(),
            probe_credentials:       parse_credentials(DEFAULT_PROBE_CREDENTIALS),
            discovery_concurrency:   DISCOVERY_WORKERS,
            discovery_base_timeout:  Duration::from_secs(DISCOVERY_BASE),
            discovery_probe_timeout: Duration::from_secs(DISCOVERY_PROBE),
            discovery_budget:        Some(Duration::from_secs(DISCOVERY_BUDGET)),
        }
    }
}

/// Parse `path` as a `classcam.conf` key=value configuration file.
pub fn load_config(path: &Path) -> Result<ServiceConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| CamError::Configuration(format!("cannot read {}: {e}", path.display())))?;
    Ok(parse_config(&content))
}

/// Parse configuration text; never fails, bad values keep their defaults.
pub fn parse_config(content: &str) -> ServiceConfig {
    let mut cfg = ServiceConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "registry_file"           => cfg.registry_file           = PathBuf::from(&val),
            "img_dir"                 => cfg.img_dir                 = PathBuf::from(&val),
            "pid_file"                => cfg.pid_file                = PathBuf::from(&val),
            "log_syslog"              => cfg.log_syslog              = parse_bool(&val),
            "max_concurrent_captures" => cfg.max_concurrent_captures = val.parse().unwrap_or(MAX_CONCURRENT),
            "capture_timeout_ms"      => cfg.capture_timeout         = millis(&val, CAPTURE_TIMEOUT_MS),
            "batch_pause_ms"          => cfg.batch_pause             = millis(&val, BATCH_PAUSE_MS),
            "capture_interval"        => cfg.capture_interval        = secs(&val, CAPTURE_INTERVAL),
            "cache_ttl"               => cfg.cache_ttl               = secs(&val, CACHE_TTL),
            "preferred_confirmations" => cfg.preferred_confirmations = val.parse().unwrap_or(1),
            "pool_max_per_host"       => cfg.pool_max_per_host       = val.parse().unwrap_or(POOL_MAX_PER_HOST),
            "pool_idle_timeout"       => cfg.pool_idle_timeout       = secs(&val, POOL_IDLE_TIMEOUT),
            "pool_sweep_interval"     => cfg.pool_sweep_interval     = secs(&val, POOL_SWEEP),
            "health_interval"         => cfg.health_interval         = secs(&val, HEALTH_INTERVAL),
            "health_probe_timeout"    => cfg.health_probe_timeout    = secs(&val, HEALTH_TIMEOUT),
            "failure_threshold"       => cfg.failure_threshold       = val.parse().unwrap_or(FAILURE_THRESHOLD),
            "rtsp_timeout"            => cfg.rtsp_timeout            = secs(&val, RTSP_TIMEOUT),
            "onvif_timeout"           => cfg.onvif_timeout           = secs(&val, ONVIF_TIMEOUT),
            "ffmpeg_path"             => cfg.ffmpeg_path             = val,
            "user_agent"              => cfg.user_agent              = val,
            "excluded_ips"            => cfg.excluded                = ExcludedHosts::new(val.split(',')),
            "probe_credentials"       => cfg.probe_credentials       = parse_credentials(&val),
            "discovery_concurrency"   => cfg.discovery_concurrency   = val.parse().unwrap_or(DISCOVERY_WORKERS),
            "discovery_base_timeout"  => cfg.discovery_base_timeout  = secs(&val, DISCOVERY_BASE),
            "discovery_probe_timeout" => cfg.discovery_probe_timeout = secs(&val, DISCOVERY_PROBE),
            "discovery_budget" => {
                cfg.discovery_budget = match val.parse::<u64>() {
                    Ok(0)  => None,
                    Ok(s)  => Some(Duration::from_secs(s)),
                    Err(_) => Some(Duration::from_secs(DISCOVERY_BUDGET)),
                };
            }
            _ => {} // ignore unknown keys
        }
    }

    cfg
}

/// Validate that the configuration is usable.
pub fn validate_config(cfg: &ServiceConfig) -> Result<()> {
    if cfg.registry_file.as_os_str().is_empty() {
        return Err(CamError::Configuration("registry_file is required".into()));
    }
    if cfg.max_concurrent_captures == 0 {
        return Err(CamError::Configuration("max_concurrent_captures must be at least 1".into()));
    }
    if cfg.pool_max_per_host == 0 {
        return Err(CamError::Configuration("pool_max_per_host must be at least 1".into()));
    }
    if cfg.discovery_concurrency == 0 {
        return Err(CamError::Configuration("discovery_concurrency must be at least 1".into()));
    }
    Ok(())
}

/// Parse `user:password` pairs separated by commas. An empty password is kept.
pub fn parse_credentials(list: &str) -> Vec<Credentials> {
    list.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (user, pass) = pair.split_once(':').unwrap_or((pair, ""));
            Some(Credentials::new(user.trim(), pass.trim()))
        })
        .collect()
}

fn parse_bool(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

fn secs(val: &str, default: u64) -> Duration {
    Duration::from_secs(val.parse().unwrap_or(default))
}

fn millis(val: &str, default: u64) -> Duration {
    Duration::from_millis(val.parse().unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys_and_ignores_the_rest() {
        let cfg = parse_config(
            "# classroom cameras\n\
             registry_file = /tmp/cams.json\n\
             max_concurrent_captures = 4\n\
             excluded_ips = 192.168.1.1, 192.168.1.4\n\
             probe_credentials = admin:secret,root:\n\
             discovery_budget = 0\n\
             frobnicate = yes\n",
        );
        assert_eq!(cfg.registry_file, PathBuf::from("/tmp/cams.json"));
        assert_eq!(cfg.max_concurrent_captures, 4);
        assert!(cfg.excluded.contains("192.168.1.4"));
        assert_eq!(cfg.excluded.len(), 2);
        assert_eq!(cfg.probe_credentials.len(), 2);
        assert_eq!(cfg.probe_credentials[1].username, "root");
        assert!(cfg.probe_credentials[1].password.is_empty());
        assert!(cfg.discovery_budget.is_none());
    }

    #[test]
    fn bad_numbers_keep_defaults() {
        let cfg = parse_config("failure_threshold = many\ncache_ttl = soon\n");
        assert_eq!(cfg.failure_threshold, FAILURE_THRESHOLD);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(CACHE_TTL));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = parse_config("max_concurrent_captures = 0\n");
        assert!(validate_config(&cfg).is_err());
        assert!(validate_config(&ServiceConfig::default()).is_ok());
    }

    #[test]
    fn default_probe_credentials_include_empty_password() {
        let creds = ServiceConfig::default().probe_credentials;
        assert_eq!(creds.len(), 3);
        assert_eq!(creds[2].username, "admin");
        assert!(creds[2].password.is_empty());
    }
}
