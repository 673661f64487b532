//! Classroom camera acquisition daemon and tools.
//!
//! Usage:
//!   classcam -c /etc/classcam/classcam.conf serve
//!   classcam capture aula-1 aula-2          # JSON result on stdout
//!   classcam capture --all --save
//!   classcam discover --range 192.168.1.0/24 --register
//!   classcam --stderr health

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde::Serialize;

use classcam::config::{self, ServiceConfig};
use classcam::discovery::{AddressRange, DiscoveryScanner};
use classcam::fleet::CameraFleet;
use classcam::registry::{CameraRegistry, JsonFileRegistry};
use classcam::scheduler::{BatchOptions, CaptureScheduler};
use classcam::sink::{DirectorySink, ImageSink};
use classcam::transport::{NetTransport, Transport};
use classcam::util;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "classcam", about = "Classroom IP camera acquisition service")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/classcam/classcam.conf")]
    config: PathBuf,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long, global = true)]
    stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture one image from each given camera.
    Capture {
        /// Camera ids from the registry.
        ids: Vec<String>,
        /// Capture every active registered camera.
        #[arg(long, conflicts_with = "ids")]
        all: bool,
        /// Per-attempt timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Skip the retry pass over failed cameras.
        #[arg(long)]
        no_retry: bool,
        /// Write images to img_dir for the analysis pipeline.
        #[arg(long)]
        save: bool,
    },
    /// Scan a /24 for cameras.
    Discover {
        /// `a.b.c`, `a.b.c.0/24` or `a.b.c.x-y`; defaults to the local /24.
        #[arg(long)]
        range: Option<String>,
        /// Hosts 1-50 only, two credentials.
        #[arg(long)]
        quick: bool,
        /// Add every match to the registry.
        #[arg(long)]
        register: bool,
    },
    /// Probe every registered camera once and print health stats.
    Health,
    /// Run health sweeps and periodic fleet captures until signalled.
    Serve,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("classcam: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("classcam: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    if let Err(e) = setup_logging(use_syslog) {
        eprintln!("classcam: {e:#}");
        process::exit(1);
    }

    if let Err(e) = run(cli.command, cfg).await {
        error!("{e:#}");
        eprintln!("classcam: {e:#}");
        process::exit(1);
    }
}

async fn run(command: Command, cfg: ServiceConfig) -> anyhow::Result<()> {
    let registry = JsonFileRegistry::open(&cfg.registry_file)
        .await
        .with_context(|| format!("cannot open registry {}", cfg.registry_file.display()))?;
    let registry: Arc<dyn CameraRegistry> = Arc::new(registry);
    let transport: Arc<dyn Transport> = Arc::new(NetTransport::new(cfg.ffmpeg_path.clone()));

    match command {
        Command::Capture { ids, all, timeout_ms, no_retry, save } => {
            let ids = if all {
                registry.list().await?.into_iter().map(|c| c.id).collect()
            } else {
                ids
            };
            anyhow::ensure!(!ids.is_empty(), "no cameras to capture");
            let timeout = timeout_ms.map(Duration::from_millis);
            let sink = save.then(|| DirectorySink::new(cfg.img_dir.clone()));
            let scheduler = CaptureScheduler::new(Arc::new(CameraFleet::new(cfg, registry, transport)));

            if let [id] = ids.as_slice() {
                let timeout = timeout.unwrap_or(scheduler.fleet().settings().capture_timeout);
                let result = scheduler.capture_one(id, timeout).await?;
                if let Some(sink) = &sink {
                    if result.success {
                        sink.deliver(id, &result).await?;
                    }
                }
                print_json(&result)?;
            } else {
                let opts = BatchOptions { timeout, retry_failed: !no_retry, ..BatchOptions::default() };
                let batch = scheduler.capture_many(&ids, opts).await;
                if let Some(sink) = &sink {
                    for outcome in batch.results.iter().filter(|o| o.result.success) {
                        if let Err(e) = sink.deliver(&outcome.camera_id, &outcome.result).await {
                            warn!("cannot save image for {}: {e}", outcome.camera_id);
                        }
                    }
                }
                print_json(&batch)?;
            }
        }

        Command::Discover { range, quick, register } => {
            let range: AddressRange = match range {
                Some(r) => r.parse()?,
                None => AddressRange::subnet(
                    util::local_network_prefix().context("cannot detect the local network")?,
                ),
            };
            let mut excluded = cfg.excluded.clone();
            if let Some(gw) = util::get_default_gateway() {
                excluded.insert(&gw.to_string());
            }

            let scanner = DiscoveryScanner::new(Arc::clone(&transport), &cfg)?;
            let found = if quick {
                scanner.discover_quick(&range, &excluded).await
            } else {
                scanner.discover(&range, &excluded).await
            };

            if register {
                let fleet = CameraFleet::new(cfg, registry, transport);
                for m in &found {
                    let id = format!("cam-{}", m.address.to_string().replace('.', "-"));
                    if let Err(e) = fleet.register(m.to_camera_config(id.as_str())).await {
                        warn!("cannot register {}: {e}", m.address);
                    }
                }
            }
            print_json(&found)?;
        }

        Command::Health => {
            let fleet = CameraFleet::new(cfg, registry, transport);
            fleet.health_sweep().await;
            print_json(&fleet.health().stats())?;
        }

        Command::Serve => serve(cfg, registry, transport).await?,
    }
    Ok(())
}

async fn serve(
    cfg:       ServiceConfig,
    registry:  Arc<dyn CameraRegistry>,
    transport: Arc<dyn Transport>,
) -> anyhow::Result<()> {
    if let Err(e) = util::write_pid_file(&cfg.pid_file) {
        error!("cannot write PID file {}: {e}", cfg.pid_file.display());
    }

    match NetTransport::new(cfg.ffmpeg_path.clone()).check_ffmpeg().await {
        Ok(version) => info!("{version}"),
        Err(e) => warn!("RTSP capture unavailable: {e}"),
    }

    let pid_file = cfg.pid_file.clone();
    let capture_interval = cfg.capture_interval;
    let sink: Arc<dyn ImageSink> = Arc::new(DirectorySink::new(cfg.img_dir.clone()));

    let fleet = Arc::new(CameraFleet::new(cfg, registry, transport));
    let settings = fleet.settings();
    info!(
        "classcam starting: {} concurrent captures, capture every {}s, health every {}s",
        settings.max_concurrent_captures,
        settings.capture_interval.as_secs(),
        settings.health_interval.as_secs()
    );

    let health = Arc::clone(&fleet).spawn_health_loop(settings.health_interval);
    let sweeper = Arc::clone(fleet.pool()).spawn_sweeper(settings.pool_sweep_interval);
    let scheduler = CaptureScheduler::new(Arc::clone(&fleet));
    let captures = tokio::spawn(capture_loop(scheduler, sink, capture_interval));

    wait_for_shutdown().await;
    info!("classcam shutting down");
    captures.abort();
    health.abort();
    sweeper.abort();
    util::remove_pid_file(&pid_file);
    Ok(())
}

async fn capture_loop(scheduler: CaptureScheduler, sink: Arc<dyn ImageSink>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let ids: Vec<String> = match scheduler.fleet().configs().registry().list().await {
            Ok(cams) => cams.into_iter().map(|c| c.id).collect(),
            Err(e) => {
                warn!("cannot list cameras: {e}");
                continue;
            }
        };
        if ids.is_empty() {
            continue;
        }

        let batch = scheduler.capture_many(&ids, BatchOptions::default()).await;
        for outcome in batch.results.iter().filter(|o| o.result.success) {
            if let Err(e) = sink.deliver(&outcome.camera_id, &outcome.result).await {
                warn!("cannot hand off image for {}: {e}", outcome.camera_id);
            }
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot install SIGTERM handler: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "classcam".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }
    Ok(())
}
