//! lprd - license plate recognition daemon
//!
//! This daemon:
//! 1. Loads its configuration (file, environment, flags)
//! 2. Takes the camera list from the config file or the access-control service
//! 3. Runs the recognition pipeline over every camera
//! 4. Posts recognized plates to the access-control service

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use gate_lpr::scheduler::CameraRegistry;
use gate_lpr::{AcsClient, EventDispatcher, FleetScheduler, HttpEventSink, LprConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "License plate recognition daemon for gated sites")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "LPR_CONFIG")]
    config: Option<PathBuf>,

    /// Access-control service base URL (camera list and event endpoint).
    #[arg(long, env = "LPR_ACS_BASE_URL")]
    acs_base_url: Option<String>,

    /// Seconds between per-camera health log lines. 0 disables them.
    #[arg(long, env = "LPR_HEALTH_INTERVAL_SECS", default_value_t = 5)]
    health_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = LprConfig::load_from(args.config.as_deref())?;
    if let Some(base_url) = args.acs_base_url {
        url::Url::parse(&base_url).map_err(|e| anyhow!("invalid --acs-base-url {}: {}", base_url, e))?;
        config.acs.base_url = base_url.trim_end_matches('/').to_string();
    }

    let cameras = match config.cameras.clone() {
        Some(cameras) => cameras,
        None => AcsClient::new(&config.acs.base_url, config.acs.timeout).fetch_cameras()?,
    };
    if cameras.is_empty() {
        return Err(anyhow!("no cameras configured"));
    }

    let registry = Arc::new(CameraRegistry::open(
        &cameras,
        &config.detector,
        config.reconnect_delay,
    )?);

    let sink = HttpEventSink::new(&config.acs.base_url, config.acs.timeout);
    log::info!("events are posted to {}", sink.endpoint());
    let dispatcher = EventDispatcher::new(config.event.clone(), Box::new(sink), registry.gates());
    let (event_tx, event_rx) = mpsc::channel();
    let dispatch_handle = dispatcher.spawn(event_rx)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let health_handle = if args.health_interval_secs > 0 {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(args.health_interval_secs);
        Some(
            std::thread::Builder::new()
                .name("lpr-health".to_string())
                .spawn(move || log_health(&registry, &shutdown, interval))?,
        )
    } else {
        None
    };

    let mut scheduler = FleetScheduler::new(registry.clone(), &config, event_tx)?;
    log::info!("lprd running with {} cameras (Ctrl-C to stop)", registry.len());
    scheduler.run(&shutdown);
    log::info!("shutdown signal received, stopping pipeline...");

    // Dropping the scheduler closes the event channel.
    drop(scheduler);
    match dispatch_handle.join() {
        Ok(stats) => log::info!(
            "events: {} received, {} forwarded, {} suppressed, {} failed",
            stats.received,
            stats.forwarded,
            stats.suppressed,
            stats.failed
        ),
        Err(_) => log::error!("event dispatcher panicked"),
    }
    registry.close_all();
    if let Some(handle) = health_handle {
        let _ = handle.join();
    }

    Ok(())
}

fn log_health(registry: &CameraRegistry, shutdown: &AtomicBool, interval: Duration) {
    let mut next = Instant::now() + interval;
    while !shutdown.load(Ordering::SeqCst) {
        if Instant::now() < next {
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }
        next += interval;
        for health in registry.health() {
            log::info!(
                "{}: open={} frames={} reconnects={} occupied={} starving={} tracked={}",
                health.camera_id,
                health.stream.is_open,
                health.stream.frames_captured,
                health.stream.reconnects,
                health.occupied,
                health.starving,
                health.tracked_frames
            );
        }
    }
}
