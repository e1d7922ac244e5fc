use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vvcam_bridge::bridge::{DeviceRegistry, LoopbackPipeline};
use vvcam_bridge::config::{BridgeConfig, ConfigStore};
use vvcam_bridge::status::StatusBus;
use vvcam_bridge::video::{BayerPattern, SensorMode};
use vvcam_bridge::BridgeError;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// vvcam-bridge command line arguments
#[derive(Parser, Debug)]
#[command(name = "vvcam-bridge")]
#[command(version, about = "Capture-session event bridge with a loopback pipeline", long_about = None)]
struct CliArgs {
    /// Configuration file (JSON, created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Video device to stream from
    #[arg(long, value_name = "ID", default_value_t = 0)]
    device: u32,

    /// Frames to capture before stopping (0 runs until Ctrl+C)
    #[arg(short = 'n', long, default_value_t = 300)]
    frames: u64,

    /// Loopback sensor frame rate (defaults to the device config)
    #[arg(long)]
    fps: Option<u32>,

    /// Capture buffers to request
    #[arg(short = 'b', long, default_value_t = 4)]
    buffers: u32,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting vvcam-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            tracing::info!("Config file: {}", path.display());
            let store = ConfigStore::new(path).await?;
            (*store.get()).clone()
        }
        None => BridgeConfig::default(),
    };

    let status = Arc::new(StatusBus::new());
    spawn_status_logger(status.subscribe());
    let registry = Arc::new(DeviceRegistry::new(&config, status)?);

    let stop = Arc::new(AtomicBool::new(false));
    let soak = {
        let registry = registry.clone();
        let stop = stop.clone();
        let fps = args.fps;
        let (device, frames, buffers) = (args.device, args.frames, args.buffers);
        tokio::task::spawn_blocking(move || run_soak(&registry, device, fps, frames, buffers, &stop))
    };
    tokio::pin!(soak);

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            stop.store(true, Ordering::Release);
            (&mut soak).await?
        }
        result = &mut soak => result?,
    };

    registry.shutdown();
    match result {
        Ok(frames) => {
            tracing::info!("Captured {} frames", frames);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Capture failed: {}", e);
            Err(e.into())
        }
    }
}

/// Stream from the loopback pipeline until `frames` were captured or `stop` is set
fn run_soak(
    registry: &DeviceRegistry,
    device_id: u32,
    fps: Option<u32>,
    frames: u64,
    buffers: u32,
    stop: &AtomicBool,
) -> Result<u64, BridgeError> {
    let device = registry.device(device_id)?;
    let config = device.config().clone();
    let mode = SensorMode {
        index: 0,
        width: config.width,
        height: config.height,
        fps: fps.unwrap_or(config.fps),
        bayer_pattern: BayerPattern::Rggb,
        bit_width: 12,
    };
    let _loopback = LoopbackPipeline::spawn(&device, mode)?;

    let session = device.open()?;
    session.set_stream_id(0)?;
    let granted = session.request_buffers(buffers)?;
    if granted.is_partial() {
        tracing::warn!(
            "Only {} of {} buffers fit the reserved memory",
            granted.granted,
            granted.requested
        );
    }
    session.set_format(config.width, config.height, config.format)?;
    for index in 0..granted.granted {
        session.queue_buffer(index)?;
    }
    session.start_stream()?;

    let mut captured = 0;
    while !stop.load(Ordering::Acquire) && (frames == 0 || captured < frames) {
        match session.dequeue_buffer(true) {
            Ok(buffer) => {
                captured += 1;
                tracing::trace!(
                    "Frame {} in buffer {} ({} bytes)",
                    buffer.sequence,
                    buffer.index,
                    buffer.bytes_used
                );
                session.queue_buffer(buffer.index)?;
            }
            Err(BridgeError::BufferError { index }) => {
                tracing::warn!("Buffer {} returned with an error", index);
                session.queue_buffer(index)?;
            }
            Err(e) => return Err(e),
        }
    }

    session.stop_stream()?;
    session.close()?;
    Ok(captured)
}

fn spawn_status_logger(mut rx: broadcast::Receiver<vvcam_bridge::status::BridgeStatus>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(status) => match serde_json::to_string(&status) {
                    Ok(json) => tracing::debug!("status {}", json),
                    Err(e) => tracing::warn!("Failed to encode {}: {}", status.event_name(), e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Status logger lagged, {} events skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vvcam_bridge=error",
        LogLevel::Warn => "vvcam_bridge=warn",
        LogLevel::Info => "vvcam_bridge=info",
        LogLevel::Verbose => "vvcam_bridge=debug,vvcam_bridge::bridge::channel=info",
        LogLevel::Debug => "vvcam_bridge=debug",
        LogLevel::Trace => "vvcam_bridge=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let (plain, json) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_json_flag() {
        let args = CliArgs::try_parse_from(["vvcam-bridge", "--log-json", "-vv"]).unwrap();
        assert!(args.log_json);
        assert_eq!(args.verbose, 2);

        let args = CliArgs::try_parse_from(["vvcam-bridge"]).unwrap();
        assert!(!args.log_json);
    }
}
