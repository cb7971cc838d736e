// src/main.rs - sousvided entry point
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use sousvide_rs::config::{self, Config};
use sousvide_rs::hardware::sim::{SimBoard, SimulatedBath};
use sousvide_rs::hardware::{Board, HardwareError};
use sousvide_rs::scheduler::{Clock, MonotonicClock};
use sousvide_rs::sousvide::SousVide;

/// Sous vide controller daemon
#[derive(Parser, Debug)]
#[command(name = "sousvided", version, about = "Sous vide water bath controller.")]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against the simulated bath instead of the Pi hardware
    #[arg(long)]
    simulate: bool,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    run_for: Option<u64>,
}

fn select_board(
    cli: &Cli,
    config: &Config,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn Board>, HardwareError> {
    if cli.simulate {
        tracing::info!("Using simulated water bath");
        let bath = SimulatedBath::new(config.simulation.parameters(&config.calibration), clock);
        return Ok(Box::new(SimBoard::new(bath)));
    }
    #[cfg(feature = "rpi")]
    {
        Ok(Box::new(sousvide_rs::hardware::rpi::RpiBoard::new(config)?))
    }
    #[cfg(not(feature = "rpi"))]
    {
        Err(HardwareError::Unsupported(
            "built without the `rpi` feature, run with --simulate".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    tracing::info!("Starting sousvided");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            match config::load_config(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("Failed to load config from '{}': {}", path, e);
                    return ExitCode::FAILURE;
                }
            }
        }
        None => {
            tracing::info!("No config file given, using defaults");
            Config::default()
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return ExitCode::FAILURE;
    }

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
    let mut board = match select_board(&cli, &config, clock.clone()) {
        Ok(board) => board,
        Err(e) => {
            tracing::error!("Failed to open hardware: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let sousvide = match tokio::task::block_in_place(|| {
        SousVide::start(&config, board.as_mut(), clock)
    }) {
        Ok(sousvide) => sousvide,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut status_tick =
        tokio::time::interval(Duration::from_secs(config.daemon.status_interval_secs));
    let deadline = async {
        match cli.run_for {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                break;
            }
            _ = &mut deadline => {
                tracing::info!("Run time elapsed");
                break;
            }
            _ = status_tick.tick() => {
                let status = sousvide.status();
                let temperature = status
                    .temperature
                    .map_or_else(|| "--".to_string(), |t| format!("{t:.2}"));
                tracing::info!(
                    "bath {} °C (setpoint {:.1}){} | heater {:.0}% {} | motor {:.0}%{}",
                    temperature,
                    status.setpoint,
                    if status.sensor_fault { " FAULT" } else { "" },
                    status.heater_output * 100.0,
                    if status.heater_on { "on" } else { "off" },
                    status.motor_percentage,
                    if status.motor_running { "" } else { " (stopped)" }
                );
            }
        }
    }

    match tokio::task::spawn_blocking(move || sousvide.shutdown()).await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!("Shutdown failed: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("Shutdown task panicked: {}", e);
            ExitCode::FAILURE
        }
    }
}
