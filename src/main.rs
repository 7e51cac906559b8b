//! CLI entry point for the AO loop camera input.
//!
//! Provides:
//! - `run`: drive the read-frame stage for one loop against the built-in
//!   simulated camera
//! - `extract`: run the crop/correct republish loop on the simulated camera
//! - `show-config`: print the effective configuration
//!
//! Streams live in a registry private to this process, so `run` and `extract`
//! need the simulated camera (`[simulation] enabled = true`, as in the bundled
//! `config/aoloop.toml`, or `--simulate`). Without it they fail up front with a
//! configuration error.
//!
//! Both loops run on blocking threads; Ctrl-C raises their stop flag. A fatal
//! configuration error is logged and terminates the process with status 1.
//!
//! # Usage
//! ```bash
//! aoloop-camin run --simulate --frames 10000
//! aoloop-camin --config config/aoloop.toml run --normalize
//! aoloop-camin --config config/aoloop.toml extract --simulate
//! ```

use anyhow::{Context, Result};
use aol_stream::StreamRegistry;
use aoloop_camin::camin::{CameraInput, FrameOutcome, FrameRequest};
use aoloop_camin::config::CaminConfig;
use aoloop_camin::error::CaminError;
use aoloop_camin::extract::CropExtractLoop;
use aoloop_camin::logging;
use aoloop_camin::sim::SimulatedCamera;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "aoloop-camin")]
#[command(about = "AO loop camera input: dark subtraction and flux normalization", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = aoloop_camin::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the read-frame stage (requires the simulated camera)
    Run {
        /// Feed the source stream from the built-in simulated camera
        #[arg(long)]
        simulate: bool,

        /// Normalize by total flux
        #[arg(long)]
        normalize: bool,

        /// Stop after this many frames (default: until Ctrl-C)
        #[arg(long)]
        frames: Option<u64>,
    },

    /// Run the crop/correct republish loop from the [extract] section (requires the simulated camera)
    Extract {
        /// Feed the input stream from the built-in simulated camera
        #[arg(long)]
        simulate: bool,
    },

    /// Print the effective configuration (file plus environment) as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CaminConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config)?;
    config.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping");
                stop.store(true, Ordering::Release);
            }
        });
    }

    if let Commands::ShowConfig = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let result = match cli.command {
        Commands::Run {
            simulate,
            normalize,
            frames,
        } => {
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || run_camera_input(&config, simulate, normalize, frames, &stop))
                .await?
        }
        Commands::Extract { simulate } => {
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || run_extract(&config, simulate, &stop)).await?
        }
        Commands::ShowConfig => Ok(()),
    };

    if let Err(e) = result {
        error!(error = %e, fatal = e.is_fatal(), "Pipeline terminated");
        if e.is_fatal() {
            std::process::exit(1);
        }
        return Err(e.into());
    }
    Ok(())
}

fn run_camera_input(
    config: &CaminConfig,
    simulate: bool,
    normalize: bool,
    frames: Option<u64>,
    stop: &Arc<AtomicBool>,
) -> Result<(), CaminError> {
    config.require_frame_source(simulate)?;
    let registry = StreamRegistry::new();
    let cam_config = config.camera_input.clone();

    let mut camera = SimulatedCamera::new(&registry, &cam_config.source_name(), config.simulation.clone())?;
    let dark = aol_stream::PixelBuffer::F32(camera.dark_frame());
    let shape = aol_stream::ImageShape::new_2d(config.simulation.size_x, config.simulation.size_y);
    registry.create_with_data(&cam_config.dark_name(), shape, dark)?;

    let mut camin = CameraInput::new(cam_config, registry).with_stop_flag(Arc::clone(stop));
    camin.initialize(false)?;
    camera.start_stream()?;

    let request = FrameRequest {
        normalize,
        ..Default::default()
    };
    let mut processed = 0u64;
    let mut timeouts = 0u64;
    while !stop.load(Ordering::Acquire) && frames.map_or(true, |n| processed < n) {
        match camin.read_frame(request)? {
            FrameOutcome::Processed { timed_out, .. } => {
                processed += 1;
                timeouts += u64::from(timed_out);
            }
            FrameOutcome::Stopped => break,
        }
    }

    info!(
        processed,
        timeouts,
        wait_estimate_us = camin.wait_estimate().average_secs() * 1e6,
        total_flux = camin.total_flux(),
        "Camera input finished"
    );
    camin.shutdown();
    Ok(())
}

fn run_extract(config: &CaminConfig, simulate: bool, stop: &AtomicBool) -> Result<(), CaminError> {
    let extract_config = config
        .extract
        .as_ref()
        .ok_or_else(|| CaminError::Configuration("no [extract] section in configuration".into()))?;
    config.require_frame_source(simulate)?;

    let registry = StreamRegistry::new();
    let mut camera = SimulatedCamera::new(&registry, &extract_config.input, config.simulation.clone())?;
    camera.start_stream()?;

    let mut extract = CropExtractLoop::new(extract_config, &registry)?;
    extract.run(stop)?;
    Ok(())
}
