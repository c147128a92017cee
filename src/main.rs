//! CLI Entry Point for tosca-daq
//!
//! Exercises the device core from the command line:
//! - Configuration checking
//! - Motion program validation and execution (serial stage or mock axis)
//! - Camera streaming, single capture and settings save/load (mock camera)
//!
//! # Usage
//!
//! ```bash
//! tosca-daq check-config
//! tosca-daq validate-program programs/raster.json
//! tosca-daq run-program programs/raster.json --mock
//! tosca-daq stream --seconds 5
//! tosca-daq save-settings camera.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing::info;

use tosca_daq::camera::FrameAcquisition;
use tosca_daq::config::Settings;
use tosca_daq::diagnostics::TracingDiagnostics;
use tosca_daq::hardware::mock::{MockAxis, MockCameraSystem};
use tosca_daq::hardware::MotionAxis;
use tosca_daq::logging;
use tosca_daq::motion::{self, MotionEvent, SequenceEngine, TickOutcome};
use tosca_daq::session::DeviceRegistry;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "tosca-daq")]
#[command(about = "Camera acquisition and motion sequencing for the TOSCA workstation", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $TOSCA_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and print the effective configuration
    CheckConfig,

    /// Parse and validate a motion program document
    ValidateProgram {
        /// Program document (.json)
        file: PathBuf,
    },

    /// Run a motion program until it completes, fails or Ctrl+C
    RunProgram {
        /// Program document (.json)
        file: PathBuf,

        /// Use the simulated axis even if a serial port is configured
        #[arg(long)]
        mock: bool,
    },

    /// Stream from the mock camera and print frame statistics
    Stream {
        /// How long to stream
        #[arg(long, default_value = "3")]
        seconds: u64,
    },

    /// Capture a single frame from the mock camera
    Capture,

    /// Save mock camera features to a settings file
    SaveSettings {
        /// Destination (.toml)
        file: PathBuf,
    },

    /// Apply a settings file to the mock camera
    LoadSettings {
        /// Source (.toml)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.or_else(Settings::default_path);
    let settings = Settings::load(config_path.as_deref()).context("failed to load configuration")?;
    logging::init(&settings.logging)?;

    match cli.command {
        Commands::CheckConfig => check_config(&settings, config_path.as_deref()),
        Commands::ValidateProgram { file } => validate_program(&file),
        Commands::RunProgram { file, mock } => run_program(&settings, &file, mock).await,
        Commands::Stream { seconds } => {
            let settings = settings.clone();
            tokio::task::spawn_blocking(move || stream(&settings, Duration::from_secs(seconds))).await?
        }
        Commands::Capture => {
            let settings = settings.clone();
            tokio::task::spawn_blocking(move || capture(&settings)).await?
        }
        Commands::SaveSettings { file } => save_settings(&settings, &file),
        Commands::LoadSettings { file } => load_settings(&settings, &file),
    }
}

fn check_config(settings: &Settings, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) if path.exists() => println!("📄 Config file: {}", path.display()),
        Some(path) => println!("📄 Config file: {} (not found, using defaults)", path.display()),
        None => println!("📄 No config file; using defaults"),
    }
    println!("{}", toml::to_string_pretty(settings)?);
    println!("✅ Configuration valid");
    Ok(())
}

fn validate_program(file: &Path) -> Result<()> {
    let program = motion::load_program(file).with_context(|| format!("loading {}", file.display()))?;
    println!("{program}");
    println!("✅ {} steps, {} pass(es)", program.len(), program.effective_loops());
    Ok(())
}

async fn connect_axis(settings: &Settings, mock: bool) -> Result<Arc<dyn MotionAxis>> {
    if mock || settings.actuator.port.is_none() {
        println!("🔧 Using simulated axis");
        return Ok(Arc::new(MockAxis::new("MOCK_AXIS")));
    }
    #[cfg(feature = "instrument_serial")]
    {
        let axis = tosca_daq::hardware::serial_axis::SerialAxis::connect(&settings.actuator).await?;
        Ok(Arc::new(axis))
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        Err(tosca_daq::DaqError::FeatureNotEnabled("instrument_serial".to_string()).into())
    }
}

async fn run_program(settings: &Settings, file: &Path, mock: bool) -> Result<()> {
    let program = motion::load_program(file).with_context(|| format!("loading {}", file.display()))?;
    let axis = connect_axis(settings, mock).await?;
    let registry = DeviceRegistry::new();
    let engine = SequenceEngine::connect(&registry, axis, &settings.actuator, Arc::new(TracingDiagnostics))?;

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                MotionEvent::StepStarted { index, loop_index } => {
                    println!("▶️  step {index} (pass {})", loop_index + 1);
                }
                MotionEvent::StepFailed { index, cause } => println!("❌ step {index} failed: {cause}"),
                MotionEvent::ProgramComplete => println!("✅ program complete"),
                MotionEvent::Stopped => println!("⏹️  stopped"),
            }
        }
    });

    let (enabled, count) = (program.loop_enabled(), program.loop_count());
    engine.run(program, enabled, count)?;
    let ticker = motion::spawn_ticker(Arc::clone(&engine), settings.actuator.tick_interval);

    tokio::select! {
        outcome = ticker => {
            let outcome = outcome??;
            info!(?outcome, "Program finished");
            if let TickOutcome::Failed { index, cause } = outcome {
                engine.disconnect().await;
                anyhow::bail!("step {index} failed: {cause}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n🛑 Ctrl+C, stopping");
            engine.stop().await?;
        }
    }

    engine.disconnect().await;
    drop(engine);
    printer.abort();
    Ok(())
}

fn mock_camera(settings: &Settings) -> Result<FrameAcquisition> {
    let engine = FrameAcquisition::new(
        Arc::new(MockCameraSystem::single()),
        DeviceRegistry::new(),
        settings.camera.clone(),
        Arc::new(TracingDiagnostics),
    )?;
    let summary = engine.initialize()?;
    println!(
        "📷 {} {}x{} {}",
        summary.device, summary.geometry.width, summary.geometry.height, summary.geometry.pixel_format
    );
    Ok(engine)
}

fn stream(settings: &Settings, duration: Duration) -> Result<()> {
    let engine = mock_camera(settings)?;
    engine.start_streaming()?;
    let started = Instant::now();
    let mut last_id = 0;
    while started.elapsed() < duration {
        std::thread::sleep(Duration::from_millis(500));
        if let Some(frame) = engine.get_current_frame() {
            if frame.frame_id != last_id {
                let stats = frame.stats();
                println!(
                    "🖼️  frame {:>6}  mean {:6.1}  min {:3}  max {:3}",
                    frame.frame_id, stats.mean, stats.min, stats.max
                );
                last_id = frame.frame_id;
            }
        }
    }
    engine.stop_streaming()?;
    let stats = engine.stream_stats();
    println!(
        "📊 {} frames, {} dropped, {} rejected, {} requeue failures",
        stats.frames_completed, stats.frames_dropped, stats.frames_rejected, stats.requeue_failures
    );
    engine.release()?;
    Ok(())
}

fn capture(settings: &Settings) -> Result<()> {
    let engine = mock_camera(settings)?;
    let frame = engine.capture_single()?;
    let stats = frame.stats();
    println!(
        "✅ frame {} captured at {}: {} bytes, mean {:.1}",
        frame.frame_id,
        frame.timestamp,
        frame.byte_len(),
        stats.mean
    );
    engine.release()?;
    Ok(())
}

fn save_settings(settings: &Settings, file: &Path) -> Result<()> {
    let engine = mock_camera(settings)?;
    let saved = engine.save_settings(file)?;
    println!("💾 {saved} features saved to {}", file.display());
    engine.release()?;
    Ok(())
}

fn load_settings(settings: &Settings, file: &Path) -> Result<()> {
    let engine = mock_camera(settings)?;
    let report = engine.load_settings(file)?;
    for warning in report.warnings() {
        println!("⚠️  {warning}");
    }
    for (name, error) in &report.failed {
        println!("❌ {name}: {error}");
    }
    println!(
        "✅ {} applied, {} skipped, {} failed",
        report.applied.len(),
        report.skipped.len(),
        report.failed.len()
    );
    engine.release()?;
    Ok(())
}
