//! PULSE-RT - real-time windowed detection pipeline
//!
//! Reads continuous three-component waveform segments, detects phase
//! arrivals, and writes one pick message per trigger to stdout.
//!
//! # Usage
//!
//! ```bash
//! # Run against the in-process synthetic source (ten minutes, as fast as possible)
//! cargo run --release -- --minutes 10 --speed 0
//!
//! # Run against JSON segments on stdin
//! ./synthetic --minutes 10 | ./pulse-rt --stdin
//!
//! # Use a config file
//! ./pulse-rt --config pulse.toml --stdin
//! ```
//!
//! # Environment Variables
//!
//! - `PULSE_CONFIG`: Path to a TOML config (used when `--config` is absent)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pulse_rt::config::{defaults, PulseConfig};
use pulse_rt::pipeline::source::{SegmentSource, StdinSource, SyntheticSource};
use pulse_rt::pipeline::{build_sequencer, ProcessingLoop, RunSummary};
use pulse_rt::sink::StdoutSink;
use pulse_rt::synthetic::SyntheticConfig;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "pulse-rt")]
#[command(about = "Real-time windowed detection pipeline for streaming waveform data")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read JSON segments from stdin instead of the synthetic source
    /// Use with the generator: ./synthetic --minutes 10 | ./pulse-rt --stdin
    #[arg(long)]
    stdin: bool,

    /// Synthetic source duration in minutes
    #[arg(long, default_value = "10")]
    minutes: u32,

    /// Synthetic source speed (1 = realtime, 0 = no delay)
    #[arg(long, default_value_t = defaults::SYNTHETIC_SPEED)]
    speed: f64,

    /// Random seed for the synthetic source
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many pulses
    #[arg(long)]
    pulses: Option<u64>,

    /// Print the resolved config as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Write final statistics as JSON to this file
    #[arg(long, value_name = "PATH")]
    stats: Option<PathBuf>,
}

// ============================================================================
// Pipeline Runner
// ============================================================================

async fn run<S: SegmentSource>(config: &PulseConfig, source: S, cancel_token: CancellationToken) -> Result<RunSummary> {
    let sequencer = build_sequencer(config).context("Failed to assemble pipeline")?;
    let processing = ProcessingLoop::new(sequencer, StdoutSink, config.loop_config(), cancel_token);
    Ok(processing.run(source).await)
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries pick messages
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    let mut config = PulseConfig::load(args.config.as_deref())?;
    if args.pulses.is_some() {
        config.sequence.max_pulses = args.pulses;
    }
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  PULSE-RT - windowed detection pipeline");
    info!(
        "  Window: {} samples @ {} Hz, step {} s",
        config.window.reference_npts,
        config.window.reference_sampling_rate,
        config.window.step_seconds()
    );
    info!(
        "  Trigger level {} | fold >= {} | pick = {}",
        config.trigger.trigger_level, config.trigger.fold_threshold, config.trigger.pick_method
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let summary = if args.stdin {
        info!("📥 Input: stdin (JSON segments)");
        run(&config, StdinSource::new(), cancel_token).await?
    } else {
        let synthetic = SyntheticConfig {
            sample_rate: config.window.reference_sampling_rate,
            duration_seconds: f64::from(args.minutes) * 60.0,
            seed: args.seed,
            ..SyntheticConfig::default()
        };
        info!(
            "📥 Input: synthetic ({} groups, {} min, speed {})",
            synthetic.groups.len(),
            args.minutes,
            args.speed
        );
        let source = SyntheticSource::new(synthetic, args.speed)?;
        run(&config, source, cancel_token).await?
    };

    if let Some(path) = args.stats {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Statistics written");
    }

    info!("✓ PULSE-RT shutdown complete");
    Ok(())
}
