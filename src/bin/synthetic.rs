//! Synthetic Waveform Generator
//!
//! Generates three-component noise with periodic local events for testing
//! PULSE-RT. Every event is an impulsive P arrival, strongest on the
//! vertical, followed by a larger S arrival on the horizontals.
//!
//! # Usage
//! ```bash
//! ./synthetic --minutes 10 --speed 0 | ./pulse-rt --stdin
//! ```

use clap::Parser;
use std::io::{self, BufWriter, Write};
use std::time::Duration;

use pulse_rt::synthetic::{SyntheticConfig, WaveformGenerator};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "synthetic")]
#[command(about = "Synthetic three-component waveform generator for PULSE-RT testing")]
#[command(version = "1.0")]
struct Args {
    /// Duration in minutes (1-1440)
    #[arg(short, long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..=1440))]
    minutes: u32,

    /// Time compression factor (1 = real-time, 0 = as fast as possible)
    #[arg(short, long, default_value = "0")]
    speed: f64,

    /// Sample rate in Hz
    #[arg(long, default_value = "100")]
    sample_rate: f64,

    /// Instrument groups (repeatable), e.g. UW.GNW..BH
    #[arg(short, long = "group")]
    groups: Vec<String>,

    /// Seconds between events
    #[arg(long, default_value = "120")]
    interval: f64,

    /// Peak event amplitude relative to unit noise
    #[arg(long, default_value = "40")]
    amplitude: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Suppress the event log on stderr
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let defaults = SyntheticConfig::default();
    let config = SyntheticConfig {
        groups: if args.groups.is_empty() { defaults.groups.clone() } else { args.groups.clone() },
        sample_rate: args.sample_rate,
        duration_seconds: f64::from(args.minutes) * 60.0,
        event_interval: args.interval,
        event_amplitude: args.amplitude,
        seed: args.seed,
        ..defaults
    };
    let mut generator = WaveformGenerator::new(config)?;

    if !args.quiet {
        eprintln!("{}", "=".repeat(70));
        eprintln!("SYNTHETIC WAVEFORM GENERATOR");
        eprintln!("{}", "=".repeat(70));
        eprintln!("  Duration: {} min @ {} Hz", args.minutes, args.sample_rate);
        for (i, group) in generator.config().groups.iter().enumerate() {
            let arrivals = generator.arrivals(i);
            eprintln!("  {group}: {} events", arrivals.len());
            for t in arrivals {
                eprintln!("    P {t:.2}  S {:.2}", t + generator.config().s_delay);
            }
        }
        eprintln!("{}", "=".repeat(70));
    }

    let pace = if args.speed.is_finite() && args.speed > 0.0 {
        Some(Duration::from_secs_f64(generator.config().chunk_seconds / args.speed))
    } else {
        None
    };

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut chunks = 0u64;
    while let Some(chunk) = generator.next_chunk() {
        for segment in &chunk {
            serde_json::to_writer(&mut out, segment)?;
            out.write_all(b"\n")?;
        }
        chunks += 1;
        if let Some(pace) = pace {
            out.flush()?;
            std::thread::sleep(pace);
        }
    }
    out.flush()?;

    if !args.quiet {
        eprintln!("Generated {chunks} chunks");
    }
    Ok(())
}
