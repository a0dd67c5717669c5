//! Pulse Configuration Module
//!
//! One TOML document configures every stage of the pipeline. The loaded
//! config is resolved once at startup into the immutable per-module structs
//! (`BufferConfig`, `WindowerConfig`, `InferenceConfig`, `TriggerConfig`,
//! `PickConfig`, `SlotConfig`) and never changes during a run.
//!
//! ## Loading Order
//!
//! 1. `--config <path>` on the command line
//! 2. `PULSE_CONFIG` environment variable (path to TOML file)
//! 3. `pulse.toml` in the current working directory
//! 4. Built-in defaults
//!
//! ## Usage
//!
//! ```ignore
//! let config = PulseConfig::load(args.config.as_deref())?;
//! let sequencer = pipeline::build_sequencer(&config)?;
//! ```

mod pulse_config;
pub mod defaults;
pub mod interpolate;
pub mod validation;

pub use interpolate::InterpolationError;
pub use pulse_config::*;

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config parse error ({0}): {1}")]
    Parse(String, #[source] toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config interpolation failed: {0}")]
    Interpolation(#[from] InterpolationError),

    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}
