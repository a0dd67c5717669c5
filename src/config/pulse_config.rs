//! Pulse Configuration - every stage's tunables as one TOML document
//!
//! Each section maps onto the immutable config struct of one module. A
//! loaded file is merged over the serialized defaults, then `${group.key}`
//! references are resolved, then the result is deserialized and validated.

use super::interpolate::interpolate;
use super::validation::unknown_keys;
use super::{defaults, ConfigError};
use crate::buffer::{BufferConfig, StackFunction};
use crate::inference::InferenceConfig;
use crate::pipeline::{LoopConfig, OverflowPolicy, SlotConfig};
use crate::sink::{PickConfig, StationConfig};
use crate::trigger::TriggerConfig;
use crate::windower::WindowerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration of one pipeline run.
///
/// Load with `PulseConfig::load()` which searches:
/// 1. an explicit path (`--config`)
/// 2. `$PULSE_CONFIG`
/// 3. `./pulse.toml`
/// 4. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Identity stamped on every pick message
    pub station: StationConfig,

    /// Tick timing and queue limits
    pub sequence: SequenceConfig,

    /// Reference-aligned windowing
    pub window: WindowerConfig,

    /// Model and worker pool
    pub inference: InferenceConfig,

    /// Prediction stacking buffer
    pub stack: BufferConfig,

    /// Trigger detection
    pub trigger: TriggerConfig,

    /// Pick message formatting
    pub picks: PickConfig,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            station: StationConfig::default(),
            sequence: SequenceConfig::default(),
            window: WindowerConfig::default(),
            inference: InferenceConfig::default(),
            stack: BufferConfig::stack(
                StackFunction::Max,
                defaults::STACK_SPAN_SECONDS,
                defaults::STACK_BLINDING_SAMPLES,
            ),
            trigger: TriggerConfig::default(),
            picks: PickConfig::default(),
        }
    }
}

impl PulseConfig {
    /// Load configuration using the standard search order.
    ///
    /// A file that exists but fails to parse or validate is an error; only
    /// a missing file falls through to the next candidate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        // 1. Explicit path
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            info!(path = %path.display(), "Loaded pulse config");
            return Ok(config);
        }

        // 2. Env var
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                let config = Self::load_from_file(&p)?;
                info!(path = %p.display(), "Loaded pulse config from {}", defaults::CONFIG_ENV_VAR);
                return Ok(config);
            }
            warn!(path = %path, "{} points to non-existent file, falling back", defaults::CONFIG_ENV_VAR);
        }

        // 3. Working directory
        let local = PathBuf::from(defaults::LOCAL_CONFIG_FILE);
        if local.exists() {
            let config = Self::load_from_file(&local)?;
            info!("Loaded pulse config from ./{}", defaults::LOCAL_CONFIG_FILE);
            return Ok(config);
        }

        // 4. Defaults
        info!("No {} found, using built-in defaults", defaults::LOCAL_CONFIG_FILE);
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::parse(&contents, &path.display().to_string())
    }

    /// Parse a TOML document (for tests and embedded configs).
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, "<string>")
    }

    fn parse(contents: &str, origin: &str) -> Result<Self, ConfigError> {
        let user: toml::Value = contents
            .parse()
            .map_err(|e| ConfigError::Parse(origin.to_string(), e))?;

        // Typos warn, never fail
        for w in unknown_keys(&user) {
            warn!("{}", w);
        }

        let mut merged = toml::Value::try_from(Self::default()).map_err(ConfigError::Serialize)?;
        merge(&mut merged, user);
        let resolved = interpolate(&merged)?;

        let config: Self = resolved
            .try_into()
            .map_err(|e| ConfigError::Parse(origin.to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate every section plus the cross-section constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        errors.extend(self.sequence.validate("sequence"));
        errors.extend(self.window.validate("window"));
        errors.extend(self.inference.validate("inference"));
        errors.extend(self.stack.validate("stack"));
        errors.extend(self.trigger.validate("trigger"));
        errors.extend(self.picks.validate("picks"));

        // Every prediction segment spans one window
        let window_seconds = self.window.window_seconds();
        if self.stack.retention == crate::buffer::Retention::Seconds
            && window_seconds.is_finite()
            && self.stack.max_length < window_seconds
        {
            errors.push(format!(
                "stack.max_length ({} s) must cover at least one window ({window_seconds} s)",
                self.stack.max_length
            ));
        }
        if self.stack.blinding.saturating_mul(2) >= self.window.reference_npts {
            errors.push(format!(
                "stack.blinding ({}) blinds every sample of a {}-sample window",
                self.stack.blinding, self.window.reference_npts
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            pulse_interval: Duration::from_millis(self.sequence.pulse_interval_ms),
            max_pulse_size: self.sequence.max_pulse_size,
            channel_capacity: self.sequence.channel_capacity,
            max_pulses: self.sequence.max_pulses,
        }
    }
}

/// Overlay `user` onto `base`; tables merge key by key, anything else replaces.
fn merge(base: &mut toml::Value, user: toml::Value) {
    match (base, user) {
        (toml::Value::Table(base), toml::Value::Table(user)) => {
            for (k, v) in user {
                match base.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, user) => *base = user,
    }
}

// ============================================================================
// Sequence
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub pulse_interval_ms: u64,
    /// Items each stage consumes per pulse (also segments read per pulse)
    pub max_pulse_size: usize,
    pub max_output_size: usize,
    pub overflow: OverflowPolicy,
    /// Pulses between stage counter reports; 0 disables
    pub report_period: u64,
    pub channel_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pulses: Option<u64>,
    pub stages: StageSlots,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            pulse_interval_ms: defaults::PULSE_INTERVAL_MS,
            max_pulse_size: defaults::MAX_PULSE_SIZE,
            max_output_size: defaults::MAX_OUTPUT_SIZE,
            overflow: OverflowPolicy::DropOldest,
            report_period: 0,
            channel_capacity: defaults::SOURCE_CHANNEL_CAPACITY,
            max_pulses: None,
            stages: StageSlots::default(),
        }
    }
}

impl SequenceConfig {
    pub fn validate(&self, section: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, value) in [
            ("pulse_interval_ms", self.pulse_interval_ms),
            ("max_pulse_size", self.max_pulse_size as u64),
            ("max_output_size", self.max_output_size as u64),
            ("channel_capacity", self.channel_capacity as u64),
        ] {
            if value == 0 {
                errors.push(format!("{section}.{name} must be > 0"));
            }
        }
        for (stage, overrides) in self.stages.iter() {
            for (name, value) in [
                ("max_pulse_size", overrides.max_pulse_size),
                ("max_output_size", overrides.max_output_size),
            ] {
                if value == Some(0) {
                    errors.push(format!("{section}.stages.{stage}.{name} must be > 0"));
                }
            }
        }
        errors
    }

    /// Slot limits for one stage: the section defaults with its overrides applied.
    pub fn slot(&self, overrides: &SlotOverrides) -> SlotConfig {
        SlotConfig {
            max_pulse_size: overrides.max_pulse_size.unwrap_or(self.max_pulse_size),
            max_output_size: overrides.max_output_size.unwrap_or(self.max_output_size),
            overflow: self.overflow,
            report_period: self.report_period,
        }
    }
}

/// Optional per-stage replacements for the sequence-wide limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pulse_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_size: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSlots {
    pub window: SlotOverrides,
    pub inference: SlotOverrides,
    pub stack: SlotOverrides,
    pub trigger: SlotOverrides,
    pub picks: SlotOverrides,
}

impl StageSlots {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &SlotOverrides)> {
        [
            ("window", &self.window),
            ("inference", &self.inference),
            ("stack", &self.stack),
            ("trigger", &self.trigger),
            ("picks", &self.picks),
        ]
        .into_iter()
    }
}
