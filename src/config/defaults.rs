//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Config Loading
// ============================================================================

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "PULSE_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "pulse.toml";

/// Longest `${group.key}` reference chain followed before giving up.
pub const MAX_INTERPOLATION_DEPTH: usize = 32;

// ============================================================================
// Sequence
// ============================================================================

/// Tick period of the processing loop (ms).
pub const PULSE_INTERVAL_MS: u64 = 100;

/// Items a stage consumes per pulse.
pub const MAX_PULSE_SIZE: usize = 10;

/// Items a stage's output queue may hold.
pub const MAX_OUTPUT_SIZE: usize = 100;

/// Segments buffered between the source task and the loop.
pub const SOURCE_CHANNEL_CAPACITY: usize = 1_024;

// ============================================================================
// Stack Buffer
// ============================================================================

/// Retained span of each stacked prediction trace (seconds).
///
/// 300 s = five 60 s windows.
pub const STACK_SPAN_SECONDS: f64 = 300.0;

/// Samples blinded at both edges of each prediction segment.
///
/// 500 samples at 100 Hz = 5 s.
pub const STACK_BLINDING_SAMPLES: usize = 500;

// ============================================================================
// Synthetic Source
// ============================================================================

/// Time compression of the in-process synthetic source (`--speed`).
pub const SYNTHETIC_SPEED: f64 = 1.0;
