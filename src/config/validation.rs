//! Config validation: unknown-key detection with Levenshtein suggestions.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use std::collections::HashSet;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, ", did you mean '{s}'?")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Per-stage slot override sections under `[sequence]`.
const STAGE_SECTIONS: [&str; 5] = ["window", "inference", "stack", "trigger", "picks"];

/// Returns the complete set of valid dotted key paths for `PulseConfig`.
///
/// Maintained by hand to match the struct hierarchy in pulse_config.rs
/// and the per-module config structs.
pub fn known_config_keys() -> HashSet<String> {
    let keys: &[&str] = &[
        // [station]
        "station",
        "station.installation_id",
        "station.module_id",
        "station.message_type",
        // [sequence]
        "sequence",
        "sequence.pulse_interval_ms",
        "sequence.max_pulse_size",
        "sequence.max_output_size",
        "sequence.overflow",
        "sequence.report_period",
        "sequence.channel_capacity",
        "sequence.max_pulses",
        // [window]
        "window",
        "window.reference_component",
        "window.other_components",
        "window.reference_npts",
        "window.reference_overlap",
        "window.reference_sampling_rate",
        "window.reference_completeness_threshold",
        "window.other_completeness_threshold",
        "window.fill_value",
        "window.meta_memory",
        "window.max_output_size",
        // [inference]
        "inference",
        "inference.model",
        "inference.min_batch_size",
        "inference.max_batch_size",
        "inference.worker_threads",
        // [inference.sta_lta]
        "inference.sta_lta",
        "inference.sta_lta.sta_seconds",
        "inference.sta_lta.lta_seconds",
        "inference.sta_lta.scale",
        // [stack]
        "stack",
        "stack.method",
        "stack.stack_function",
        "stack.max_length",
        "stack.retention",
        "stack.blinding",
        "stack.fill_value",
        // [trigger]
        "trigger",
        "trigger.trigger_level",
        "trigger.fold_threshold",
        "trigger.leading_mute",
        "trigger.pick_method",
        "trigger.cooldown_samples",
        // [picks]
        "picks",
        "picks.quality_bins",
        "picks.report_component",
    ];
    let mut known: HashSet<String> = keys.iter().map(|k| (*k).to_string()).collect();
    // [sequence.stages.<stage>]
    known.insert("sequence.stages".to_string());
    for stage in STAGE_SECTIONS {
        known.insert(format!("sequence.stages.{stage}"));
        for field in ["max_pulse_size", "max_output_size"] {
            known.insert(format!("sequence.stages.{stage}.{field}"));
        }
    }
    known
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// For example, a table `{ a = { b = 1, c = 2 } }` yields:
/// `["a", "a.b", "a.c"]`
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
///
/// Ties go to the lexicographically smaller key so suggestions are stable.
pub fn suggest_correction(unknown: &str, known: &HashSet<String>) -> Option<String> {
    known
        .iter()
        .map(|k| (levenshtein(unknown, k), k))
        .filter(|(dist, _)| *dist <= 3)
        .min()
        .map(|(_, k)| k.clone())
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// This does NOT fail on unknown keys, it only warns.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        // parse errors are reported by the typed load
        return Vec::new();
    };
    unknown_keys(&value)
}

/// Unknown-key warnings for an already parsed tree.
pub fn unknown_keys(value: &toml::Value) -> Vec<ValidationWarning> {
    let known = known_config_keys();
    walk_toml_keys(value, "")
        .into_iter()
        .filter(|key| !known.contains(key))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
