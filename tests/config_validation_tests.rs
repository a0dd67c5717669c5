//! Config Validation Tests
//!
//! Exercise loading, typo detection, interpolation, and range validation
//! through real files, independently from the rest of the pipeline.

use pulse_rt::buffer::{MergeMethod, StackFunction};
use pulse_rt::config::validation::{known_config_keys, suggest_correction, validate_unknown_keys};
use pulse_rt::config::{ConfigError, PulseConfig};
use pulse_rt::pipeline::OverflowPolicy;
use pulse_rt::types::PickMethod;
use std::io::Write;
use std::path::Path;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

// ============================================================================
// Typo Detection
// ============================================================================

#[test]
fn typo_in_window_section_warns_with_suggestion() {
    let toml_str = r#"
[window]
reference_ovrlap = 1500
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1, "Expected exactly 1 warning");
    assert_eq!(
        warnings[0].suggestion.as_deref(),
        Some("window.reference_overlap")
    );
}

#[test]
fn typo_does_not_prevent_loading() {
    let file = write_config("[trigger]\nfold_treshold = 3\n");
    let config = PulseConfig::load_from_file(file.path()).unwrap();
    // The misspelled key is ignored, the default stays
    assert_eq!(config.trigger.fold_threshold, 1);
}

#[test]
fn every_default_key_is_known() {
    let toml_str = PulseConfig::default().to_toml().unwrap();
    let warnings = validate_unknown_keys(&toml_str);
    assert!(warnings.is_empty(), "Unexpected warnings: {warnings:?}");
}

#[test]
fn garbage_key_gets_no_suggestion() {
    let known = known_config_keys();
    assert!(suggest_correction("zzzzzzzzzzzzzzzzzzzz", &known).is_none());
}

// ============================================================================
// File Loading
// ============================================================================

#[test]
fn full_file_loads_every_section() {
    let file = write_config(
        r#"
[station]
installation_id = 2
module_id = 45

[sequence]
pulse_interval_ms = 50
overflow = "hold"

[window]
reference_npts = 3000
reference_overlap = 1500

[inference]
worker_threads = 1

[stack]
stack_function = "mean"
max_length = 120.0

[trigger]
trigger_level = 0.3
fold_threshold = 2
pick_method = "onset"

[picks]
quality_bins = [0.8, 0.6]
"#,
    );
    let config = PulseConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.station.installation_id, 2);
    assert_eq!(config.sequence.pulse_interval_ms, 50);
    assert_eq!(config.sequence.overflow, OverflowPolicy::Hold);
    assert_eq!(config.window.reference_npts, 3000);
    assert_eq!(config.inference.worker_threads, 1);
    assert_eq!(config.stack.method, MergeMethod::Stack);
    assert_eq!(config.stack.stack_function, StackFunction::Mean);
    assert_eq!(config.trigger.pick_method, PickMethod::Onset);
    assert_eq!(config.picks.quality_bins, vec![0.8, 0.6]);
}

#[test]
fn interpolated_values_load_from_file() {
    let file = write_config(
        r#"
[window]
reference_npts = 4000
reference_overlap = 2000

[trigger]
leading_mute = "${window.reference_overlap}"
"#,
    );
    let config = PulseConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.trigger.leading_mute, 2000);
}

#[test]
fn interpolation_cycle_is_fatal() {
    let file = write_config(
        r#"
[trigger]
leading_mute = "${trigger.cooldown_samples}"
cooldown_samples = "${trigger.leading_mute}"
"#,
    );
    let err = PulseConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Interpolation(_)), "{err}");
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let file = write_config("[window\nreference_npts = 10\n");
    let err = PulseConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(..)));
}

#[test]
fn wrong_value_type_is_a_parse_error() {
    let err = PulseConfig::from_toml_str("[window]\nreference_npts = \"many\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(..)));
}

#[test]
fn missing_explicit_file_is_an_io_error() {
    let err = PulseConfig::load(Some(Path::new("/nonexistent/pulse.toml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Io(..)));
}

// ============================================================================
// Range Validation
// ============================================================================

#[test]
fn overlap_not_below_npts_is_rejected() {
    let file = write_config("[window]\nreference_npts = 100\nreference_overlap = 100\n");
    let Err(ConfigError::Validation(errors)) = PulseConfig::load_from_file(file.path()) else {
        panic!("expected validation failure");
    };
    assert!(errors.iter().any(|e| e.contains("reference_overlap")));
}

#[test]
fn stack_retention_above_limit_is_rejected() {
    let err = PulseConfig::from_toml_str("[stack]\nmax_length = 5000.0\n").unwrap_err();
    let ConfigError::Validation(errors) = err else {
        panic!("expected validation failure");
    };
    assert!(errors.iter().any(|e| e.contains("retention limit")), "{errors:?}");
}

#[test]
fn zero_fold_threshold_is_rejected() {
    let err = PulseConfig::from_toml_str("[trigger]\nfold_threshold = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn ascending_quality_bins_are_rejected() {
    let err = PulseConfig::from_toml_str("[picks]\nquality_bins = [0.3, 0.6]\n").unwrap_err();
    assert!(err.to_string().contains("strictly descending"), "{err}");
}

#[test]
fn validation_message_lists_each_problem() {
    let err = PulseConfig::from_toml_str(
        r#"
[sequence]
max_output_size = 0
[inference]
worker_threads = 0
"#,
    )
    .unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("Config validation failed:"));
    assert!(text.contains("sequence.max_output_size"));
    assert!(text.contains("inference.worker_threads"));
}
