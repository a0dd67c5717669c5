//! Trigger detection on stacked probability streams
//!
//! One state machine per stream key:
//!
//! ```text
//! Idle ──(p ≥ level, past mute)──▶ AboveThreshold ──(peak fold ≥ threshold)──▶ Emitting
//!  ▲                                    │                                          │
//!  │                             (p < level)                                 (p < level)
//!  │                          fold rejected, no pick                          Trigger out
//!  └────────────────────────────────────┴───────────── Cooldown ◀─────────────────┘
//! ```
//!
//! Sample positions are counted from the first sample ever seen for a key, so
//! segment boundaries are transparent and `leading_mute` is measured in
//! samples from stream start.

use crate::types::{PickMethod, Segment, Trigger};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Probability at or above which a run opens
    pub trigger_level: f64,
    /// Minimum fold of the peak sample for the run to be reported
    pub fold_threshold: u32,
    /// Samples from stream start during which nothing can trigger
    pub leading_mute: usize,
    pub pick_method: PickMethod,
    /// Samples after a run closes during which nothing can trigger
    pub cooldown_samples: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            trigger_level: 0.21,
            fold_threshold: 1,
            leading_mute: 0,
            pick_method: PickMethod::Max,
            cooldown_samples: 100,
        }
    }
}

impl TriggerConfig {
    pub fn validate(&self, section: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.trigger_level.is_finite() || self.trigger_level <= 0.0 || self.trigger_level > 1.0 {
            errors.push(format!(
                "{section}.trigger_level = {} must be within (0, 1]",
                self.trigger_level
            ));
        }
        if self.fold_threshold == 0 {
            errors.push(format!("{section}.fold_threshold must be >= 1"));
        }
        errors
    }
}

// ============================================================================
// State
// ============================================================================

/// Externally visible detector state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Idle,
    AboveThreshold,
    Emitting,
    Cooldown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerStats {
    pub samples_seen: u64,
    pub runs_opened: u64,
    pub triggers: u64,
    /// Runs that closed without the peak reaching `fold_threshold`
    pub fold_rejected: u64,
    pub segments_ignored: u64,
}

#[derive(Debug, Clone)]
struct Run {
    onset_index: i64,
    peak_index: i64,
    peak_value: f64,
    peak_fold: u32,
    /// Best sample with fold at or above the threshold
    validated: Option<(i64, f64, u32)>,
    weighted_index: f64,
    weight: f64,
}

impl Run {
    fn open(index: i64, value: f64, fold: u32, fold_threshold: u32) -> Self {
        let mut run = Self {
            onset_index: index,
            peak_index: index,
            peak_value: value,
            peak_fold: fold,
            validated: None,
            weighted_index: 0.0,
            weight: 0.0,
        };
        run.accumulate(index, value, fold, fold_threshold);
        run
    }

    fn accumulate(&mut self, index: i64, value: f64, fold: u32, fold_threshold: u32) {
        if value > self.peak_value {
            self.peak_index = index;
            self.peak_value = value;
            self.peak_fold = fold;
        }
        if fold >= fold_threshold && self.validated.map_or(true, |(_, v, _)| value > v) {
            self.validated = Some((index, value, fold));
        }
        self.weighted_index += value * index as f64;
        self.weight += value;
    }
}

#[derive(Debug, Clone)]
enum RunState {
    Idle,
    AboveThreshold(Run),
    Emitting(Run),
    Cooldown { until: i64 },
}

#[derive(Debug)]
struct KeyTracker {
    origin: f64,
    sample_rate: f64,
    last_index: Option<i64>,
    state: RunState,
}

impl KeyTracker {
    fn time_of(&self, index: i64) -> f64 {
        self.origin + index as f64 / self.sample_rate
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Per-key trigger state machines. Exclusively owned by one stage.
#[derive(Debug)]
pub struct TriggerDetector {
    config: TriggerConfig,
    keys: BTreeMap<String, KeyTracker>,
    stats: TriggerStats,
}

impl TriggerDetector {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            keys: BTreeMap::new(),
            stats: TriggerStats::default(),
        }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn stats(&self) -> &TriggerStats {
        &self.stats
    }

    pub fn state(&self, key: &str) -> Option<DetectorState> {
        self.keys.get(key).map(|t| match t.state {
            RunState::Idle => DetectorState::Idle,
            RunState::AboveThreshold(_) => DetectorState::AboveThreshold,
            RunState::Emitting(_) => DetectorState::Emitting,
            RunState::Cooldown { .. } => DetectorState::Cooldown,
        })
    }

    /// Feed one stacked segment; returns triggers whose runs closed inside it.
    pub fn process(&mut self, segment: &Segment) -> Vec<Trigger> {
        let config = &self.config;
        let stats = &mut self.stats;
        let tracker = self.keys.entry(segment.key.clone()).or_insert_with(|| KeyTracker {
            origin: segment.start_time,
            sample_rate: segment.sample_rate,
            last_index: None,
            state: RunState::Idle,
        });
        if (tracker.sample_rate - segment.sample_rate).abs() > tracker.sample_rate * 1e-9 {
            warn!(
                key = %segment.key,
                sample_rate = segment.sample_rate,
                expected = tracker.sample_rate,
                "Stacked stream changed sample rate, ignoring segment"
            );
            stats.segments_ignored += 1;
            return Vec::new();
        }

        let first = ((segment.start_time - tracker.origin) * tracker.sample_rate).round() as i64;
        let mut triggers = Vec::new();
        for (i, (&value, &fold)) in segment.samples.iter().zip(&segment.fold).enumerate() {
            let index = first + i as i64;
            if tracker.last_index.is_some_and(|last| index <= last) {
                continue;
            }
            // Missing samples between segments close any open run
            if let Some(last) = tracker.last_index {
                if index > last + 1 {
                    triggers.extend(close_run(config, stats, &segment.key, tracker, last + 1));
                }
            }
            tracker.last_index = Some(index);
            stats.samples_seen += 1;
            triggers.extend(step(config, stats, &segment.key, tracker, index, value, fold));
        }
        triggers
    }

    /// Close every open run at end of stream.
    pub fn flush(&mut self) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        for (key, tracker) in &mut self.keys {
            if let Some(last) = tracker.last_index {
                triggers.extend(close_run(&self.config, &mut self.stats, key, tracker, last + 1));
            }
        }
        triggers
    }
}

fn step(
    config: &TriggerConfig,
    stats: &mut TriggerStats,
    key: &str,
    tracker: &mut KeyTracker,
    index: i64,
    value: f64,
    fold: u32,
) -> Option<Trigger> {
    if index < config.leading_mute as i64 {
        return None;
    }
    if let RunState::Cooldown { until } = tracker.state {
        if index < until {
            return None;
        }
        tracker.state = RunState::Idle;
    }

    let above = fold > 0 && value >= config.trigger_level;
    if !above {
        return close_run(config, stats, key, tracker, index);
    }

    let next = match std::mem::replace(&mut tracker.state, RunState::Idle) {
        RunState::Idle => {
            stats.runs_opened += 1;
            promote(config, Run::open(index, value, fold, config.fold_threshold))
        }
        RunState::AboveThreshold(mut run) => {
            run.accumulate(index, value, fold, config.fold_threshold);
            promote(config, run)
        }
        RunState::Emitting(mut run) => {
            run.accumulate(index, value, fold, config.fold_threshold);
            RunState::Emitting(run)
        }
        cooldown @ RunState::Cooldown { .. } => cooldown,
    };
    tracker.state = next;
    None
}

fn promote(config: &TriggerConfig, run: Run) -> RunState {
    if run.peak_fold >= config.fold_threshold {
        RunState::Emitting(run)
    } else {
        RunState::AboveThreshold(run)
    }
}

/// End the open run (if any) at the first sample below the level.
fn close_run(
    config: &TriggerConfig,
    stats: &mut TriggerStats,
    key: &str,
    tracker: &mut KeyTracker,
    offset_index: i64,
) -> Option<Trigger> {
    match std::mem::replace(&mut tracker.state, RunState::Idle) {
        RunState::Emitting(run) => {
            let (peak_index, peak_value, fold_at_peak) =
                run.validated.unwrap_or((run.peak_index, run.peak_value, run.peak_fold));
            let pick_index = match config.pick_method {
                PickMethod::Max => peak_index as f64,
                PickMethod::Onset => run.onset_index as f64,
                PickMethod::Centroid if run.weight > 0.0 => run.weighted_index / run.weight,
                PickMethod::Centroid => peak_index as f64,
            };
            let trigger = Trigger {
                group_key: key.to_string(),
                onset_time: tracker.time_of(run.onset_index),
                offset_time: tracker.time_of(offset_index),
                peak_time: tracker.time_of(peak_index),
                peak_value,
                fold_at_peak,
                pick_time: tracker.origin + pick_index / tracker.sample_rate,
                pick_method: config.pick_method,
            };
            info!(
                key = %key,
                onset = trigger.onset_time,
                peak = trigger.peak_value,
                fold = trigger.fold_at_peak,
                "Trigger"
            );
            stats.triggers += 1;
            tracker.state = RunState::Cooldown {
                until: offset_index + config.cooldown_samples as i64,
            };
            Some(trigger)
        }
        RunState::AboveThreshold(run) => {
            debug!(
                key = %key,
                onset = tracker.time_of(run.onset_index),
                peak_fold = run.peak_fold,
                "Run closed below fold threshold"
            );
            stats.fold_rejected += 1;
            None
        }
        other => {
            tracker.state = other;
            None
        }
    }
}
