//! Per-key, capacity-bounded segment buffer
//!
//! Accumulates time-stamped [`Segment`]s per key under one of three merge
//! policies:
//!
//! - **append**: time-ordered insertion, overlap resolved in favour of
//!   retained samples, oldest segments evicted past `max_length`
//! - **overwrite**: last write wins, one segment per key
//! - **stack**: fold-weighted stack merge of overlapping (blinded) segments
//!   into one continuous trace per key, drained as samples settle or expire
//!
//! Per key the retained segments are always sorted by `start_time` and
//! never overlap.

mod stack;

use crate::types::Segment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};

/// Longest span a seconds-retention buffer may hold.
pub const MAX_RETENTION_SECONDS: f64 = 1200.0;

// ============================================================================
// Configuration
// ============================================================================

/// Buffer merge policy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    #[default]
    Append,
    Overwrite,
    Stack,
}

/// Sample-wise combining function for the stack policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackFunction {
    /// Overlapping samples become fill with fold 0
    Mask,
    #[default]
    Max,
    /// Fold-weighted average
    Mean,
}

/// Unit of `max_length`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// `max_length` counts segments per key
    #[default]
    Segments,
    /// `max_length` is the retained span in seconds per key
    Seconds,
}

/// Immutable buffer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub method: MergeMethod,
    pub stack_function: StackFunction,
    pub max_length: f64,
    pub retention: Retention,
    /// Samples discarded from each edge of a stacked segment
    pub blinding: usize,
    /// Value written into stack samples no contribution has reached yet
    pub fill_value: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            method: MergeMethod::Append,
            stack_function: StackFunction::Max,
            max_length: 10.0,
            retention: Retention::Segments,
            blinding: 0,
            fill_value: 0.0,
        }
    }
}

impl BufferConfig {
    pub fn append(max_segments: usize) -> Self {
        Self {
            max_length: max_segments as f64,
            ..Self::default()
        }
    }

    pub fn overwrite() -> Self {
        Self {
            method: MergeMethod::Overwrite,
            max_length: 1.0,
            ..Self::default()
        }
    }

    pub fn stack(function: StackFunction, span_seconds: f64, blinding: usize) -> Self {
        Self {
            method: MergeMethod::Stack,
            stack_function: function,
            max_length: span_seconds,
            retention: Retention::Seconds,
            blinding,
            fill_value: 0.0,
        }
    }

    /// Append buffer bounded by time span rather than segment count.
    pub fn append_span(span_seconds: f64) -> Self {
        Self {
            max_length: span_seconds,
            retention: Retention::Seconds,
            ..Self::default()
        }
    }

    /// Range checks; returns one message per problem.
    pub fn validate(&self, section: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.max_length.is_finite() || self.max_length <= 0.0 {
            errors.push(format!("{section}.max_length must be a positive number"));
        }
        match self.retention {
            Retention::Seconds if self.max_length > MAX_RETENTION_SECONDS => errors.push(format!(
                "{section}.max_length = {} exceeds the {MAX_RETENTION_SECONDS} s retention limit",
                self.max_length
            )),
            Retention::Segments if self.max_length.fract() != 0.0 => errors.push(format!(
                "{section}.max_length must be a whole number of segments"
            )),
            _ => {}
        }
        if self.method == MergeMethod::Stack && self.retention != Retention::Seconds {
            errors.push(format!("{section}: method = \"stack\" requires retention = \"seconds\""));
        }
        if !self.fill_value.is_finite() {
            errors.push(format!("{section}.fill_value must be finite"));
        }
        errors
    }

    fn max_segments(&self) -> Option<usize> {
        match self.retention {
            Retention::Segments => Some(self.max_length.max(1.0) as usize),
            Retention::Seconds => None,
        }
    }

    fn span_seconds(&self) -> Option<f64> {
        match self.retention {
            Retention::Seconds => Some(self.max_length),
            Retention::Segments => None,
        }
    }
}

// ============================================================================
// Error / Outcome Types
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum BufferError {
    #[error("Empty segment for key {0}")]
    EmptySegment(String),

    #[error("Sample rate mismatch for key {key}: buffer has {buffered} Hz, segment has {incoming} Hz")]
    SampleRateMismatch {
        key: String,
        buffered: f64,
        incoming: f64,
    },

    #[error("Invalid sample rate {1} for key {0}")]
    InvalidSampleRate(String, f64),
}

/// What happened to an ingested segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored as this many non-overlapping pieces
    Inserted(usize),
    /// Every sample was already buffered
    Duplicate,
    /// Replaced the previous segment for the key
    Replaced,
    /// Merged into the key's stacked trace
    Stacked,
    /// Started a fresh stacked trace, discarding retained data
    Reinitialized,
    /// Nothing survived edge blinding
    Blinded,
    /// Entirely older than the retention or drain horizon
    Rejected,
}

/// Occupancy report for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyOccupancy {
    pub segments: usize,
    pub samples: usize,
    /// Samples with fold > 0
    pub covered: usize,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub ingested: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub replaced: u64,
    pub blinded: u64,
    pub reinitialized: u64,
    /// Stack: trace prefixes released past `max_length`
    pub expired: u64,
    pub emitted: u64,
}

// ============================================================================
// Buffer
// ============================================================================

#[derive(Debug, Default)]
struct KeyState {
    /// Stack: expired trace prefixes waiting to be drained
    ready: VecDeque<Segment>,
    segments: VecDeque<Segment>,
    /// Stack: samples before this time can no longer gain contributions
    settled_before: Option<f64>,
    /// Stack: samples before this time have been drained
    drained_until: Option<f64>,
}

impl KeyState {
    fn sample_rate(&self) -> Option<f64> {
        self.segments.front().map(|s| s.sample_rate)
    }

    fn held(&self) -> impl Iterator<Item = &Segment> {
        self.ready.iter().chain(self.segments.iter())
    }

    fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.segments.is_empty()
    }

    fn occupancy(&self) -> KeyOccupancy {
        KeyOccupancy {
            segments: self.ready.len() + self.segments.len(),
            samples: self.held().map(Segment::len).sum(),
            covered: self.held().map(Segment::covered).sum(),
            start_time: self.held().next().map(|s| s.start_time),
            end_time: self.held().map(Segment::end_time).reduce(f64::max),
        }
    }
}

/// Multi-key segment buffer. Exclusively owned by one stage.
#[derive(Debug)]
pub struct Buffer {
    config: BufferConfig,
    keys: BTreeMap<String, KeyState>,
    stats: BufferStats,
}

impl Buffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            keys: BTreeMap::new(),
            stats: BufferStats::default(),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Accept a new segment for its key.
    pub fn ingest(&mut self, segment: Segment) -> Result<IngestOutcome, BufferError> {
        if segment.is_empty() {
            return Err(BufferError::EmptySegment(segment.key));
        }
        if !segment.sample_rate.is_finite() || segment.sample_rate <= 0.0 {
            return Err(BufferError::InvalidSampleRate(segment.key, segment.sample_rate));
        }
        let segment = segment.normalized();
        let state = self.keys.entry(segment.key.clone()).or_default();

        if self.config.method != MergeMethod::Overwrite {
            if let Some(buffered) = state.sample_rate() {
                if (buffered - segment.sample_rate).abs() > buffered * 1e-9 {
                    return Err(BufferError::SampleRateMismatch {
                        key: segment.key,
                        buffered,
                        incoming: segment.sample_rate,
                    });
                }
            }
        }

        self.stats.ingested += 1;
        let outcome = match self.config.method {
            MergeMethod::Append => Self::ingest_append(&self.config, state, segment, &mut self.stats),
            MergeMethod::Overwrite => {
                let replaced = !state.segments.is_empty();
                state.segments.clear();
                state.segments.push_back(segment);
                if replaced {
                    self.stats.replaced += 1;
                    IngestOutcome::Replaced
                } else {
                    IngestOutcome::Inserted(1)
                }
            }
            MergeMethod::Stack => stack::ingest(&self.config, state, segment, &mut self.stats),
        };
        trace!(outcome = ?outcome, "Buffer ingest");
        Ok(outcome)
    }

    fn ingest_append(
        config: &BufferConfig,
        state: &mut KeyState,
        segment: Segment,
        stats: &mut BufferStats,
    ) -> IngestOutcome {
        let (start, end) = (segment.start_time, segment.end_time());
        let mut pieces = vec![segment];
        for existing in state
            .segments
            .iter()
            .filter(|s| s.start_time < end && s.end_time() > start)
        {
            pieces = pieces
                .into_iter()
                .flat_map(|piece| subtract(piece, existing))
                .collect();
        }
        if pieces.is_empty() {
            stats.duplicates += 1;
            return IngestOutcome::Duplicate;
        }

        let inserted = pieces.len();
        for piece in pieces {
            let idx = state
                .segments
                .partition_point(|s| s.start_time < piece.start_time);
            state.segments.insert(idx, piece);
        }

        if let Some(max) = config.max_segments() {
            while state.segments.len() > max {
                state.segments.pop_front();
                stats.evicted += 1;
            }
        }
        if let Some(span) = config.span_seconds() {
            let latest = state
                .segments
                .back()
                .map_or(f64::NEG_INFINITY, Segment::end_time);
            let horizon = latest - span;
            while state
                .segments
                .front()
                .is_some_and(|s| s.end_time() <= horizon)
            {
                state.segments.pop_front();
                stats.evicted += 1;
            }
        }
        IngestOutcome::Inserted(inserted)
    }

    /// Remove and return up to `max_items` ready segments per key, oldest first.
    pub fn drain(&mut self, max_items: usize) -> Vec<Segment> {
        let mut out = Vec::new();
        for state in self.keys.values_mut() {
            match self.config.method {
                MergeMethod::Stack => out.extend(stack::drain_settled(state, max_items)),
                MergeMethod::Append | MergeMethod::Overwrite => {
                    let n = max_items.min(state.segments.len());
                    out.extend(state.segments.drain(..n));
                }
            }
        }
        self.keys.retain(|_, s| !s.is_empty() || s.drained_until.is_some());
        self.stats.emitted += out.len() as u64;
        if !out.is_empty() {
            debug!(segments = out.len(), "Buffer drained");
        }
        out
    }

    /// Remove and return everything, settled or not.
    pub fn flush(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        for state in self.keys.values_mut() {
            let end = state.held().last().map(Segment::end_time);
            if end.is_some() {
                state.drained_until = end;
            }
            out.extend(state.ready.drain(..));
            out.extend(state.segments.drain(..));
        }
        self.stats.emitted += out.len() as u64;
        out
    }

    /// Current occupancy per key.
    pub fn peek_state(&self) -> BTreeMap<String, KeyOccupancy> {
        self.keys
            .iter()
            .map(|(k, s)| (k.clone(), s.occupancy()))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Retained segments for `key`, oldest first.
    pub fn segments(&self, key: &str) -> impl Iterator<Item = &Segment> {
        self.keys.get(key).into_iter().flat_map(|s| s.segments.iter())
    }

    /// Drop everything for `key` before `time`, splitting a straddling segment.
    pub fn discard_before(&mut self, key: &str, time: f64) {
        let Some(state) = self.keys.get_mut(key) else {
            return;
        };
        state.ready.retain(|s| s.end_time() > time);
        while state.segments.front().is_some_and(|s| s.end_time() <= time) {
            state.segments.pop_front();
        }
        if let Some(front) = state.segments.front_mut() {
            let cut = front.offset_of(time);
            if cut > 0 {
                front.split_front(cut as usize);
            }
        }
        if state.is_empty() {
            self.keys.remove(key);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.values().all(KeyState::is_empty)
    }
}

/// Pieces of `piece` not covered by `existing`.
fn subtract(piece: Segment, existing: &Segment) -> Vec<Segment> {
    let len = piece.len() as i64;
    let from = piece.offset_of(existing.start_time).clamp(0, len) as usize;
    let to = piece.offset_of(existing.end_time()).clamp(0, len) as usize;
    if from >= to {
        return vec![piece];
    }
    let mut out = Vec::with_capacity(2);
    if from > 0 {
        out.push(piece.slice(0, from));
    }
    if to < piece.len() {
        out.push(piece.slice(to, piece.len()));
    }
    out
}
