//! Reference-aligned analysis windows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One key's samples inside a window frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowTrace {
    /// Source channel key
    pub key: String,
    /// Exactly `npts` samples; gaps hold the windower's fill value
    pub samples: Vec<f64>,
    /// Fraction of `npts` covered by real samples, in `[0, 1]`
    pub completeness: f64,
}

/// A batch of traces from one instrument group, all aligned to
/// `[t0, t0 + npts / sample_rate)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// Instrument group (channel key without its component character)
    pub group: String,
    pub t0: f64,
    pub sample_rate: f64,
    pub npts: usize,
    pub overlap: usize,
    /// Canonical component of the reference trace
    pub reference_component: char,
    /// Traces keyed by canonical component; always contains the reference
    pub traces: BTreeMap<char, WindowTrace>,
}

impl Window {
    pub fn end_time(&self) -> f64 {
        self.t0 + self.npts as f64 / self.sample_rate
    }

    /// Time between consecutive window starts.
    pub fn step_seconds(&self) -> f64 {
        self.npts.saturating_sub(self.overlap) as f64 / self.sample_rate
    }

    pub fn reference(&self) -> Option<&WindowTrace> {
        self.traces.get(&self.reference_component)
    }

    pub fn completeness(&self, component: char) -> Option<f64> {
        self.traces.get(&component).map(|t| t.completeness)
    }
}
