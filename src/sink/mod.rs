//! Pick message formatting and delivery
//!
//! Triggers are rendered as fixed-width PICK2K-style lines:
//!
//! ```text
//!  10123  1    0 GNW  UWBHZ ?0P 20240501120000.25       0       0       0
//! ```
//!
//! Fields: message type, module id, installation id, sequence number, site,
//! network, component, polarity, quality, phase, UTC pick time and three
//! (unused) peak amplitudes.

use crate::types::{split_component, Trigger};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Stream key {0} is not NET.STA.LOC.CHA")]
    InvalidKey(String),

    #[error("Pick time {0} is out of range")]
    InvalidTime(f64),

    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Installation identity stamped on every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub installation_id: u8,
    pub module_id: u8,
    pub message_type: u8,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            installation_id: 1,
            module_id: 123,
            message_type: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickConfig {
    /// Descending lower bounds on peak probability for quality 0, 1, 2, 3;
    /// anything below the last bound is quality 4
    pub quality_bins: Vec<f64>,
    /// Component code reported in place of the phase label
    pub report_component: char,
}

impl Default for PickConfig {
    fn default() -> Self {
        Self {
            quality_bins: vec![0.9, 0.7, 0.5, 0.3],
            report_component: 'Z',
        }
    }
}

impl PickConfig {
    pub fn validate(&self, section: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.quality_bins.len() > 4 {
            errors.push(format!("{section}.quality_bins holds at most 4 bounds (quality 0-4)"));
        }
        if self.quality_bins.windows(2).any(|w| w[0] <= w[1]) {
            errors.push(format!("{section}.quality_bins must be strictly descending"));
        }
        if self.quality_bins.iter().any(|b| !(0.0..=1.0).contains(b)) {
            errors.push(format!("{section}.quality_bins must lie within [0, 1]"));
        }
        errors
    }

    /// Quality grade for a peak probability (0 best, 4 worst).
    pub fn quality(&self, peak_value: f64) -> u8 {
        self.quality_bins
            .iter()
            .position(|bound| peak_value >= *bound)
            .map_or(4, |i| i as u8)
    }
}

/// Renders triggers into PICK2K-style lines with a wrapping sequence number.
#[derive(Debug)]
pub struct PickFormatter {
    station: StationConfig,
    picks: PickConfig,
    sequence: u16,
}

impl PickFormatter {
    const MAX_SEQUENCE: u16 = 10_000;

    pub fn new(station: StationConfig, picks: PickConfig) -> Self {
        Self {
            station,
            picks,
            sequence: 0,
        }
    }

    pub fn format(&mut self, trigger: &Trigger) -> Result<String, SinkError> {
        let (instrument, label) = split_component(&trigger.group_key);
        let parts: Vec<&str> = instrument.split('.').collect();
        let [net, sta, _loc, cha] = parts.as_slice() else {
            return Err(SinkError::InvalidKey(trigger.group_key.clone()));
        };
        let label = label.ok_or_else(|| SinkError::InvalidKey(trigger.group_key.clone()))?;

        let whole = trigger.pick_time.floor();
        let nanos = ((trigger.pick_time - whole) * 1e9).round().min(999_999_999.0) as u32;
        let time = DateTime::from_timestamp(whole as i64, nanos)
            .ok_or(SinkError::InvalidTime(trigger.pick_time))?;
        let centis = time.timestamp_subsec_millis() / 10;

        let line = format!(
            "{:3}{:3}{:3} {:4} {:<5}{:<2}{:<3} ?{}{:<2}{}.{:02}{:8}{:8}{:8}",
            self.station.message_type,
            self.station.module_id,
            self.station.installation_id,
            self.sequence,
            sta,
            net,
            format!("{cha}{}", self.picks.report_component),
            self.picks.quality(trigger.peak_value),
            label,
            time.format("%Y%m%d%H%M%S"),
            centis,
            0,
            0,
            0,
        );
        self.sequence = (self.sequence + 1) % Self::MAX_SEQUENCE;
        Ok(line)
    }
}

/// Destination for formatted pick messages.
pub trait PickSink: Send {
    fn send(&mut self, message: &str) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes one message per line to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl PickSink for StdoutSink {
    fn send(&mut self, message: &str) -> Result<(), SinkError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{message}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        std::io::stdout().lock().flush()?;
        Ok(())
    }
}

/// Collects messages in memory; clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl PickSink for MemorySink {
    fn send(&mut self, message: &str) -> Result<(), SinkError> {
        let mut guard = self
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(message.to_string());
        Ok(())
    }
}
