//! Synthetic three-component waveform generator
//!
//! Gaussian background noise with periodic local events: an impulsive P
//! arrival strongest on the vertical, followed `s_delay` seconds later by a
//! larger, lower-frequency S arrival on the horizontals. Each instrument
//! group sees every event with a small moveout so picks differ per station.
//!
//! Used by the `synthetic` binary (JSON lines on stdout) and by
//! [`SyntheticSource`](crate::pipeline::source::SyntheticSource).

use crate::types::{component_key, Segment};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use thiserror::Error;

/// Seconds an event's coda contributes after its arrival.
const CODA_SECONDS: f64 = 20.0;
/// Moveout between consecutive instrument groups (seconds).
const GROUP_MOVEOUT: f64 = 0.8;

#[derive(Debug, Error)]
pub enum SyntheticError {
    #[error("Invalid noise level {0}")]
    InvalidNoise(f64),

    #[error("Invalid generator setting: {0}")]
    InvalidSetting(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Instrument groups (`NET.STA.LOC.` plus the band/instrument code)
    pub groups: Vec<String>,
    pub sample_rate: f64,
    pub chunk_seconds: f64,
    pub start_time: f64,
    pub duration_seconds: f64,
    pub noise_std: f64,
    pub first_event: f64,
    pub event_interval: f64,
    pub event_amplitude: f64,
    pub s_delay: f64,
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            groups: vec!["UW.GNW..BH".to_string(), "UW.RATT..BH".to_string()],
            sample_rate: 100.0,
            chunk_seconds: 2.0,
            start_time: 1_700_000_000.0,
            duration_seconds: 600.0,
            noise_std: 1.0,
            first_event: 90.0,
            event_interval: 120.0,
            event_amplitude: 40.0,
            s_delay: 6.0,
            seed: None,
        }
    }
}

/// Deterministic for a fixed `seed`.
#[derive(Debug)]
pub struct WaveformGenerator {
    config: SyntheticConfig,
    rng: StdRng,
    noise: Normal<f64>,
    chunk_len: usize,
    total_len: u64,
    cursor: u64,
}

impl WaveformGenerator {
    pub fn new(config: SyntheticConfig) -> Result<Self, SyntheticError> {
        let noise = Normal::new(0.0, config.noise_std)
            .map_err(|_| SyntheticError::InvalidNoise(config.noise_std))?;
        if !positive(config.sample_rate) || !positive(config.chunk_seconds) {
            return Err(SyntheticError::InvalidSetting(
                "sample_rate and chunk_seconds must be > 0".to_string(),
            ));
        }
        if !positive(config.event_interval) {
            return Err(SyntheticError::InvalidSetting("event_interval must be > 0".to_string()));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let chunk_len = ((config.chunk_seconds * config.sample_rate).round() as usize).max(1);
        let total_len = (config.duration_seconds.max(0.0) * config.sample_rate).round() as u64;
        Ok(Self {
            config,
            rng,
            noise,
            chunk_len,
            total_len,
            cursor: 0,
        })
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// P arrival times of every event inside the generated span, for `group_index`.
    pub fn arrivals(&self, group_index: usize) -> Vec<f64> {
        let end = self.config.start_time + self.config.duration_seconds;
        let moveout = group_index as f64 * GROUP_MOVEOUT;
        (0..)
            .map(|k| self.config.start_time + self.config.first_event + k as f64 * self.config.event_interval + moveout)
            .take_while(|t| *t < end)
            .collect()
    }

    /// Next chunk: one segment per component per group, or `None` when done.
    pub fn next_chunk(&mut self) -> Option<Vec<Segment>> {
        if self.cursor >= self.total_len {
            return None;
        }
        let n = (self.total_len - self.cursor).min(self.chunk_len as u64) as usize;
        let sr = self.config.sample_rate;
        let start = self.config.start_time + self.cursor as f64 / sr;

        let mut out = Vec::with_capacity(self.config.groups.len() * 3);
        for (gi, group) in self.config.groups.iter().enumerate() {
            let arrivals = self.arrivals(gi);
            for component in ['Z', 'N', 'E'] {
                let samples = (0..n)
                    .map(|i| {
                        let t = start + i as f64 / sr;
                        self.noise.sample(&mut self.rng) + signal(&self.config, component, t, &arrivals)
                    })
                    .collect();
                out.push(Segment::new(component_key(group, component), start, sr, samples));
            }
        }
        self.cursor += n as u64;
        Some(out)
    }
}

fn positive(x: f64) -> bool {
    x.is_finite() && x > 0.0
}

fn signal(config: &SyntheticConfig, component: char, t: f64, arrivals: &[f64]) -> f64 {
    let (p_gain, s_gain) = if component == 'Z' { (1.0, 0.4) } else { (0.3, 1.5) };
    let amplitude = config.event_amplitude;
    arrivals
        .iter()
        .map(|&tp| {
            let ts = tp + config.s_delay;
            wavelet(t - tp, 5.0, 1.5) * p_gain * amplitude + wavelet(t - ts, 2.5, 3.0) * s_gain * amplitude
        })
        .sum()
}

/// Decaying sinusoid starting at `dt = 0`.
fn wavelet(dt: f64, frequency: f64, decay: f64) -> f64 {
    if !(0.0..CODA_SECONDS).contains(&dt) {
        return 0.0;
    }
    (-dt / decay).exp() * (TAU * frequency * dt).sin()
}
