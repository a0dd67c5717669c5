//! STA/LTA characteristic-function model
//!
//! Stand-in for a neural picker. The short-term / long-term average energy
//! ratio `r` is mapped to a pseudo-probability `1 - exp(-max(0, r - 1) / scale)`:
//! quiet noise sits at 0, impulsive onsets approach 1.

use super::{InferenceError, InferenceModel};
use crate::types::{component_key, Segment, Window};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaLtaConfig {
    pub sta_seconds: f64,
    pub lta_seconds: f64,
    /// Ratio excess that maps to probability `1 - 1/e`
    pub scale: f64,
}

impl Default for StaLtaConfig {
    fn default() -> Self {
        Self {
            sta_seconds: 0.5,
            lta_seconds: 10.0,
            scale: 3.0,
        }
    }
}

impl StaLtaConfig {
    pub fn validate(&self, section: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, value) in [
            ("sta_seconds", self.sta_seconds),
            ("lta_seconds", self.lta_seconds),
            ("scale", self.scale),
        ] {
            if !value.is_finite() || value <= 0.0 {
                errors.push(format!("{section}.{name} must be > 0"));
            }
        }
        if self.sta_seconds >= self.lta_seconds {
            errors.push(format!("{section}.sta_seconds must be < lta_seconds"));
        }
        errors
    }
}

/// P from the reference trace, S from the summed horizontal energy.
#[derive(Debug, Clone)]
pub struct StaLtaModel {
    config: StaLtaConfig,
}

impl StaLtaModel {
    const LABELS: [char; 2] = ['P', 'S'];

    pub fn new(config: StaLtaConfig) -> Self {
        Self { config }
    }

    fn probability(&self, energy: &[f64], sample_rate: f64) -> Vec<f64> {
        let sta_n = ((self.config.sta_seconds * sample_rate).round() as usize).max(1);
        let lta_n = ((self.config.lta_seconds * sample_rate).round() as usize).max(sta_n + 1);

        let mut prefix = Vec::with_capacity(energy.len() + 1);
        prefix.push(0.0);
        for e in energy {
            prefix.push(prefix[prefix.len() - 1] + e);
        }

        (0..energy.len())
            .map(|i| {
                if i + 1 < lta_n {
                    return 0.0;
                }
                let sta = (prefix[i + 1] - prefix[i + 1 - sta_n]) / sta_n as f64;
                let lta = (prefix[i + 1] - prefix[i + 1 - lta_n]) / lta_n as f64;
                if lta <= f64::EPSILON {
                    return 0.0;
                }
                let excess = (sta / lta - 1.0).max(0.0);
                1.0 - (-excess / self.config.scale).exp()
            })
            .collect()
    }
}

impl InferenceModel for StaLtaModel {
    fn name(&self) -> &str {
        "sta_lta"
    }

    fn labels(&self) -> &[char] {
        &Self::LABELS
    }

    fn predict(&self, window: &Window) -> Result<Vec<Segment>, InferenceError> {
        let reference = window
            .reference()
            .ok_or_else(|| InferenceError::MissingReference(window.group.clone()))?;

        let vertical: Vec<f64> = reference.samples.iter().map(|x| x * x).collect();
        let horizontals: Vec<_> = window
            .traces
            .iter()
            .filter(|(c, _)| **c != window.reference_component)
            .map(|(_, t)| t)
            .collect();
        let horizontal: Vec<f64> = if horizontals.is_empty() {
            vertical.clone()
        } else {
            (0..window.npts)
                .map(|i| horizontals.iter().map(|t| t.samples[i] * t.samples[i]).sum())
                .collect()
        };

        Ok([(Self::LABELS[0], vertical), (Self::LABELS[1], horizontal)]
            .into_iter()
            .map(|(label, energy)| {
                Segment::new(
                    component_key(&window.group, label),
                    window.t0,
                    window.sample_rate,
                    self.probability(&energy, window.sample_rate),
                )
            })
            .collect())
    }
}
