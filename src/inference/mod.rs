//! Inference step: windows in, per-label probability segments out
//!
//! The model itself is an external collaborator behind [`InferenceModel`].
//! [`InferenceEngine`] runs a batch of windows through the model inside a
//! dedicated rayon pool sized by `worker_threads`; the call returns before the
//! pulse continues.

mod sta_lta;

pub use sta_lta::{StaLtaConfig, StaLtaModel};

use crate::types::{component_key, Segment, Window};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Failed to build inference thread pool: {0}")]
    Pool(String),

    #[error("Window for {0} has no reference trace")]
    MissingReference(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Model output for window {group} @ {t0} is keyed {found:?}, expected {expected:?}")]
    LabelMismatch {
        group: String,
        t0: f64,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

/// Pure function from one window to one probability segment per label.
///
/// Output segments must start at the window's `t0`, share its sample rate,
/// and be keyed `group + label`.
pub trait InferenceModel: Send + Sync {
    fn name(&self) -> &str;

    /// Phase labels produced for every window, in output order.
    fn labels(&self) -> &[char];

    fn predict(&self, window: &Window) -> Result<Vec<Segment>, InferenceError>;
}

/// Which built-in model to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    StaLta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub model: ModelKind,
    /// Windows accumulated before a batch is run (a partial batch runs on flush)
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub worker_threads: usize,
    pub sta_lta: StaLtaConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::StaLta,
            min_batch_size: 1,
            max_batch_size: 32,
            worker_threads: 2,
            sta_lta: StaLtaConfig::default(),
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self, section: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.min_batch_size == 0 {
            errors.push(format!("{section}.min_batch_size must be >= 1"));
        }
        if self.max_batch_size < self.min_batch_size {
            errors.push(format!(
                "{section}.max_batch_size ({}) must be >= min_batch_size ({})",
                self.max_batch_size, self.min_batch_size
            ));
        }
        if self.worker_threads == 0 {
            errors.push(format!("{section}.worker_threads must be >= 1"));
        }
        errors.extend(self.sta_lta.validate(&format!("{section}.sta_lta")));
        errors
    }

    pub fn build_model(&self) -> Box<dyn InferenceModel> {
        match self.model {
            ModelKind::StaLta => Box::new(StaLtaModel::new(self.sta_lta.clone())),
        }
    }
}

/// Model plus the worker pool it runs on.
pub struct InferenceEngine {
    model: Box<dyn InferenceModel>,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("model", &self.model.name())
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl InferenceEngine {
    pub fn new(model: Box<dyn InferenceModel>, worker_threads: usize) -> Result<Self, InferenceError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads.max(1))
            .thread_name(|i| format!("inference-{i}"))
            .build()
            .map_err(|e| InferenceError::Pool(e.to_string()))?;
        Ok(Self { model, pool })
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Run every window of the batch; any window error fails the whole batch.
    pub fn predict_batch(&self, windows: &[Window]) -> Result<Vec<Segment>, InferenceError> {
        let model = self.model.as_ref();
        let per_window: Vec<Vec<Segment>> = self.pool.install(|| {
            windows
                .par_iter()
                .map(|window| model.predict(window).and_then(|out| check_labels(model, window, out)))
                .collect::<Result<_, _>>()
        })?;
        let out: Vec<Segment> = per_window.into_iter().flatten().collect();
        debug!(
            model = model.name(),
            windows = windows.len(),
            segments = out.len(),
            "Inference batch complete"
        );
        Ok(out)
    }
}

/// Output must hold one segment per model label, in label order.
fn check_labels(
    model: &dyn InferenceModel,
    window: &Window,
    out: Vec<Segment>,
) -> Result<Vec<Segment>, InferenceError> {
    let expected: Vec<String> = model
        .labels()
        .iter()
        .map(|&label| component_key(&window.group, label))
        .collect();
    if out.len() == expected.len() && out.iter().zip(&expected).all(|(s, k)| s.key == *k) {
        return Ok(out);
    }
    Err(InferenceError::LabelMismatch {
        group: window.group.clone(),
        t0: window.t0,
        expected,
        found: out.into_iter().map(|s| s.key).collect(),
    })
}
