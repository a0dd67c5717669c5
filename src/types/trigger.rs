//! Threshold-crossing detections.

use serde::{Deserialize, Serialize};

/// Which sample of an above-threshold run represents the pick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickMethod {
    /// Fold-validated maximum of the run
    #[default]
    Max,
    /// First sample at or above the trigger level
    Onset,
    /// Probability-weighted mean time of the run
    Centroid,
}

impl std::fmt::Display for PickMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PickMethod::Max => write!(f, "max"),
            PickMethod::Onset => write!(f, "onset"),
            PickMethod::Centroid => write!(f, "centroid"),
        }
    }
}

/// A finalized detection ready for message formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Stacked probability stream the run was found on
    pub group_key: String,
    /// First sample at or above the trigger level
    pub onset_time: f64,
    /// First sample back below the trigger level
    pub offset_time: f64,
    pub peak_time: f64,
    pub peak_value: f64,
    pub fold_at_peak: u32,
    /// Representative time selected by `pick_method`
    pub pick_time: f64,
    pub pick_method: PickMethod,
}

impl Trigger {
    /// Phase label carried as the last character of the stream key.
    pub fn label(&self) -> Option<char> {
        self.group_key.chars().last()
    }
}
