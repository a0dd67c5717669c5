//! PULSE-RT: real-time windowed detection for streaming waveform data
//!
//! Continuous multichannel segments are cut into reference-aligned windows,
//! run through a detection model, stacked back into continuous probability
//! traces, and scanned for triggers that become pick messages.
//!
//! ## Architecture
//!
//! - **Buffer**: per-key segment store (append, overwrite, fold-weighted stack)
//! - **Windower**: fixed-length, fixed-step windows anchored to a reference component
//! - **Inference**: batched model calls on a dedicated rayon pool
//! - **Trigger**: fold-validated threshold state machine per prediction key
//! - **Sequencer**: ordered stages with bounded queues, driven one pulse at a time

pub mod buffer;
pub mod config;
pub mod inference;
pub mod pipeline;
pub mod sink;
pub mod synthetic;
pub mod trigger;
pub mod types;
pub mod windower;

// Re-export configuration
pub use config::{ConfigError, PulseConfig};

// Re-export data model
pub use types::{Packet, PickMethod, Segment, Trigger, Window, WindowTrace};

// Re-export stage building blocks
pub use buffer::{Buffer, BufferConfig, BufferError, MergeMethod, StackFunction};
pub use inference::{InferenceEngine, InferenceModel, StaLtaModel};
pub use pipeline::{build_sequencer, ProcessingLoop, Sequencer, Stage, StageError};
pub use sink::{MemorySink, PickFormatter, PickSink, StdoutSink};
pub use trigger::{TriggerConfig, TriggerDetector};
pub use windower::{Windower, WindowerConfig};
