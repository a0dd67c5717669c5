//! Processing Pipeline Module
//!
//! ## Stage Order
//!
//! ```text
//! source ──► window ──► inference ──► stack ──► trigger ──► picks ──► sink
//!  Segment    Window     Segment(P,S)  Segment    Trigger    Message
//! ```
//!
//! The [`Sequencer`] steps the stages one after another on every pulse; the
//! [`ProcessingLoop`] fires pulses on a timer and moves data between the
//! source task, the sequencer, and the sink.

mod sequencer;
pub mod processing_loop;
pub mod source;
pub mod stage;

pub use processing_loop::{LoopConfig, ProcessingLoop, RunSummary};
pub use sequencer::{
    OverflowPolicy, PulseOutcome, SequenceStats, Sequencer, SlotConfig, SlotStats, StageReport, StageSlot,
};
pub use stage::{BufferStage, InferenceStage, PassThrough, PickStage, Stage, StageError, TriggerStage, WindowStage};

use crate::buffer::Buffer;
use crate::config::PulseConfig;
use crate::inference::InferenceEngine;
use crate::sink::PickFormatter;
use crate::trigger::TriggerDetector;
use crate::windower::Windower;
use tracing::info;

/// Assemble the full picking sequence from a validated config.
pub fn build_sequencer(config: &PulseConfig) -> Result<Sequencer, StageError> {
    let seq = &config.sequence;
    let stages = &seq.stages;

    let window_slot = seq.slot(&stages.window);
    let window = WindowStage::new(Windower::new(config.window.clone()), window_slot.max_pulse_size);

    let engine = InferenceEngine::new(config.inference.build_model(), config.inference.worker_threads)?;
    info!(
        model = engine.model_name(),
        threads = config.inference.worker_threads,
        "Inference engine ready"
    );
    let inference = InferenceStage::new(
        engine,
        config.inference.min_batch_size,
        config.inference.max_batch_size,
    );

    let stack = BufferStage::new("stack", Buffer::new(config.stack.clone()));
    let trigger = TriggerStage::new(TriggerDetector::new(config.trigger.clone()));
    let picks = PickStage::new(PickFormatter::new(config.station.clone(), config.picks.clone()));

    Ok(Sequencer::new()
        .with_stage(Box::new(window), window_slot)
        .with_stage(Box::new(inference), seq.slot(&stages.inference))
        .with_stage(Box::new(stack), seq.slot(&stages.stack))
        .with_stage(Box::new(trigger), seq.slot(&stages.trigger))
        .with_stage(Box::new(picks), seq.slot(&stages.picks)))
}
