//! Stage capability interface and the concrete stages
//!
//! Every stage takes its input batch by value and returns its output by
//! value. `Packet::Message` items pass through every stage untouched; any
//! other packet kind a stage does not consume is a [`StageError`]. A packet
//! the stage consumes but cannot use is counted and skipped.

use crate::buffer::Buffer;
use crate::inference::{InferenceEngine, InferenceError};
use crate::sink::PickFormatter;
use crate::trigger::TriggerDetector;
use crate::types::{Packet, Window};
use crate::windower::{AdvanceOutcome, Windower};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} cannot consume {kind} packets")]
    UnexpectedPacket { stage: String, kind: &'static str },

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Common step contract the sequencer drives.
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Consume one batch and return whatever is ready downstream.
    fn step(&mut self, input: Vec<Packet>) -> Result<Vec<Packet>, StageError>;

    /// Whether a step with no input would still produce output.
    fn has_pending(&self) -> bool {
        false
    }

    /// Emit end-of-stream state.
    fn flush(&mut self) -> Result<Vec<Packet>, StageError> {
        Ok(Vec::new())
    }

    /// Stage-specific diagnostic counters.
    fn counters(&self) -> Vec<(&'static str, u64)> {
        Vec::new()
    }
}

fn unexpected(stage: &str, packet: &Packet) -> StageError {
    StageError::UnexpectedPacket {
        stage: stage.to_string(),
        kind: packet.kind(),
    }
}

// ============================================================================
// Windowing
// ============================================================================

pub struct WindowStage {
    windower: Windower,
    /// Windows handed downstream per step
    emit_limit: usize,
    backpressured: u64,
    ingest_errors: u64,
}

impl WindowStage {
    pub fn new(windower: Windower, emit_limit: usize) -> Self {
        Self {
            windower,
            emit_limit: emit_limit.max(1),
            backpressured: 0,
            ingest_errors: 0,
        }
    }

    pub fn windower(&self) -> &Windower {
        &self.windower
    }

    fn emit(windows: Vec<Window>, out: &mut Vec<Packet>) {
        out.extend(windows.into_iter().map(Packet::Window));
    }
}

impl Stage for WindowStage {
    fn name(&self) -> &str {
        "window"
    }

    fn step(&mut self, input: Vec<Packet>) -> Result<Vec<Packet>, StageError> {
        let mut out = Vec::new();
        for packet in input {
            match packet {
                Packet::Segment(segment) => {
                    let key = segment.key.clone();
                    if let Err(e) = self.windower.ingest(segment) {
                        warn!(key = %key, error = %e, "Segment rejected by windower");
                        self.ingest_errors += 1;
                    }
                }
                Packet::Message(_) => out.push(packet),
                other => return Err(unexpected(self.name(), &other)),
            }
        }
        if self.windower.advance() == AdvanceOutcome::Backpressured {
            self.backpressured += 1;
        }
        Self::emit(self.windower.take_windows(self.emit_limit), &mut out);
        Ok(out)
    }

    fn has_pending(&self) -> bool {
        self.windower.queued() > 0
    }

    fn flush(&mut self) -> Result<Vec<Packet>, StageError> {
        let mut out = Vec::new();
        Self::emit(self.windower.flush(), &mut out);
        Ok(out)
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        let stats = self.windower.stats();
        vec![
            ("segments_staged", stats.segments_staged),
            ("segments_ignored", stats.segments_ignored),
            ("windows_cut", stats.windows_cut),
            ("incomplete_discards", stats.incomplete_discards),
            ("traces_dropped", stats.traces_dropped),
            ("backpressured", self.backpressured),
            ("ingest_errors", self.ingest_errors),
            ("queued", self.windower.queued() as u64),
        ]
    }
}

// ============================================================================
// Inference
// ============================================================================

pub struct InferenceStage {
    engine: InferenceEngine,
    min_batch: usize,
    max_batch: usize,
    pending: VecDeque<Window>,
    batches: u64,
    windows: u64,
}

impl InferenceStage {
    pub fn new(engine: InferenceEngine, min_batch: usize, max_batch: usize) -> Self {
        let min_batch = min_batch.max(1);
        Self {
            engine,
            min_batch,
            max_batch: max_batch.max(min_batch),
            pending: VecDeque::new(),
            batches: 0,
            windows: 0,
        }
    }

    fn run_batches(&mut self, min_batch: usize, out: &mut Vec<Packet>) -> Result<(), StageError> {
        while !self.pending.is_empty() && self.pending.len() >= min_batch {
            let n = self.pending.len().min(self.max_batch);
            let batch: Vec<Window> = self.pending.drain(..n).collect();
            let segments = self.engine.predict_batch(&batch)?;
            self.batches += 1;
            self.windows += batch.len() as u64;
            out.extend(segments.into_iter().map(Packet::Segment));
        }
        Ok(())
    }
}

impl Stage for InferenceStage {
    fn name(&self) -> &str {
        "inference"
    }

    fn step(&mut self, input: Vec<Packet>) -> Result<Vec<Packet>, StageError> {
        let mut out = Vec::new();
        for packet in input {
            match packet {
                Packet::Window(window) => self.pending.push_back(window),
                Packet::Message(_) => out.push(packet),
                other => return Err(unexpected(self.name(), &other)),
            }
        }
        self.run_batches(self.min_batch, &mut out)?;
        Ok(out)
    }

    fn has_pending(&self) -> bool {
        self.pending.len() >= self.min_batch
    }

    fn flush(&mut self) -> Result<Vec<Packet>, StageError> {
        let mut out = Vec::new();
        self.run_batches(1, &mut out)?;
        Ok(out)
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("batches", self.batches),
            ("windows", self.windows),
            ("pending", self.pending.len() as u64),
        ]
    }
}

// ============================================================================
// Buffering
// ============================================================================

pub struct BufferStage {
    name: String,
    buffer: Buffer,
    ingest_errors: u64,
}

impl BufferStage {
    pub fn new(name: impl Into<String>, buffer: Buffer) -> Self {
        Self {
            name: name.into(),
            buffer,
            ingest_errors: 0,
        }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl Stage for BufferStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, input: Vec<Packet>) -> Result<Vec<Packet>, StageError> {
        let mut out = Vec::new();
        for packet in input {
            match packet {
                Packet::Segment(segment) => {
                    let key = segment.key.clone();
                    if let Err(e) = self.buffer.ingest(segment) {
                        warn!(stage = %self.name, key = %key, error = %e, "Segment rejected by buffer");
                        self.ingest_errors += 1;
                    }
                }
                Packet::Message(_) => out.push(packet),
                other => return Err(unexpected(&self.name, &other)),
            }
        }
        out.extend(self.buffer.drain(usize::MAX).into_iter().map(Packet::Segment));
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Packet>, StageError> {
        Ok(self.buffer.flush().into_iter().map(Packet::Segment).collect())
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        let stats = self.buffer.stats();
        vec![
            ("ingested", stats.ingested),
            ("evicted", stats.evicted),
            ("rejected", stats.rejected),
            ("duplicates", stats.duplicates),
            ("replaced", stats.replaced),
            ("blinded", stats.blinded),
            ("reinitialized", stats.reinitialized),
            ("expired", stats.expired),
            ("emitted", stats.emitted),
            ("ingest_errors", self.ingest_errors),
        ]
    }
}

// ============================================================================
// Triggering
// ============================================================================

pub struct TriggerStage {
    detector: TriggerDetector,
}

impl TriggerStage {
    pub fn new(detector: TriggerDetector) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &TriggerDetector {
        &self.detector
    }
}

impl Stage for TriggerStage {
    fn name(&self) -> &str {
        "trigger"
    }

    fn step(&mut self, input: Vec<Packet>) -> Result<Vec<Packet>, StageError> {
        let mut out = Vec::new();
        for packet in input {
            match packet {
                Packet::Segment(segment) => {
                    out.extend(self.detector.process(&segment).into_iter().map(Packet::Trigger));
                }
                Packet::Message(_) => out.push(packet),
                other => return Err(unexpected(self.name(), &other)),
            }
        }
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Packet>, StageError> {
        Ok(self.detector.flush().into_iter().map(Packet::Trigger).collect())
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        let stats = self.detector.stats();
        vec![
            ("samples_seen", stats.samples_seen),
            ("runs_opened", stats.runs_opened),
            ("triggers", stats.triggers),
            ("fold_rejected", stats.fold_rejected),
            ("segments_ignored", stats.segments_ignored),
        ]
    }
}

// ============================================================================
// Pick formatting
// ============================================================================

pub struct PickStage {
    formatter: PickFormatter,
    formatted: u64,
    format_errors: u64,
}

impl PickStage {
    pub fn new(formatter: PickFormatter) -> Self {
        Self {
            formatter,
            formatted: 0,
            format_errors: 0,
        }
    }
}

impl Stage for PickStage {
    fn name(&self) -> &str {
        "picks"
    }

    fn step(&mut self, input: Vec<Packet>) -> Result<Vec<Packet>, StageError> {
        let mut out = Vec::with_capacity(input.len());
        for packet in input {
            match packet {
                Packet::Trigger(trigger) => match self.formatter.format(&trigger) {
                    Ok(line) => {
                        debug!(key = %trigger.group_key, "Pick formatted");
                        self.formatted += 1;
                        out.push(Packet::Message(line));
                    }
                    Err(e) => {
                        warn!(key = %trigger.group_key, error = %e, "Trigger could not be formatted, skipping");
                        self.format_errors += 1;
                    }
                },
                Packet::Message(_) => out.push(packet),
                other => return Err(unexpected(self.name(), &other)),
            }
        }
        Ok(out)
    }

    fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![("formatted", self.formatted), ("format_errors", self.format_errors)]
    }
}

// ============================================================================
// Pass-through
// ============================================================================

/// Forwards its input unchanged.
pub struct PassThrough {
    name: String,
}

impl PassThrough {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Stage for PassThrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, input: Vec<Packet>) -> Result<Vec<Packet>, StageError> {
        Ok(input)
    }
}
