//! Tick-driven stage sequencer
//!
//! Holds the ordered stage list and the bounded queues between them. One
//! [`Sequencer::pulse`] runs every stage once, in order, on at most
//! `max_pulse_size` items of its inbox. Exactly one stage step runs at a time
//! and packets only ever move forward.

use super::stage::Stage;
use crate::types::Packet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};

/// What to do when a stage's output queue reaches `max_output_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued items beyond the cap
    #[default]
    DropOldest,
    /// Skip the stage's step until downstream drains the queue
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Input items consumed per pulse
    pub max_pulse_size: usize,
    /// Items the stage's output queue may hold
    pub max_output_size: usize,
    pub overflow: OverflowPolicy,
    /// Pulses between counter reports; 0 disables reporting
    pub report_period: u64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_pulse_size: 10,
            max_output_size: 100,
            overflow: OverflowPolicy::DropOldest,
            report_period: 0,
        }
    }
}

/// How a stage's most recent pulse ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseOutcome {
    /// Nothing to consume and nothing pending
    #[default]
    Idle,
    Stepped,
    Held,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub steps: u64,
    pub consumed: u64,
    pub emitted: u64,
    /// Outputs discarded by the drop-oldest policy
    pub backpressure_drops: u64,
    /// Pulses skipped by the hold policy
    pub held: u64,
    pub failures: u64,
    /// Total time spent in `step`
    pub runtime_us: u64,

    // Most recent pulse
    pub last_outcome: PulseOutcome,
    pub last_runtime_us: u64,
    pub last_consumed: usize,
    pub last_emitted: usize,
    pub inbox_before: usize,
    pub inbox_after: usize,
}

/// One stage plus its inbox and flow limits.
pub struct StageSlot {
    stage: Box<dyn Stage>,
    config: SlotConfig,
    inbox: VecDeque<Packet>,
    stats: SlotStats,
}

impl StageSlot {
    pub fn new(stage: Box<dyn Stage>, config: SlotConfig) -> Self {
        Self {
            stage,
            config,
            inbox: VecDeque::new(),
            stats: SlotStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn config(&self) -> &SlotConfig {
        &self.config
    }

    pub fn queued(&self) -> usize {
        self.inbox.len()
    }

    fn run_step(&mut self, batch: Vec<Packet>) -> Vec<Packet> {
        let n = batch.len();
        self.stats.steps += 1;
        self.stats.consumed += n as u64;
        self.stats.last_consumed = n;
        let started = Instant::now();
        let result = self.stage.step(batch);
        let elapsed = started.elapsed().as_micros() as u64;
        self.stats.runtime_us += elapsed;
        self.stats.last_runtime_us = elapsed;
        match result {
            Ok(out) => {
                self.stats.emitted += out.len() as u64;
                self.stats.last_emitted = out.len();
                self.stats.last_outcome = PulseOutcome::Stepped;
                out
            }
            Err(e) => {
                warn!(stage = self.stage.name(), items = n, error = %e, "Stage step failed, dropping batch");
                self.stats.failures += 1;
                self.stats.last_emitted = 0;
                self.stats.last_outcome = PulseOutcome::Failed;
                Vec::new()
            }
        }
    }

    /// Record a pulse in which the stage did not step.
    fn skip(&mut self, outcome: PulseOutcome) {
        self.stats.last_outcome = outcome;
        self.stats.last_runtime_us = 0;
        self.stats.last_consumed = 0;
        self.stats.last_emitted = 0;
    }

    fn take_batch(&mut self) -> Vec<Packet> {
        let n = self.config.max_pulse_size.min(self.inbox.len());
        self.inbox.drain(..n).collect()
    }

    fn report(&self, pulse: u64) {
        let counters: BTreeMap<&str, u64> = self.stage.counters().into_iter().collect();
        info!(
            stage = self.stage.name(),
            pulse = pulse,
            consumed = self.stats.consumed,
            emitted = self.stats.emitted,
            dropped = self.stats.backpressure_drops,
            held = self.stats.held,
            failures = self.stats.failures,
            runtime_us = self.stats.runtime_us,
            last_outcome = ?self.stats.last_outcome,
            last_runtime_us = self.stats.last_runtime_us,
            inbox_before = self.stats.inbox_before,
            inbox_after = self.stats.inbox_after,
            queued = self.inbox.len(),
            counters = ?counters,
            "Stage report"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub name: String,
    pub queued: usize,
    #[serde(flatten)]
    pub slot: SlotStats,
    pub counters: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SequenceStats {
    pub pulses: u64,
    pub stages: Vec<StageReport>,
}

/// Ordered stage list driven one pulse at a time.
#[derive(Default)]
pub struct Sequencer {
    slots: Vec<StageSlot>,
    pulses: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stage(&mut self, stage: Box<dyn Stage>, config: SlotConfig) {
        debug!(stage = stage.name(), ?config, "Stage added");
        self.slots.push(StageSlot::new(stage, config));
    }

    pub fn with_stage(mut self, stage: Box<dyn Stage>, config: SlotConfig) -> Self {
        self.push_stage(stage, config);
        self
    }

    pub fn slots(&self) -> &[StageSlot] {
        &self.slots
    }

    pub fn pulses(&self) -> u64 {
        self.pulses
    }

    /// Items waiting in any inbox.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(StageSlot::queued).sum()
    }

    /// No queued input and no stage holding output for a later step.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && !self.slots.iter().any(|slot| slot.stage.has_pending())
    }

    /// Run one tick. `input` joins the first stage's inbox; the last
    /// stage's output is returned.
    pub fn pulse(&mut self, input: Vec<Packet>) -> Vec<Packet> {
        self.pulses += 1;
        let mut output = Vec::new();
        let Some(first) = self.slots.first_mut() else {
            return input;
        };
        first.inbox.extend(input);

        for i in 0..self.slots.len() {
            let config = self.slots[i].config;
            let inbox_before = self.slots[i].queued();
            self.slots[i].stats.inbox_before = inbox_before;
            self.slots[i].stats.inbox_after = inbox_before;
            let downstream_len = self.slots.get(i + 1).map_or(0, StageSlot::queued);
            if config.overflow == OverflowPolicy::Hold && downstream_len >= config.max_output_size {
                self.slots[i].stats.held += 1;
                self.slots[i].skip(PulseOutcome::Held);
                continue;
            }

            let batch = self.slots[i].take_batch();
            if batch.is_empty() && !self.slots[i].stage.has_pending() {
                self.slots[i].skip(PulseOutcome::Idle);
                continue;
            }
            self.slots[i].stats.inbox_after = self.slots[i].queued();
            let produced = self.slots[i].run_step(batch);

            if i + 1 == self.slots.len() {
                output.extend(produced);
                self.enforce_cap(i, &mut output);
                continue;
            }
            let queue = &mut self.slots[i + 1].inbox;
            queue.extend(produced);
            let dropped = drop_oldest(queue, &config);
            self.slots[i].stats.backpressure_drops += dropped;
            if dropped > 0 {
                debug!(stage = self.slots[i].name(), dropped = dropped, "Output queue overflow");
            }
        }

        let pulse = self.pulses;
        for slot in &self.slots {
            if slot.config.report_period > 0 && pulse % slot.config.report_period == 0 {
                slot.report(pulse);
            }
        }
        output
    }

    fn enforce_cap(&mut self, i: usize, output: &mut Vec<Packet>) {
        let config = self.slots[i].config;
        if config.overflow == OverflowPolicy::DropOldest && output.len() > config.max_output_size {
            let excess = output.len() - config.max_output_size;
            output.drain(..excess);
            self.slots[i].stats.backpressure_drops += excess as u64;
        }
    }

    /// Drain every inbox and every stage's end-of-stream state, in order.
    ///
    /// Queue caps do not apply; nothing is dropped.
    pub fn flush(&mut self) -> Vec<Packet> {
        let mut carry: VecDeque<Packet> = VecDeque::new();
        for slot in &mut self.slots {
            slot.inbox.extend(carry.drain(..));
            let mut produced = Vec::new();
            if !slot.inbox.is_empty() {
                let batch: Vec<Packet> = slot.inbox.drain(..).collect();
                produced.extend(slot.run_step(batch));
            }
            match slot.stage.flush() {
                Ok(out) => {
                    slot.stats.emitted += out.len() as u64;
                    produced.extend(out);
                }
                Err(e) => {
                    warn!(stage = slot.stage.name(), error = %e, "Stage flush failed");
                    slot.stats.failures += 1;
                }
            }
            carry.extend(produced);
        }
        carry.into_iter().collect()
    }

    pub fn stats(&self) -> SequenceStats {
        SequenceStats {
            pulses: self.pulses,
            stages: self
                .slots
                .iter()
                .map(|slot| StageReport {
                    name: slot.name().to_string(),
                    queued: slot.queued(),
                    slot: slot.stats.clone(),
                    counters: slot
                        .stage
                        .counters()
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Trim a queue to the cap under the drop-oldest policy; returns items dropped.
fn drop_oldest(queue: &mut VecDeque<Packet>, config: &SlotConfig) -> u64 {
    if config.overflow != OverflowPolicy::DropOldest || queue.len() <= config.max_output_size {
        return 0;
    }
    let excess = queue.len() - config.max_output_size;
    queue.drain(..excess);
    excess as u64
}
