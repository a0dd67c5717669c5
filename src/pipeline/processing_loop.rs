//! Tick-driven processing loop shared across all input modes.
//!
//! The source runs in its own task and feeds a bounded channel. Every
//! `pulse_interval` the loop drains up to `max_pulse_size` segments, runs one
//! sequencer pulse, and hands finished messages to the sink. Cancellation is
//! checked between ticks only.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sequencer::{SequenceStats, Sequencer};
use super::source::{SegmentSource, SourceEvent};
use crate::sink::PickSink;
use crate::types::{Packet, Segment};

// ============================================================================
// Loop Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfig {
    pub pulse_interval: Duration,
    /// Segments taken from the source channel per pulse
    pub max_pulse_size: usize,
    pub channel_capacity: usize,
    /// Stop after this many pulses
    pub max_pulses: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            pulse_interval: Duration::from_millis(100),
            max_pulse_size: 64,
            channel_capacity: 1024,
            max_pulses: None,
        }
    }
}

/// Final report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub source: String,
    pub segments_received: u64,
    pub messages_sent: u64,
    pub sink_errors: u64,
    pub cancelled: bool,
    pub sequence: SequenceStats,
}

// ============================================================================
// Processing Loop
// ============================================================================

/// Owns the sequencer and sink for one run.
///
/// Built with [`new()`](ProcessingLoop::new), then consumed by
/// [`run()`](ProcessingLoop::run).
pub struct ProcessingLoop<K: PickSink> {
    sequencer: Sequencer,
    sink: K,
    config: LoopConfig,
    cancel_token: CancellationToken,
    messages_sent: u64,
    sink_errors: u64,
}

impl<K: PickSink> ProcessingLoop<K> {
    pub fn new(sequencer: Sequencer, sink: K, config: LoopConfig, cancel_token: CancellationToken) -> Self {
        Self {
            sequencer,
            sink,
            config,
            cancel_token,
            messages_sent: 0,
            sink_errors: 0,
        }
    }

    /// Run until the source is exhausted and drained, or cancellation.
    pub async fn run<S: SegmentSource>(mut self, source: S) -> RunSummary {
        let source_name = source.source_name().to_string();
        let (tx, mut rx) = mpsc::channel::<Segment>(self.config.channel_capacity.max(1));
        let feeder = tokio::spawn(feed(source, tx, self.cancel_token.clone()));

        let period = self.config.pulse_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(source = %source_name, interval_ms = period.as_millis() as u64, "Processing loop started");

        let mut received = 0u64;
        let mut source_done = false;
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    info!("[ProcessingLoop] Shutdown signal received");
                    cancelled = true;
                    break;
                }
                _ = ticker.tick() => {}
            }

            let mut input = Vec::with_capacity(self.config.max_pulse_size);
            while input.len() < self.config.max_pulse_size {
                match rx.try_recv() {
                    Ok(segment) => input.push(Packet::Segment(segment)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        source_done = true;
                        break;
                    }
                }
            }
            received += input.len() as u64;

            let output = self.sequencer.pulse(input);
            self.deliver(output);

            if self
                .config
                .max_pulses
                .is_some_and(|max| self.sequencer.pulses() >= max)
            {
                info!(pulses = self.sequencer.pulses(), "[ProcessingLoop] Pulse limit reached");
                break;
            }
            if source_done && self.sequencer.is_idle() {
                info!(segments = received, "[ProcessingLoop] Source drained");
                break;
            }
        }

        self.cancel_token.cancel();
        if let Err(e) = feeder.await {
            warn!(error = %e, "[ProcessingLoop] Source task failed");
        }

        let remaining = self.sequencer.flush();
        self.deliver(remaining);
        if let Err(e) = self.sink.flush() {
            warn!(error = %e, "[ProcessingLoop] Sink flush failed");
        }

        let summary = RunSummary {
            source: source_name,
            segments_received: received,
            messages_sent: self.messages_sent,
            sink_errors: self.sink_errors,
            cancelled,
            sequence: self.sequencer.stats(),
        };
        log_summary(&summary);
        summary
    }

    fn deliver(&mut self, packets: Vec<Packet>) {
        for packet in packets {
            match packet {
                Packet::Message(line) => match self.sink.send(&line) {
                    Ok(()) => self.messages_sent += 1,
                    Err(e) => {
                        self.sink_errors += 1;
                        warn!(error = %e, "[ProcessingLoop] Sink rejected message");
                    }
                },
                other => debug!(kind = other.kind(), "[ProcessingLoop] Discarding non-message output"),
            }
        }
    }
}

/// Forward source segments into the channel until EOF, error, or cancellation.
async fn feed<S: SegmentSource>(mut source: S, tx: mpsc::Sender<Segment>, cancel: CancellationToken) {
    let mut forwarded = 0u64;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = source.next_segment() => match result {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(source = source.source_name(), error = %e, "[SegmentSource] Source error");
                    break;
                }
            }
        };
        match event {
            SourceEvent::Segment(segment) => {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    result = tx.send(segment) => result.is_ok(),
                };
                if !sent {
                    break;
                }
                forwarded += 1;
            }
            SourceEvent::Eof => {
                info!(
                    source = source.source_name(),
                    segments = forwarded,
                    "[SegmentSource] Source reached end"
                );
                break;
            }
        }
    }
}

/// Log the final statistics block.
fn log_summary(summary: &RunSummary) {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("FINAL STATISTICS");
    info!("   Source:             {}", summary.source);
    info!("   Pulses:             {}", summary.sequence.pulses);
    info!("   Segments Received:  {}", summary.segments_received);
    info!("   Messages Sent:      {}", summary.messages_sent);
    for stage in &summary.sequence.stages {
        info!(
            "   {:<10} consumed {:>8} | emitted {:>8} | dropped {:>5} | failures {:>3}",
            stage.name, stage.slot.consumed, stage.slot.emitted, stage.slot.backpressure_drops, stage.slot.failures
        );
    }
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::source::ReplaySource;
    use crate::pipeline::stage::PassThrough;
    use crate::pipeline::sequencer::SlotConfig;
    use crate::sink::MemorySink;

    fn fast() -> LoopConfig {
        LoopConfig {
            pulse_interval: Duration::from_millis(1),
            max_pulse_size: 4,
            channel_capacity: 8,
            max_pulses: None,
        }
    }

    #[tokio::test]
    async fn drains_source_then_stops() {
        let segments: Vec<Segment> = (0..10)
            .map(|i| Segment::new("A.B..HHZ", f64::from(i), 1.0, vec![0.0]))
            .collect();
        let sequencer = Sequencer::new().with_stage(Box::new(PassThrough::new("p")), SlotConfig::default());
        let sink = MemorySink::new();
        let summary = ProcessingLoop::new(sequencer, sink.clone(), fast(), CancellationToken::new())
            .run(ReplaySource::new(segments, Duration::ZERO))
            .await;
        assert_eq!(summary.segments_received, 10);
        assert_eq!(summary.messages_sent, 0);
        assert!(!summary.cancelled);
        assert!(summary.sequence.pulses >= 3);
    }

    #[tokio::test]
    async fn pulse_limit_ends_run() {
        // 40 segments at 4 per pulse cannot drain in 3 pulses
        let segments: Vec<Segment> = (0..40)
            .map(|i| Segment::new("A.B..HHZ", f64::from(i), 1.0, vec![0.0]))
            .collect();
        let config = LoopConfig {
            max_pulses: Some(3),
            ..fast()
        };
        let summary = ProcessingLoop::new(Sequencer::new(), MemorySink::new(), config, CancellationToken::new())
            .run(ReplaySource::new(segments, Duration::ZERO))
            .await;
        assert_eq!(summary.sequence.pulses, 3);
        assert!(summary.segments_received <= 12);
    }

    #[tokio::test]
    async fn cancellation_stops_between_ticks() {
        let token = CancellationToken::new();
        token.cancel();
        let summary = ProcessingLoop::new(Sequencer::new(), MemorySink::new(), fast(), token)
            .run(ReplaySource::new(Vec::new(), Duration::ZERO))
            .await;
        assert!(summary.cancelled);
    }

    #[tokio::test]
    async fn messages_reach_the_sink() {
        struct Announce;
        impl crate::pipeline::stage::Stage for Announce {
            fn name(&self) -> &str {
                "announce"
            }
            fn step(&mut self, input: Vec<Packet>) -> Result<Vec<Packet>, crate::pipeline::stage::StageError> {
                Ok(input
                    .into_iter()
                    .map(|p| match p {
                        Packet::Segment(s) => Packet::Message(s.key),
                        other => other,
                    })
                    .collect())
            }
        }
        let sink = MemorySink::new();
        let sequencer = Sequencer::new().with_stage(Box::new(Announce), SlotConfig::default());
        let segments = vec![Segment::new("A.B..HHZ", 0.0, 1.0, vec![0.0])];
        let summary = ProcessingLoop::new(sequencer, sink.clone(), fast(), CancellationToken::new())
            .run(ReplaySource::new(segments, Duration::ZERO))
            .await;
        assert_eq!(summary.messages_sent, 1);
        assert_eq!(sink.messages(), vec!["A.B..HHZ"]);
    }
}
