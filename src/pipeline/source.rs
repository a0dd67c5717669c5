//! Segment source abstraction for raw waveform ingestion.
//!
//! Provides a unified trait for reading raw segments from different sources:
//! pre-loaded replay, stdin (JSON lines), and the synthetic generator.

use crate::synthetic::{SyntheticConfig, WaveformGenerator};
use crate::types::Segment;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;

/// Events produced by a segment source.
#[derive(Debug)]
pub enum SourceEvent {
    /// A raw segment was read.
    Segment(Segment),
    /// Source reached end of data.
    Eof,
}

/// Trait abstracting where raw segments come from.
///
/// Implementations handle format parsing and pacing internally. The
/// processing loop reads from a source task through a bounded channel.
#[async_trait]
pub trait SegmentSource: Send + 'static {
    /// Read the next segment from the source.
    ///
    /// Returns `SourceEvent::Eof` when no more data is available.
    async fn next_segment(&mut self) -> Result<SourceEvent>;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

// ============================================================================
// Replay Source (pre-loaded segments)
// ============================================================================

/// Replays pre-loaded segments with optional inter-segment delay.
pub struct ReplaySource {
    segments: std::vec::IntoIter<Segment>,
    delay: Duration,
    yielded_first: bool,
}

impl ReplaySource {
    pub fn new(segments: Vec<Segment>, delay: Duration) -> Self {
        Self {
            segments: segments.into_iter(),
            delay,
            yielded_first: false,
        }
    }
}

#[async_trait]
impl SegmentSource for ReplaySource {
    async fn next_segment(&mut self) -> Result<SourceEvent> {
        if self.yielded_first && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.segments.next() {
            Some(s) => {
                self.yielded_first = true;
                Ok(SourceEvent::Segment(s))
            }
            None => Ok(SourceEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// Stdin Source (JSON segments, one per line)
// ============================================================================

/// Reads JSON-formatted segments from stdin.
///
/// Used with the synthetic generator:
/// `./synthetic --minutes 10 | ./pulse-rt --stdin`
pub struct StdinSource {
    reader: tokio::io::BufReader<tokio::io::Stdin>,
    line_buffer: String,
    malformed: u64,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: tokio::io::BufReader::new(tokio::io::stdin()),
            line_buffer: String::with_capacity(16 * 1024),
            malformed: 0,
        }
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one JSON line into a segment with a consistent fold.
pub fn parse_segment_line(line: &str) -> serde_json::Result<Segment> {
    serde_json::from_str::<Segment>(line).map(Segment::normalized)
}

#[async_trait]
impl SegmentSource for StdinSource {
    async fn next_segment(&mut self) -> Result<SourceEvent> {
        use tokio::io::AsyncBufReadExt;
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(SourceEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match parse_segment_line(line) {
                Ok(segment) => return Ok(SourceEvent::Segment(segment)),
                Err(e) => {
                    self.malformed += 1;
                    tracing::warn!(error = %e, malformed = self.malformed, "[StdinSource] Failed to parse segment");
                    // Skip malformed lines and keep reading
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

// ============================================================================
// Synthetic Source (in-process generator)
// ============================================================================

/// Streams generated three-component data, paced by `speed`.
///
/// `speed` is the time compression factor: 1 = real-time, 0 = as fast as the
/// consumer reads.
pub struct SyntheticSource {
    generator: WaveformGenerator,
    pending: VecDeque<Segment>,
    pace: Duration,
    yielded_chunk: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig, speed: f64) -> Result<Self> {
        let generator = WaveformGenerator::new(config)?;
        let pace = if speed.is_finite() && speed > 0.0 {
            Duration::from_secs_f64(generator.config().chunk_seconds / speed)
        } else {
            Duration::ZERO
        };
        Ok(Self {
            generator,
            pending: VecDeque::new(),
            pace,
            yielded_chunk: false,
        })
    }
}

#[async_trait]
impl SegmentSource for SyntheticSource {
    async fn next_segment(&mut self) -> Result<SourceEvent> {
        if self.pending.is_empty() {
            if self.yielded_chunk && !self.pace.is_zero() {
                tokio::time::sleep(self.pace).await;
            }
            match self.generator.next_chunk() {
                Some(chunk) => {
                    self.pending.extend(chunk);
                    self.yielded_chunk = true;
                }
                None => return Ok(SourceEvent::Eof),
            }
        }
        Ok(self
            .pending
            .pop_front()
            .map_or(SourceEvent::Eof, SourceEvent::Segment))
    }

    fn source_name(&self) -> &str {
        "synthetic"
    }
}
