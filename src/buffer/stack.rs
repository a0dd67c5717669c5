//! Fold-weighted stack merge with edge blinding.
//!
//! Each key holds at most one continuous trace. Incoming segments lose
//! `blinding` samples at both ends, then combine sample-wise with the trace;
//! the fold of every trace sample counts the contributions covering it.

use super::{BufferConfig, BufferStats, IngestOutcome, KeyState, StackFunction};
use crate::types::Segment;
use tracing::debug;

pub(super) fn ingest(
    config: &BufferConfig,
    state: &mut KeyState,
    mut segment: Segment,
    stats: &mut BufferStats,
) -> IngestOutcome {
    segment.trim_edges(config.blinding, config.blinding);
    if segment.is_empty() {
        stats.blinded += 1;
        return IngestOutcome::Blinded;
    }

    // Samples already handed downstream cannot be revised
    if let Some(horizon) = state.drained_until {
        let cut = segment.offset_of(horizon);
        if cut >= segment.len() as i64 {
            stats.rejected += 1;
            return IngestOutcome::Rejected;
        }
        if cut > 0 {
            segment.split_front(cut as usize);
        }
    }

    let span = config.max_length;
    let settle = segment.start_time;
    let outcome = match state.segments.front_mut() {
        None => {
            state.segments.push_back(segment);
            IngestOutcome::Stacked
        }
        Some(trace) => {
            let latest = trace.end_time().max(segment.end_time());
            let horizon = latest - span;
            if segment.end_time() <= horizon {
                stats.rejected += 1;
                return IngestOutcome::Rejected;
            }
            if trace.end_time() <= horizon {
                debug!(key = %segment.key, "Stack input far ahead of retained trace, re-initializing");
                let expired = std::mem::replace(trace, segment);
                state.drained_until = Some(expired.end_time());
                state.ready.push_back(expired);
                stats.reinitialized += 1;
                IngestOutcome::Reinitialized
            } else {
                merge_into(trace, &segment, config.stack_function, config.fill_value);
                // Samples behind the horizon leave the trace as final output
                let cut = trace.offset_of(horizon);
                if cut > 0 {
                    let expired = trace.split_front(cut as usize);
                    state.drained_until = Some(expired.end_time());
                    state.ready.push_back(expired);
                    stats.expired += 1;
                }
                IngestOutcome::Stacked
            }
        }
    };

    state.settled_before = Some(state.settled_before.map_or(settle, |s| s.max(settle)));
    outcome
}

/// Combine `incoming` into `trace`, growing the trace where needed.
fn merge_into(trace: &mut Segment, incoming: &Segment, function: StackFunction, fill: f64) {
    let offset = trace.offset_of(incoming.start_time);
    if offset < 0 {
        let pad = offset.unsigned_abs() as usize;
        let mut samples = vec![fill; pad];
        samples.append(&mut trace.samples);
        let mut fold = vec![0; pad];
        fold.append(&mut trace.fold);
        trace.samples = samples;
        trace.fold = fold;
        trace.start_time -= pad as f64 / trace.sample_rate;
    }
    let offset = offset.max(0) as usize;

    let needed = offset + incoming.len();
    if needed > trace.len() {
        trace.samples.resize(needed, fill);
        trace.fold.resize(needed, 0);
    }

    for (i, (&value, &fold)) in incoming.samples.iter().zip(&incoming.fold).enumerate() {
        if fold == 0 {
            continue;
        }
        let j = offset + i;
        let held = trace.fold[j];
        if held == 0 {
            trace.samples[j] = value;
            trace.fold[j] = fold;
            continue;
        }
        match function {
            StackFunction::Mask => {
                trace.samples[j] = fill;
                trace.fold[j] = 0;
            }
            StackFunction::Max => {
                trace.samples[j] = trace.samples[j].max(value);
                trace.fold[j] = held + fold;
            }
            StackFunction::Mean => {
                trace.samples[j] = (trace.samples[j] * f64::from(held) + value * f64::from(fold))
                    / f64::from(held + fold);
                trace.fold[j] = held + fold;
            }
        }
    }
}

/// Hand out up to `max_items` segments: expired prefixes first, then the
/// settled prefix of the live trace.
pub(super) fn drain_settled(state: &mut KeyState, max_items: usize) -> Vec<Segment> {
    let n = state.ready.len().min(max_items);
    let mut out: Vec<Segment> = state.ready.drain(..n).collect();
    if out.len() < max_items && state.ready.is_empty() {
        out.extend(split_settled(state));
    }
    out
}

fn split_settled(state: &mut KeyState) -> Option<Segment> {
    let settle = state.settled_before?;
    let trace = state.segments.front_mut()?;
    let idx = trace.offset_of(settle).clamp(0, trace.len() as i64) as usize;
    if idx == 0 {
        return None;
    }
    let out = trace.split_front(idx);
    state.drained_until = Some(out.end_time());
    if trace.is_empty() {
        state.segments.pop_front();
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::super::{Buffer, BufferConfig, IngestOutcome, StackFunction};
    use crate::types::Segment;

    fn window(start: f64, values: Vec<f64>) -> Segment {
        Segment::new("UW.GNW..BHP", start, 1.0, values)
    }

    #[test]
    fn fold_counts_overlapping_contributions() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 100.0, 0));
        buffer.ingest(window(0.0, vec![0.1; 6])).unwrap();
        buffer.ingest(window(3.0, vec![0.2; 6])).unwrap();
        buffer.ingest(window(6.0, vec![0.3; 6])).unwrap();
        let out = buffer.flush();
        assert_eq!(out.len(), 1);
        let trace = &out[0];
        assert_eq!(trace.len(), 12);
        assert_eq!(trace.fold, vec![1, 1, 1, 2, 2, 2, 2, 2, 2, 1, 1, 1]);
        assert_eq!(trace.samples[4], 0.2);
        assert_eq!(trace.samples[7], 0.3);
    }

    #[test]
    fn blinding_is_excluded_from_fold() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 100.0, 1));
        buffer.ingest(window(0.0, vec![0.5; 6])).unwrap();
        buffer.ingest(window(3.0, vec![0.5; 6])).unwrap();
        let trace = buffer.flush().remove(0);
        // First contributes 1..5, second 4..8
        assert!((trace.start_time - 1.0).abs() < 1e-9);
        assert_eq!(trace.fold, vec![1, 1, 1, 2, 1, 1, 1]);
    }

    #[test]
    fn mean_is_fold_weighted() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Mean, 100.0, 0));
        buffer
            .ingest(Segment::with_fold("K", 0.0, 1.0, vec![0.3, 0.3], vec![2, 2]))
            .unwrap();
        buffer.ingest(Segment::new("K", 0.0, 1.0, vec![0.6, 0.6])).unwrap();
        let trace = buffer.flush().remove(0);
        assert!((trace.samples[0] - 0.4).abs() < 1e-12);
        assert_eq!(trace.fold, vec![3, 3]);
    }

    #[test]
    fn fully_blinded_segment_contributes_nothing() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 100.0, 3));
        let outcome = buffer.ingest(window(0.0, vec![0.9; 6])).unwrap();
        assert_eq!(outcome, IngestOutcome::Blinded);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().blinded, 1);
    }

    #[test]
    fn gap_between_contributions_has_zero_fold() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 100.0, 0));
        buffer.ingest(window(0.0, vec![0.4; 2])).unwrap();
        buffer.ingest(window(4.0, vec![0.4; 2])).unwrap();
        let trace = buffer.flush().remove(0);
        assert_eq!(trace.fold, vec![1, 1, 0, 0, 1, 1]);
        assert_eq!(trace.covered(), 4);
    }

    #[test]
    fn earlier_contribution_extends_trace_backwards() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 100.0, 0));
        buffer.ingest(window(5.0, vec![0.2; 3])).unwrap();
        buffer.ingest(window(3.0, vec![0.1; 3])).unwrap();
        let trace = buffer.flush().remove(0);
        assert!((trace.start_time - 3.0).abs() < 1e-9);
        assert_eq!(trace.fold, vec![1, 1, 2, 1, 1]);
        assert_eq!(trace.samples[2], 0.2);
    }

    #[test]
    fn drain_emits_only_settled_prefix() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 100.0, 0));
        buffer.ingest(window(0.0, vec![0.1; 6])).unwrap();
        buffer.ingest(window(3.0, vec![0.1; 6])).unwrap();
        let drained = buffer.drain(1);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].len(), 3);
        assert_eq!(drained[0].fold, vec![1, 1, 1]);
        // Next window settles the next step
        buffer.ingest(window(6.0, vec![0.1; 6])).unwrap();
        let drained = buffer.drain(1);
        assert_eq!(drained[0].fold, vec![2, 2, 2]);
        assert!((drained[0].start_time - 3.0).abs() < 1e-9);
    }

    #[test]
    fn late_contribution_to_drained_samples_is_cut() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 100.0, 0));
        buffer.ingest(window(0.0, vec![0.1; 6])).unwrap();
        buffer.ingest(window(3.0, vec![0.1; 6])).unwrap();
        buffer.drain(1);
        let outcome = buffer.ingest(window(0.0, vec![0.9; 2])).unwrap();
        assert_eq!(outcome, IngestOutcome::Rejected);
        buffer.ingest(window(1.0, vec![0.9; 4])).unwrap();
        let trace = buffer.flush().remove(0);
        // Only the 3.0 .. 5.0 part of the late window survived the cut
        assert!((trace.start_time - 3.0).abs() < 1e-9);
        assert_eq!(trace.fold, vec![3, 3, 2, 1, 1, 1]);
        assert_eq!(trace.samples[1], 0.9);
        assert_eq!(trace.samples[2], 0.1);
    }

    #[test]
    fn retention_releases_expired_prefix_and_reinitializes() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 5.0, 0));
        buffer.ingest(window(0.0, vec![0.1; 4])).unwrap();
        buffer.ingest(window(3.0, vec![0.2; 4])).unwrap();
        // Latest end 7.0, horizon 2.0: 0.0 .. 2.0 is released, not dropped
        assert_eq!(buffer.peek_state()["UW.GNW..BHP"].start_time, Some(0.0));
        assert_eq!(buffer.stats().expired, 1);
        let drained = buffer.drain(10);
        assert_eq!(drained.len(), 2);
        assert!((drained[0].start_time - 0.0).abs() < 1e-9);
        assert_eq!(drained[0].fold, vec![1, 1]);
        assert!((drained[1].start_time - 2.0).abs() < 1e-9);
        assert_eq!(drained[1].fold, vec![1]);

        let outcome = buffer.ingest(window(100.0, vec![0.1; 4])).unwrap();
        assert_eq!(outcome, IngestOutcome::Reinitialized);
        // The old trace 3.0 .. 7.0 is handed out whole
        let drained = buffer.drain(10);
        assert_eq!(drained.len(), 1);
        assert!((drained[0].start_time - 3.0).abs() < 1e-9);
        assert_eq!(drained[0].fold, vec![2, 1, 1, 1]);
        assert_eq!(drained[0].samples[0], 0.2);

        let outcome = buffer.ingest(window(10.0, vec![0.1; 4])).unwrap();
        assert_eq!(outcome, IngestOutcome::Rejected);
    }

    fn sliding_windows(count: usize) -> Vec<Segment> {
        // 60 s windows at 100 Hz stepping by 30 s
        (0..count)
            .map(|k| Segment::new("UW.GNW..BHP", k as f64 * 30.0, 100.0, vec![0.5; 6000]))
            .collect()
    }

    fn assert_contiguous(out: &[Segment]) {
        for pair in out.windows(2) {
            assert!((pair[0].end_time() - pair[1].start_time).abs() < 1e-6);
        }
    }

    #[test]
    fn span_of_one_window_emits_every_settled_sample() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 60.0, 0));
        let mut out = Vec::new();
        for w in sliding_windows(6) {
            buffer.ingest(w).unwrap();
            out.extend(buffer.drain(usize::MAX));
        }
        assert_contiguous(&out);
        let samples: usize = out.iter().map(Segment::len).sum();
        assert_eq!(samples, 5 * 3000);
        assert!((out[0].start_time - 0.0).abs() < 1e-9);
        assert!(out[0].fold[..3000].iter().all(|&f| f == 1));
        assert!(out.iter().flat_map(|s| &s.fold).skip(3000).all(|&f| f == 2));

        let tail = buffer.flush();
        assert_eq!(tail.iter().map(Segment::len).sum::<usize>(), 6000);
        assert_eq!(buffer.stats().evicted, 0);
    }

    #[test]
    fn burst_past_the_span_is_released_in_order() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 60.0, 0));
        for w in sliding_windows(6) {
            buffer.ingest(w).unwrap();
        }
        // Nothing drained yet; the expired prefixes are all still held
        let out = buffer.drain(usize::MAX);
        assert_eq!(out.len(), 5);
        assert_contiguous(&out);
        assert_eq!(out.iter().map(Segment::len).sum::<usize>(), 5 * 3000);
        assert_eq!(buffer.stats().expired, 5);
    }

    #[test]
    fn drain_limit_applies_to_expired_prefixes() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Max, 60.0, 0));
        for w in sliding_windows(4) {
            buffer.ingest(w).unwrap();
        }
        let first = buffer.drain(2);
        assert_eq!(first.len(), 2);
        let rest = buffer.drain(usize::MAX);
        assert_eq!(rest.len(), 1);
        assert!((first[1].end_time() - rest[0].start_time).abs() < 1e-6);
    }

    #[test]
    fn mask_blanks_overlapping_samples() {
        let mut buffer = Buffer::new(BufferConfig::stack(StackFunction::Mask, 100.0, 0));
        buffer.ingest(window(0.0, vec![0.1; 6])).unwrap();
        buffer.ingest(window(3.0, vec![0.2; 6])).unwrap();
        let trace = buffer.flush().remove(0);
        assert_eq!(trace.fold, vec![1, 1, 1, 0, 0, 0, 1, 1, 1]);
        assert_eq!(trace.samples[0], 0.1);
        assert_eq!(trace.samples[4], 0.0);
        assert_eq!(trace.samples[7], 0.2);
    }
}
