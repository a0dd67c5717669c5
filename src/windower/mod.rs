//! Reference-aligned windowing engine
//!
//! Slices staged per-channel data into fixed-length, fixed-overlap
//! [`Window`]s, one instrument group at a time. Each group's frame grid is
//! anchored to its reference component: the first frame starts at the first
//! staged reference sample and every following frame starts
//! `reference_npts - reference_overlap` samples later.
//!
//! ```text
//! reference  |■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■■|
//! frame k    |<------- npts ------->|
//! frame k+1             |<------- npts ------->|
//!                       ^ t0 + (npts - overlap) / sr
//! ```
//!
//! A frame is only emitted when the reference completeness reaches its
//! threshold; other components below their threshold are dropped from the
//! window individually.

use crate::buffer::{Buffer, BufferConfig, BufferError, KeyOccupancy};
use crate::types::{split_component, Segment, Window, WindowTrace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Immutable windower configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowerConfig {
    /// Component codes accepted as the reference; the first is canonical
    pub reference_component: String,
    /// Component code groups for the other channels, e.g. `["N1", "E2"]`
    pub other_components: Vec<String>,
    pub reference_npts: usize,
    pub reference_overlap: usize,
    pub reference_sampling_rate: f64,
    pub reference_completeness_threshold: f64,
    pub other_completeness_threshold: f64,
    /// Neutral value for samples not covered by data
    pub fill_value: f64,
    /// Seconds of newer reference data to wait for before dropping an incomplete frame
    pub meta_memory: f64,
    /// Cut windows held before `advance` refuses to cut more
    pub max_output_size: usize,
}

impl Default for WindowerConfig {
    fn default() -> Self {
        Self {
            reference_component: "Z3".to_string(),
            other_components: vec!["N1".to_string(), "E2".to_string()],
            reference_npts: 6000,
            reference_overlap: 3000,
            reference_sampling_rate: 100.0,
            reference_completeness_threshold: 0.95,
            other_completeness_threshold: 0.8,
            fill_value: 0.0,
            meta_memory: 60.0,
            max_output_size: 20,
        }
    }
}

impl WindowerConfig {
    pub fn validate(&self, section: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.reference_component.is_empty() {
            errors.push(format!("{section}.reference_component must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for code in std::iter::once(&self.reference_component).chain(&self.other_components) {
            if code.is_empty() {
                errors.push(format!("{section}.other_components entries must not be empty"));
            }
            for c in code.chars() {
                if !seen.insert(c) {
                    errors.push(format!("{section}: component code '{c}' is assigned twice"));
                }
            }
        }
        if self.reference_npts == 0 {
            errors.push(format!("{section}.reference_npts must be > 0"));
        }
        if self.reference_overlap >= self.reference_npts {
            errors.push(format!(
                "{section}.reference_overlap ({}) must be < reference_npts ({})",
                self.reference_overlap, self.reference_npts
            ));
        }
        if !self.reference_sampling_rate.is_finite() || self.reference_sampling_rate <= 0.0 {
            errors.push(format!("{section}.reference_sampling_rate must be > 0"));
        }
        for (name, value) in [
            ("reference_completeness_threshold", self.reference_completeness_threshold),
            ("other_completeness_threshold", self.other_completeness_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{section}.{name} = {value} must be within [0, 1]"));
            }
        }
        if !self.meta_memory.is_finite() || self.meta_memory < 0.0 {
            errors.push(format!("{section}.meta_memory must be a non-negative number of seconds"));
        }
        if !self.fill_value.is_finite() {
            errors.push(format!("{section}.fill_value must be finite"));
        }
        if self.max_output_size == 0 {
            errors.push(format!("{section}.max_output_size must be > 0"));
        }
        errors
    }

    pub fn window_seconds(&self) -> f64 {
        self.reference_npts as f64 / self.reference_sampling_rate
    }

    pub fn step_seconds(&self) -> f64 {
        self.reference_npts.saturating_sub(self.reference_overlap) as f64 / self.reference_sampling_rate
    }

    /// Canonical component and reference flag for a raw component code.
    fn classify(&self, code: char) -> Option<(char, bool)> {
        if self.reference_component.contains(code) {
            return self.reference_component.chars().next().map(|c| (c, true));
        }
        self.other_components
            .iter()
            .find(|group| group.contains(code))
            .and_then(|group| group.chars().next())
            .map(|c| (c, false))
    }
}

/// Result of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// This many windows were cut
    Cut(usize),
    /// No group has enough reference data for its next frame
    Pending,
    /// Output queue is full; nothing was cut
    Backpressured,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowerStats {
    pub segments_staged: u64,
    pub segments_ignored: u64,
    pub windows_cut: u64,
    /// Frames dropped for insufficient reference completeness
    pub incomplete_discards: u64,
    /// Other-component traces dropped for insufficient completeness
    pub traces_dropped: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    next_t0: Option<f64>,
}

enum CutStep {
    Emitted(Window),
    Skipped,
    Wait,
}

/// Windowing engine. Exclusively owned by one stage.
#[derive(Debug)]
pub struct Windower {
    config: WindowerConfig,
    staging: Buffer,
    groups: BTreeMap<String, GroupState>,
    output: VecDeque<Window>,
    stats: WindowerStats,
}

impl Windower {
    pub fn new(config: WindowerConfig) -> Self {
        // Hold a full frame plus the meta_memory horizon behind the newest sample
        let span = config.meta_memory + 2.0 * config.window_seconds();
        Self {
            staging: Buffer::new(BufferConfig::append_span(span)),
            config,
            groups: BTreeMap::new(),
            output: VecDeque::new(),
            stats: WindowerStats::default(),
        }
    }

    pub fn config(&self) -> &WindowerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WindowerStats {
        &self.stats
    }

    /// Start time of the next frame for `group`, once anchored.
    pub fn next_t0(&self, group: &str) -> Option<f64> {
        self.groups.get(group).and_then(|g| g.next_t0)
    }

    /// Windows cut but not yet taken.
    pub fn queued(&self) -> usize {
        self.output.len()
    }

    /// Staging buffer occupancy per key.
    pub fn peek_state(&self) -> BTreeMap<String, KeyOccupancy> {
        self.staging.peek_state()
    }

    /// Stage a raw segment. Returns `false` if it was ignored.
    pub fn ingest(&mut self, segment: Segment) -> Result<bool, BufferError> {
        let (group, code) = split_component(&segment.key);
        let Some(code) = code else {
            self.stats.segments_ignored += 1;
            return Ok(false);
        };
        if self.config.classify(code).is_none() {
            debug!(key = %segment.key, "Segment component not configured, ignoring");
            self.stats.segments_ignored += 1;
            return Ok(false);
        }
        let rate = self.config.reference_sampling_rate;
        if (segment.sample_rate - rate).abs() > rate * 1e-9 {
            warn!(
                key = %segment.key,
                sample_rate = segment.sample_rate,
                expected = rate,
                "Segment sample rate does not match reference, ignoring"
            );
            self.stats.segments_ignored += 1;
            return Ok(false);
        }

        let next_t0 = self.next_t0(group);
        if next_t0.is_some_and(|t0| segment.end_time() <= t0) {
            self.stats.segments_ignored += 1;
            return Ok(false);
        }
        let key = segment.key.clone();
        let group = group.to_string();
        self.staging.ingest(segment)?;
        if let Some(t0) = next_t0 {
            self.staging.discard_before(&key, t0);
        }
        self.groups.entry(group).or_default();
        self.stats.segments_staged += 1;
        Ok(true)
    }

    /// Cut every frame that is ready, up to the output cap.
    pub fn advance(&mut self) -> AdvanceOutcome {
        self.cut_ready(false)
    }

    /// Cut remaining frames regardless of whether the reference reaches the
    /// frame end, then hand back every queued window.
    pub fn flush(&mut self) -> Vec<Window> {
        let cap = self.config.max_output_size;
        self.config.max_output_size = usize::MAX;
        self.cut_ready(true);
        self.config.max_output_size = cap;
        self.output.drain(..).collect()
    }

    /// Remove up to `n` queued windows, oldest first.
    pub fn take_windows(&mut self, n: usize) -> Vec<Window> {
        let n = n.min(self.output.len());
        self.output.drain(..n).collect()
    }

    fn cut_ready(&mut self, finishing: bool) -> AdvanceOutcome {
        if self.output.len() >= self.config.max_output_size {
            return AdvanceOutcome::Backpressured;
        }
        let groups: Vec<String> = self.groups.keys().cloned().collect();
        let mut cut = 0;
        for group in groups {
            loop {
                if self.output.len() >= self.config.max_output_size {
                    return AdvanceOutcome::Cut(cut);
                }
                match self.try_cut(&group, finishing) {
                    CutStep::Emitted(window) => {
                        self.output.push_back(window);
                        cut += 1;
                    }
                    CutStep::Skipped => {}
                    CutStep::Wait => break,
                }
            }
        }
        if cut > 0 {
            AdvanceOutcome::Cut(cut)
        } else {
            AdvanceOutcome::Pending
        }
    }

    /// Staged keys of `group` as (canonical component, is reference, key).
    fn group_keys(&self, group: &str) -> Vec<(char, bool, String)> {
        let mut keys: Vec<(char, bool, String)> = Vec::new();
        for key in self.staging.keys() {
            let (g, code) = split_component(key);
            if g != group {
                continue;
            }
            if let Some((canonical, is_ref)) = code.and_then(|c| self.config.classify(c)) {
                if !keys.iter().any(|(c, _, _)| *c == canonical) {
                    keys.push((canonical, is_ref, key.to_string()));
                }
            }
        }
        keys
    }

    fn try_cut(&mut self, group: &str, finishing: bool) -> CutStep {
        let keys = self.group_keys(group);
        let Some((ref_component, _, ref_key)) = keys.iter().find(|(_, is_ref, _)| *is_ref).cloned()
        else {
            return CutStep::Wait;
        };

        let sr = self.config.reference_sampling_rate;
        let npts = self.config.reference_npts;
        let half_sample = 0.5 / sr;

        let Some(first_start) = self.staging.segments(&ref_key).next().map(|s| s.start_time) else {
            return CutStep::Wait;
        };
        let ref_end = self
            .staging
            .segments(&ref_key)
            .map(Segment::end_time)
            .fold(f64::NEG_INFINITY, f64::max);
        let t0 = self.next_t0(group).unwrap_or(first_start);
        let frame_end = t0 + self.config.window_seconds();

        if !finishing && ref_end < frame_end - half_sample {
            return CutStep::Wait;
        }
        if finishing && ref_end <= t0 + half_sample {
            return CutStep::Wait;
        }

        let (ref_samples, ref_covered) = self.extract(&ref_key, t0);
        let ref_completeness = ref_covered as f64 / npts as f64;
        if ref_completeness < self.config.reference_completeness_threshold {
            let stale = ref_end - frame_end >= self.config.meta_memory - half_sample;
            if finishing || stale {
                debug!(
                    group = %group,
                    t0 = t0,
                    completeness = ref_completeness,
                    "Dropping incomplete frame"
                );
                self.stats.incomplete_discards += 1;
                self.step_group(group, t0, &keys);
                return CutStep::Skipped;
            }
            return CutStep::Wait;
        }

        let mut traces = BTreeMap::new();
        traces.insert(
            ref_component,
            WindowTrace {
                key: ref_key,
                samples: ref_samples,
                completeness: ref_completeness,
            },
        );
        for (component, _, key) in keys.iter().filter(|(_, is_ref, _)| !is_ref) {
            let (samples, covered) = self.extract(key, t0);
            let completeness = covered as f64 / npts as f64;
            if completeness < self.config.other_completeness_threshold {
                debug!(key = %key, completeness = completeness, "Dropping incomplete trace from window");
                self.stats.traces_dropped += 1;
                continue;
            }
            traces.insert(
                *component,
                WindowTrace {
                    key: key.clone(),
                    samples,
                    completeness,
                },
            );
        }

        let window = Window {
            group: group.to_string(),
            t0,
            sample_rate: sr,
            npts,
            overlap: self.config.reference_overlap,
            reference_component: ref_component,
            traces,
        };
        debug!(group = %group, t0 = t0, traces = window.traces.len(), "Window cut");
        self.stats.windows_cut += 1;
        self.step_group(group, t0, &keys);
        CutStep::Emitted(window)
    }

    /// Move the group's frame one step forward and drop staged data behind it.
    fn step_group(&mut self, group: &str, t0: f64, keys: &[(char, bool, String)]) {
        let next = t0 + self.config.step_seconds();
        self.groups.entry(group.to_string()).or_default().next_t0 = Some(next);
        for (_, _, key) in keys {
            self.staging.discard_before(key, next);
        }
    }

    /// Frame samples for `key` starting at `t0`, and the number actually covered.
    fn extract(&self, key: &str, t0: f64) -> (Vec<f64>, usize) {
        let npts = self.config.reference_npts;
        let sr = self.config.reference_sampling_rate;
        let frame_end = t0 + self.config.window_seconds();
        let mut samples = vec![self.config.fill_value; npts];
        let mut covered = 0;
        for seg in self.staging.segments(key) {
            if seg.end_time() <= t0 || seg.start_time >= frame_end {
                continue;
            }
            let shift = ((seg.start_time - t0) * sr).round() as i64;
            let first = usize::try_from(-shift).unwrap_or(0);
            for (i, (&value, &fold)) in seg.samples.iter().zip(&seg.fold).enumerate().skip(first) {
                let j = (shift + i as i64) as usize;
                if j >= npts {
                    break;
                }
                if fold > 0 {
                    samples[j] = value;
                    covered += 1;
                }
            }
        }
        (samples, covered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(npts: usize, overlap: usize) -> WindowerConfig {
        WindowerConfig {
            reference_npts: npts,
            reference_overlap: overlap,
            reference_sampling_rate: 100.0,
            reference_completeness_threshold: 0.8,
            other_completeness_threshold: 0.8,
            meta_memory: 30.0,
            ..WindowerConfig::default()
        }
    }

    fn channel(code: char, start: f64, n: usize) -> Segment {
        Segment::new(format!("UW.GNW..BH{code}"), start, 100.0, vec![1.0; n])
    }

    #[test]
    fn partial_reference_does_not_cut_or_move_t0() {
        let mut windower = Windower::new(config(6000, 3000));
        windower.ingest(channel('Z', 0.0, 4000)).unwrap();
        assert_eq!(windower.advance(), AdvanceOutcome::Pending);
        assert_eq!(windower.queued(), 0);
        assert_eq!(windower.next_t0("UW.GNW..BH"), None);
    }

    #[test]
    fn consecutive_windows_step_by_npts_minus_overlap() {
        let mut windower = Windower::new(config(6000, 3000));
        for code in ['Z', 'N', 'E'] {
            windower.ingest(channel(code, 0.0, 15_000)).unwrap();
        }
        assert_eq!(windower.advance(), AdvanceOutcome::Cut(4));
        let windows = windower.take_windows(10);
        let t0s: Vec<f64> = windows.iter().map(|w| w.t0).collect();
        for pair in t0s.windows(2) {
            assert!((pair[1] - pair[0] - 30.0).abs() < 1e-9);
        }
        assert!(windows.iter().all(|w| w.traces.len() == 3));
        assert!(windows.iter().all(|w| w.traces.values().all(|t| t.samples.len() == 6000)));
        assert_eq!(windower.next_t0("UW.GNW..BH"), Some(120.0));
    }

    #[test]
    fn incomplete_other_component_is_dropped_alone() {
        let mut windower = Windower::new(config(1000, 500));
        windower.ingest(channel('Z', 0.0, 1000)).unwrap();
        windower.ingest(channel('N', 0.0, 1000)).unwrap();
        windower.ingest(channel('E', 0.0, 500)).unwrap();
        assert_eq!(windower.advance(), AdvanceOutcome::Cut(1));
        let window = windower.take_windows(1).remove(0);
        assert_eq!(window.traces.keys().copied().collect::<Vec<_>>(), vec!['N', 'Z']);
        assert_eq!(windower.stats().traces_dropped, 1);
    }

    #[test]
    fn gap_in_reference_waits_then_drops_after_meta_memory() {
        let mut windower = Windower::new(config(1000, 500));
        windower.ingest(channel('Z', 0.0, 500)).unwrap();
        // Gap from 5 s to 9 s, then data again: frame 0 is 60% complete
        windower.ingest(channel('Z', 9.0, 1100)).unwrap();
        assert_eq!(windower.advance(), AdvanceOutcome::Pending);
        assert_eq!(windower.next_t0("UW.GNW..BH"), None);

        // Reference now extends well past meta_memory beyond the frame end
        windower.ingest(channel('Z', 20.0, 3000)).unwrap();
        let outcome = windower.advance();
        assert!(matches!(outcome, AdvanceOutcome::Cut(_)));
        assert!(windower.stats().incomplete_discards >= 1);
        let windows = windower.take_windows(100);
        assert!(windows
            .iter()
            .all(|w| w.reference().unwrap().completeness >= 0.8));
    }

    #[test]
    fn emitted_windows_meet_completeness_thresholds() {
        let mut windower = Windower::new(config(1000, 0));
        windower.ingest(channel('Z', 0.0, 950)).unwrap();
        windower.ingest(channel('Z', 10.0, 1000)).unwrap();
        windower.ingest(channel('N', 0.0, 700)).unwrap();
        windower.ingest(channel('N', 10.0, 900)).unwrap();
        windower.advance();
        let windows = windower.take_windows(10);
        assert_eq!(windows.len(), 2);
        assert!((windows[0].completeness('Z').unwrap() - 0.95).abs() < 1e-12);
        assert_eq!(windows[0].completeness('N'), None);
        assert!((windows[1].completeness('N').unwrap() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn full_output_queue_refuses_to_cut() {
        let mut windower = Windower::new(WindowerConfig {
            max_output_size: 2,
            ..config(1000, 500)
        });
        windower.ingest(channel('Z', 0.0, 5000)).unwrap();
        assert_eq!(windower.advance(), AdvanceOutcome::Cut(2));
        assert_eq!(windower.advance(), AdvanceOutcome::Backpressured);
        windower.take_windows(1);
        assert_eq!(windower.advance(), AdvanceOutcome::Cut(1));
        let t0s: Vec<f64> = windower.take_windows(5).iter().map(|w| w.t0).collect();
        assert_eq!(t0s, vec![5.0, 10.0]);
    }

    #[test]
    fn component_aliases_map_to_canonical() {
        let mut windower = Windower::new(config(1000, 500));
        windower.ingest(channel('3', 0.0, 1000)).unwrap();
        windower.ingest(channel('1', 0.0, 1000)).unwrap();
        assert!(!windower.ingest(channel('X', 0.0, 1000)).unwrap());
        windower.advance();
        let window = windower.take_windows(1).remove(0);
        assert_eq!(window.reference_component, 'Z');
        assert_eq!(window.traces[&'Z'].key, "UW.GNW..BH3");
        assert!(window.traces.contains_key(&'N'));
    }

    #[test]
    fn mismatched_sample_rate_is_ignored() {
        let mut windower = Windower::new(config(1000, 500));
        let seg = Segment::new("UW.GNW..BHZ", 0.0, 40.0, vec![0.0; 100]);
        assert!(!windower.ingest(seg).unwrap());
        assert_eq!(windower.stats().segments_ignored, 1);
    }

    #[test]
    fn flush_cuts_trailing_partial_frame() {
        let mut windower = Windower::new(config(1000, 500));
        windower.ingest(channel('Z', 0.0, 1400)).unwrap();
        assert_eq!(windower.advance(), AdvanceOutcome::Cut(1));
        // Frame at 5 s holds 900 of 1000 samples
        let windows = windower.flush();
        assert_eq!(windows.len(), 2);
        assert!((windows[1].t0 - 5.0).abs() < 1e-9);
        assert!((windows[1].completeness('Z').unwrap() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn validate_rejects_overlap_not_below_npts() {
        let errors = config(100, 100).validate("window");
        assert!(errors.iter().any(|e| e.contains("reference_overlap")));
        assert!(WindowerConfig::default().validate("window").is_empty());
    }
}
