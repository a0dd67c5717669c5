//! Time-stamped sample runs with per-sample fold.

use serde::{Deserialize, Serialize};

/// A contiguous, fixed-rate span of samples for one key.
///
/// `fold` carries one entry per sample: the number of source contributions
/// merged into that sample. Raw data is fold 1 everywhere; a fold of 0 marks
/// padding (absent data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// SEED-style channel identifier (`NET.STA.LOC.CHA`)
    pub key: String,
    /// Epoch seconds of the first sample
    pub start_time: f64,
    /// Samples per second
    pub sample_rate: f64,
    pub samples: Vec<f64>,
    /// Per-sample fold; filled with 1 when absent from JSON input
    #[serde(default)]
    pub fold: Vec<u32>,
}

impl Segment {
    /// Build a raw (fold 1) segment.
    pub fn new(key: impl Into<String>, start_time: f64, sample_rate: f64, samples: Vec<f64>) -> Self {
        let fold = vec![1; samples.len()];
        Self {
            key: key.into(),
            start_time,
            sample_rate,
            samples,
            fold,
        }
    }

    /// Build a segment with an explicit per-sample fold.
    ///
    /// A `fold` of the wrong length is resized (padding with 0).
    pub fn with_fold(
        key: impl Into<String>,
        start_time: f64,
        sample_rate: f64,
        samples: Vec<f64>,
        mut fold: Vec<u32>,
    ) -> Self {
        fold.resize(samples.len(), 0);
        Self {
            key: key.into(),
            start_time,
            sample_rate,
            samples,
            fold,
        }
    }

    /// Restore the fold/sample length invariant after deserialization.
    pub fn normalized(mut self) -> Self {
        if self.fold.is_empty() {
            self.fold = vec![1; self.samples.len()];
        } else {
            self.fold.resize(self.samples.len(), 0);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn delta(&self) -> f64 {
        1.0 / self.sample_rate
    }

    /// Exclusive end time (time of the sample after the last one).
    pub fn end_time(&self) -> f64 {
        self.time_at(self.samples.len())
    }

    /// Time of the sample at `index`.
    pub fn time_at(&self, index: usize) -> f64 {
        self.start_time + index as f64 / self.sample_rate
    }

    /// Nearest sample offset of `time` relative to this segment's start.
    ///
    /// May be negative or beyond `len()`.
    pub fn offset_of(&self, time: f64) -> i64 {
        ((time - self.start_time) * self.sample_rate).round() as i64
    }

    /// Highest per-sample fold (the segment's nominal fold).
    pub fn nominal_fold(&self) -> u32 {
        self.fold.iter().copied().max().unwrap_or(0)
    }

    /// Number of samples carrying real data (fold > 0).
    pub fn covered(&self) -> usize {
        self.fold.iter().filter(|&&f| f > 0).count()
    }

    /// Instrument group of this segment's key.
    pub fn group(&self) -> &str {
        split_component(&self.key).0
    }

    /// Component character of this segment's key.
    pub fn component(&self) -> Option<char> {
        split_component(&self.key).1
    }

    /// Copy of the samples in `[from, to)` (indices clamped to the segment).
    pub fn slice(&self, from: usize, to: usize) -> Self {
        let to = to.min(self.samples.len());
        let from = from.min(to);
        Self {
            key: self.key.clone(),
            start_time: self.time_at(from),
            sample_rate: self.sample_rate,
            samples: self.samples[from..to].to_vec(),
            fold: self.fold[from..to].to_vec(),
        }
    }

    /// Split off and return everything before sample `index`, keeping the rest.
    pub fn split_front(&mut self, index: usize) -> Self {
        let index = index.min(self.samples.len());
        let tail_samples = self.samples.split_off(index);
        let tail_fold = self.fold.split_off(index);
        let front = Self {
            key: self.key.clone(),
            start_time: self.start_time,
            sample_rate: self.sample_rate,
            samples: std::mem::replace(&mut self.samples, tail_samples),
            fold: std::mem::replace(&mut self.fold, tail_fold),
        };
        self.start_time = front.time_at(index);
        front
    }

    /// Drop `lead` samples from the front and `trail` from the back.
    pub fn trim_edges(&mut self, lead: usize, trail: usize) {
        let len = self.samples.len();
        if lead + trail >= len {
            self.start_time = self.time_at(len.min(lead));
            self.samples.clear();
            self.fold.clear();
            return;
        }
        self.samples.truncate(len - trail);
        self.fold.truncate(len - trail);
        if lead > 0 {
            self.split_front(lead);
        }
    }
}

/// Split a key into its instrument group and component character.
///
/// `UW.GNW..BHZ` → (`UW.GNW..BH`, `Some('Z')`). An empty key has no component.
pub fn split_component(key: &str) -> (&str, Option<char>) {
    match key.char_indices().last() {
        Some((idx, c)) => (&key[..idx], Some(c)),
        None => (key, None),
    }
}

/// Key of a derived stream for `group` with `component` as the last character.
pub fn component_key(group: &str, component: char) -> String {
    let mut key = String::with_capacity(group.len() + 1);
    key.push_str(group);
    key.push(component);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_time_is_exclusive() {
        let seg = Segment::new("UW.GNW..BHZ", 10.0, 100.0, vec![0.0; 100]);
        assert!((seg.end_time() - 11.0).abs() < 1e-9);
        assert_eq!(seg.offset_of(10.5), 50);
        assert_eq!(seg.offset_of(9.0), -100);
    }

    #[test]
    fn split_component_keeps_group() {
        assert_eq!(split_component("UW.GNW..BHZ"), ("UW.GNW..BH", Some('Z')));
        assert_eq!(split_component(""), ("", None));
        assert_eq!(component_key("UW.GNW..BH", 'P'), "UW.GNW..BHP");
    }

    #[test]
    fn trim_edges_moves_start_time() {
        let mut seg = Segment::new("A", 0.0, 10.0, (0..10).map(f64::from).collect());
        seg.trim_edges(2, 3);
        assert_eq!(seg.samples, vec![2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!((seg.start_time - 0.2).abs() < 1e-9);
        assert_eq!(seg.fold.len(), 5);
    }

    #[test]
    fn trim_edges_consumes_short_segment() {
        let mut seg = Segment::new("A", 0.0, 10.0, vec![1.0; 4]);
        seg.trim_edges(2, 2);
        assert!(seg.is_empty());
        assert!(seg.fold.is_empty());
    }

    #[test]
    fn split_front_preserves_alignment() {
        let mut seg = Segment::new("A", 1.0, 4.0, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let front = seg.split_front(2);
        assert_eq!(front.samples, vec![0.0, 1.0]);
        assert_eq!(seg.samples, vec![2.0, 3.0, 4.0]);
        assert!((seg.start_time - 1.5).abs() < 1e-9);
        assert!((front.end_time() - seg.start_time).abs() < 1e-9);
    }

    #[test]
    fn normalized_fills_missing_fold() {
        let json = r#"{"key":"UW.GNW..BHZ","start_time":0.0,"sample_rate":100.0,"samples":[1.0,2.0]}"#;
        let seg: Segment = serde_json::from_str(json).unwrap();
        let seg = seg.normalized();
        assert_eq!(seg.fold, vec![1, 1]);
        assert_eq!(seg.nominal_fold(), 1);
    }
}
