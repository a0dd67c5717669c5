//! Pipeline Regression Tests
//!
//! Runs seeded synthetic three-component data through the full stage
//! sequence and asserts that triggers land on the injected arrivals, that
//! noise alone never triggers, and that the async loop delivers one pick
//! message per trigger.

use pulse_rt::buffer::Buffer;
use pulse_rt::config::PulseConfig;
use pulse_rt::inference::InferenceEngine;
use pulse_rt::pipeline::source::{SegmentSource, SourceEvent, SyntheticSource};
use pulse_rt::pipeline::{
    build_sequencer, BufferStage, InferenceStage, LoopConfig, ProcessingLoop, Sequencer, SlotConfig,
    TriggerStage, WindowStage,
};
use pulse_rt::sink::MemorySink;
use pulse_rt::synthetic::{SyntheticConfig, WaveformGenerator};
use pulse_rt::trigger::TriggerDetector;
use pulse_rt::types::{Packet, Trigger};
use pulse_rt::windower::Windower;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const GROUPS: [&str; 2] = ["UW.GNW..BH", "UW.RATT..BH"];

/// 30 s windows every 15 s, 2.5 s blinding, a trigger level noise cannot reach.
fn test_config() -> PulseConfig {
    PulseConfig::from_toml_str(
        r#"
[sequence]
pulse_interval_ms = 1
max_pulse_size = 256
max_output_size = 10000

[window]
reference_npts = 3000
reference_overlap = 1500

[inference]
worker_threads = 2

[stack]
max_length = 120.0
blinding = 250

[trigger]
trigger_level = 0.5
"#,
    )
    .unwrap()
}

fn synthetic(seed: u64) -> SyntheticConfig {
    SyntheticConfig {
        groups: GROUPS.iter().map(|g| (*g).to_string()).collect(),
        duration_seconds: 300.0,
        seed: Some(seed),
        ..SyntheticConfig::default()
    }
}

fn generous_slot() -> SlotConfig {
    SlotConfig {
        max_pulse_size: 256,
        max_output_size: 10_000,
        ..SlotConfig::default()
    }
}

/// Every stage up to triggering, so triggers come out as packets.
fn trigger_sequencer(config: &PulseConfig) -> Sequencer {
    let engine = InferenceEngine::new(config.inference.build_model(), config.inference.worker_threads).unwrap();
    Sequencer::new()
        .with_stage(
            Box::new(WindowStage::new(Windower::new(config.window.clone()), 256)),
            generous_slot(),
        )
        .with_stage(Box::new(InferenceStage::new(engine, 1, 32)), generous_slot())
        .with_stage(
            Box::new(BufferStage::new("stack", Buffer::new(config.stack.clone()))),
            generous_slot(),
        )
        .with_stage(
            Box::new(TriggerStage::new(TriggerDetector::new(config.trigger.clone()))),
            generous_slot(),
        )
}

fn collect_triggers(packets: Vec<Packet>, into: &mut Vec<Trigger>) {
    into.extend(packets.into_iter().filter_map(|p| match p {
        Packet::Trigger(t) => Some(t),
        _ => None,
    }));
}

/// Drive the sequencer with one pulse per generated chunk.
fn run_to_triggers(config: &PulseConfig, generator: &mut WaveformGenerator) -> (Vec<Trigger>, Sequencer) {
    let mut sequencer = trigger_sequencer(config);
    let mut triggers = Vec::new();
    while let Some(chunk) = generator.next_chunk() {
        let out = sequencer.pulse(chunk.into_iter().map(Packet::Segment).collect());
        collect_triggers(out, &mut triggers);
    }
    collect_triggers(sequencer.flush(), &mut triggers);
    (triggers, sequencer)
}

fn triggers_for<'a>(triggers: &'a [Trigger], group: &str, label: char) -> Vec<&'a Trigger> {
    triggers
        .iter()
        .filter(|t| t.group_key.strip_suffix(label) == Some(group))
        .collect()
}

#[test]
fn p_triggers_land_on_injected_arrivals() {
    let config = test_config();
    let mut generator = WaveformGenerator::new(synthetic(11)).unwrap();
    let arrivals: Vec<Vec<f64>> = (0..GROUPS.len()).map(|i| generator.arrivals(i)).collect();
    let (triggers, _) = run_to_triggers(&config, &mut generator);

    for (group, times) in GROUPS.iter().zip(&arrivals) {
        assert_eq!(times.len(), 2, "two events inside 300 s");
        let picks = triggers_for(&triggers, group, 'P');
        for tp in times {
            assert!(
                picks.iter().any(|t| t.pick_time >= tp - 0.5 && t.pick_time <= tp + 3.0),
                "{group}: no P pick near {tp}, got {:?}",
                picks.iter().map(|t| t.pick_time).collect::<Vec<_>>()
            );
        }
    }
}

#[test]
fn s_triggers_follow_p_by_the_injected_delay() {
    let config = test_config();
    let mut generator = WaveformGenerator::new(synthetic(23)).unwrap();
    let delay = generator.config().s_delay;
    let arrivals: Vec<Vec<f64>> = (0..GROUPS.len()).map(|i| generator.arrivals(i)).collect();
    let (triggers, _) = run_to_triggers(&config, &mut generator);

    for (group, times) in GROUPS.iter().zip(&arrivals) {
        let picks = triggers_for(&triggers, group, 'S');
        for tp in times {
            let ts = tp + delay;
            assert!(
                picks.iter().any(|t| t.pick_time >= ts - 0.5 && t.pick_time <= ts + 3.0),
                "{group}: no S pick near {ts}"
            );
        }
    }
}

#[test]
fn noise_never_triggers() {
    let config = test_config();
    let mut generator = WaveformGenerator::new(synthetic(5)).unwrap();
    let arrivals: Vec<Vec<f64>> = (0..GROUPS.len()).map(|i| generator.arrivals(i)).collect();
    let (triggers, _) = run_to_triggers(&config, &mut generator);

    assert!(!triggers.is_empty());
    for trigger in &triggers {
        let group_index = GROUPS
            .iter()
            .position(|g| trigger.group_key.starts_with(g))
            .unwrap();
        assert!(
            arrivals[group_index]
                .iter()
                .any(|tp| trigger.onset_time >= tp - 1.0 && trigger.onset_time <= tp + 30.0),
            "trigger at {} on {} is not near any event",
            trigger.onset_time,
            trigger.group_key
        );
    }
}

#[test]
fn emitted_triggers_respect_fold_and_ordering() {
    let config = test_config();
    let mut generator = WaveformGenerator::new(synthetic(11)).unwrap();
    let (triggers, sequencer) = run_to_triggers(&config, &mut generator);

    for trigger in &triggers {
        assert!(trigger.fold_at_peak >= config.trigger.fold_threshold);
        assert!(trigger.peak_value >= config.trigger.trigger_level);
        assert!(trigger.onset_time <= trigger.peak_time && trigger.peak_time < trigger.offset_time);
    }
    // Runs on one key never overlap
    for group in GROUPS {
        for label in ['P', 'S'] {
            let runs = triggers_for(&triggers, group, label);
            for pair in runs.windows(2) {
                assert!(pair[0].offset_time <= pair[1].onset_time);
            }
        }
    }

    let stats = sequencer.stats();
    assert_eq!(stats.stages.len(), 4);
    assert!(stats.stages.iter().all(|s| s.slot.failures == 0 && s.slot.backpressure_drops == 0));
    // 300 s of data in 30 s windows stepping by 15 s: t0 = 0, 15, ..., 270
    assert_eq!(stats.stages[0].counters["windows_cut"], 2 * 19);
}

#[test]
fn stack_retention_of_one_window_loses_nothing() {
    let wide = test_config();
    let mut narrow = test_config();
    narrow.stack.max_length = narrow.window.window_seconds();
    assert!(narrow.validate().is_ok());

    let (mut expected, _) = run_to_triggers(&wide, &mut WaveformGenerator::new(synthetic(11)).unwrap());
    let (mut triggers, sequencer) = run_to_triggers(&narrow, &mut WaveformGenerator::new(synthetic(11)).unwrap());
    // Drain chunking differs between the runs, so compare per key in time order
    let by_key = |a: &Trigger, b: &Trigger| {
        a.group_key
            .cmp(&b.group_key)
            .then(a.pick_time.total_cmp(&b.pick_time))
    };
    expected.sort_by(by_key);
    triggers.sort_by(by_key);

    assert!(!expected.is_empty());
    assert_eq!(triggers.len(), expected.len());
    for (got, want) in triggers.iter().zip(&expected) {
        assert_eq!(got.group_key, want.group_key);
        assert!((got.pick_time - want.pick_time).abs() < 1e-6);
        assert_eq!(got.fold_at_peak, want.fold_at_peak);
    }

    let stats = sequencer.stats();
    let stack = &stats.stages[2];
    assert_eq!(stack.name, "stack");
    assert!(stack.counters["expired"] > 0);
    assert_eq!(stack.counters["evicted"], 0);
}

#[test]
fn synthetic_source_streams_all_components() {
    let mut source = SyntheticSource::new(synthetic(3), 0.0).unwrap();
    let mut segments = 0;
    while let SourceEvent::Segment(segment) = tokio_test::block_on(source.next_segment()).unwrap() {
        assert_eq!(segment.len(), 200);
        segments += 1;
    }
    // 150 chunks of 2 s, three components per group
    assert_eq!(segments, 150 * 3 * GROUPS.len());
}

#[tokio::test]
async fn processing_loop_delivers_one_message_per_trigger() {
    let config = test_config();
    let sequencer = build_sequencer(&config).unwrap();
    let sink = MemorySink::new();
    let loop_config = LoopConfig {
        pulse_interval: Duration::from_millis(1),
        ..config.loop_config()
    };
    let source = SyntheticSource::new(synthetic(11), 0.0).unwrap();
    let summary = ProcessingLoop::new(sequencer, sink.clone(), loop_config, CancellationToken::new())
        .run(source)
        .await;

    let messages = sink.messages();
    assert!(!summary.cancelled);
    assert_eq!(summary.segments_received, 900);
    assert_eq!(summary.messages_sent as usize, messages.len());
    assert!(messages.len() >= 8, "2 groups x 2 events x (P + S), got {}", messages.len());

    let triggers = summary
        .sequence
        .stages
        .iter()
        .find(|s| s.name == "trigger")
        .map(|s| s.counters["triggers"])
        .unwrap();
    assert_eq!(triggers as usize, messages.len());

    assert!(messages.iter().any(|m| m.contains(" GNW  UWBHZ ?")));
    assert!(messages.iter().any(|m| m.contains(" RATT UWBHZ ?")));
    for (i, line) in messages.iter().enumerate() {
        assert!(line.starts_with(" 10123  1"), "{line}");
        assert!(line.contains(&format!(" {i:4} ")), "sequence number in {line}");
        assert!(line.ends_with("       0       0       0"));
    }
}
