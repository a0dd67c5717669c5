//! Shared data structures for the streaming detection pipeline
//!
//! - Segment: time-stamped sample runs with per-sample fold (raw and stacked data)
//! - Window: reference-aligned analysis frames cut by the windower
//! - Trigger: finalized threshold-crossing detections
//! - Packet: the tagged payload moved between sequencer stages

mod segment;
mod window;
mod trigger;
mod packet;

pub use segment::*;
pub use window::*;
pub use trigger::*;
pub use packet::*;
