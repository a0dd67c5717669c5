//! Items moved between pipeline stages.

use super::{Segment, Trigger, Window};

/// Tagged payload carried by the sequencer's inter-stage queues.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Segment(Segment),
    Window(Window),
    Trigger(Trigger),
    /// Rendered pick message
    Message(String),
}

impl Packet {
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Segment(_) => "segment",
            Packet::Window(_) => "window",
            Packet::Trigger(_) => "trigger",
            Packet::Message(_) => "message",
        }
    }
}

impl From<Segment> for Packet {
    fn from(s: Segment) -> Self {
        Packet::Segment(s)
    }
}

impl From<Window> for Packet {
    fn from(w: Window) -> Self {
        Packet::Window(w)
    }
}

impl From<Trigger> for Packet {
    fn from(t: Trigger) -> Self {
        Packet::Trigger(t)
    }
}
