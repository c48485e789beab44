use std::sync::Arc;

use deck_transport::ChunkBuffer;

use crate::AudioParam;

/// One-shot playback window of a source node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Graph time at which output begins
    pub start: f64,
    /// Position in the buffer that plays at `start`
    pub offset: f64,
    pub duration: f64,
}

impl Schedule {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end()
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Destination {
        channels: u16,
    },
    Gain {
        gain: AudioParam,
        /// Forced input channel count; follows the widest input when unset
        channels: Option<u16>,
    },
    BufferSource {
        buffer: Arc<ChunkBuffer>,
        schedule: Option<Schedule>,
    },
    /// Emits a constant value while scheduled. Used as a timer.
    ConstantSource {
        value: f32,
        schedule: Option<Schedule>,
    },
    Splitter {
        outputs: u16,
    },
    Merger {
        inputs: u16,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self { kind }
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        match &self.kind {
            NodeKind::BufferSource { schedule, .. } | NodeKind::ConstantSource { schedule, .. } => {
                schedule.as_ref()
            }
            _ => None,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::BufferSource { .. } | NodeKind::ConstantSource { .. }
        )
    }

    pub(crate) fn output_ports(&self) -> u16 {
        match self.kind {
            NodeKind::Splitter { outputs } => outputs,
            _ => 1,
        }
    }

    pub(crate) fn input_ports(&self) -> u16 {
        match self.kind {
            NodeKind::Merger { inputs } => inputs,
            NodeKind::BufferSource { .. } | NodeKind::ConstantSource { .. } => 0,
            _ => 1,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self.kind {
            NodeKind::Destination { .. } => "destination",
            NodeKind::Gain { .. } => "gain",
            NodeKind::BufferSource { .. } => "buffer source",
            NodeKind::ConstantSource { .. } => "constant source",
            NodeKind::Splitter { .. } => "splitter",
            NodeKind::Merger { .. } => "merger",
        }
    }
}
