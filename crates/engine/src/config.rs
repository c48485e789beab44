use serde::{Deserialize, Serialize};

/// How the mix leaves the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Stereo,
    /// First-order ambisonic output; non-ambisonic tracks are spatialized
    Ambisonic,
}

impl ChannelMode {
    pub fn channel_count(self) -> u16 {
        match self {
            ChannelMode::Stereo => 2,
            ChannelMode::Ambisonic => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub channel_mode: ChannelMode,
    /// Seconds of audio kept resident ahead of the playhead
    pub lookahead_secs: f64,
    /// Gain changes ramp over this many seconds
    pub fade_secs: f64,
    /// Rendering to a file rather than a device: load everything up front
    pub offline: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_mode: ChannelMode::Stereo,
            lookahead_secs: 10.0,
            fade_secs: 0.001,
            offline: false,
        }
    }
}

impl EngineConfig {
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub fn lookahead(&self) -> f64 {
        if self.offline {
            f64::INFINITY
        } else {
            self.lookahead_secs
        }
    }
}
