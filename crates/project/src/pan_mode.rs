use serde::{Deserialize, Serialize};

use crate::{ProjectSnapshot, TrackData};

/// How a track's signal reaches the main output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanMode {
    Stereo,
    Spatial,
    Ambisonic,
}

impl PanMode {
    /// Channel count the track gain is forced to for this mode.
    pub fn channel_count(self) -> u16 {
        match self {
            PanMode::Stereo => 2,
            PanMode::Spatial => 1,
            PanMode::Ambisonic => 4,
        }
    }
}

/// Resolve a track's routing mode.
///
/// Muted tracks and tracks without enabled clips have no mode. An explicit
/// mode wins; otherwise the widest clip decides: mono is spatialized,
/// four channels are treated as first-order ambisonics, anything else is stereo.
/// Clips with an unknown channel count are assumed stereo.
pub fn track_pan_mode(track: &TrackData, project: &ProjectSnapshot) -> Option<PanMode> {
    if track.mute {
        return None;
    }

    let channels = track
        .clips
        .iter()
        .filter_map(|id| project.clips.get(id))
        .filter(|clip| clip.enabled)
        .map(|clip| clip.source.channels.unwrap_or(2))
        .max()?;

    if let Some(mode) = track.mode {
        return Some(mode);
    }

    Some(match channels {
        1 => PanMode::Spatial,
        4 => PanMode::Ambisonic,
        _ => PanMode::Stereo,
    })
}
