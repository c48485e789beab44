mod pan_mode;
mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use deck_transport::{ClipId, SourceId, TrackId};
use serde::{Deserialize, Serialize};

pub use pan_mode::{PanMode, track_pan_mode};
pub use store::ProjectStore;

fn unity() -> f32 {
    1.0
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackData {
    pub id: TrackId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub solo: bool,
    #[serde(default = "unity")]
    pub gain: f32,
    /// Explicit routing; inferred from the clips' channel counts when absent
    #[serde(default)]
    pub mode: Option<PanMode>,
    /// Position of the track's point source for spatial routing
    #[serde(default)]
    pub position: Option<[f32; 3]>,
    #[serde(default)]
    pub clips: Vec<ClipId>,
}

impl TrackData {
    pub fn new(id: TrackId) -> Self {
        Self {
            id,
            name: String::new(),
            mute: false,
            solo: false,
            gain: 1.0,
            mode: None,
            position: None,
            clips: Vec::new(),
        }
    }
}

/// What a clip knows about the source it plays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSource {
    pub id: SourceId,
    #[serde(default)]
    pub channels: Option<u16>,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipData {
    pub id: ClipId,
    pub track: TrackId,
    /// Timeline position in seconds
    pub start: f64,
    /// Length on the timeline in seconds
    pub duration: f64,
    /// Trim: where in the source playback begins, in seconds
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "unity")]
    pub gain: f32,
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub source: ClipSource,
}

impl ClipData {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Whether playback-relevant placement differs from `other`.
    pub fn timing_differs(&self, other: &ClipData) -> bool {
        self.start != other.start
            || self.duration != other.duration
            || self.offset != other.offset
            || self.enabled != other.enabled
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("clip {clip} references missing track {track}")]
    MissingTrack { clip: ClipId, track: TrackId },
}

/// Immutable view of the project's audio-relevant structure.
///
/// Snapshots are shared as `Arc<ProjectSnapshot>`; edits produce a new snapshot
/// that reuses every unchanged track and clip `Arc`, so pointer identity is the
/// change signal for consumers diffing successive snapshots.
#[derive(Debug, Clone, Default)]
pub struct ProjectSnapshot {
    pub tracks: BTreeMap<TrackId, Arc<TrackData>>,
    pub clips: BTreeMap<ClipId, Arc<ClipData>>,
    pub track_order: Vec<TrackId>,
    /// Content duration over enabled clips
    pub duration: f64,
}

#[derive(Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    tracks: Vec<TrackData>,
    #[serde(default)]
    clips: Vec<ClipData>,
    #[serde(default)]
    track_order: Option<Vec<TrackId>>,
}

impl ProjectSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ProjectError> {
        let file: SnapshotFile = serde_json::from_str(json)?;

        let mut snapshot = Self::new();
        for track in file.tracks {
            snapshot = snapshot.with_track(track);
        }
        for clip in file.clips {
            if !snapshot.tracks.contains_key(&clip.track) {
                return Err(ProjectError::MissingTrack {
                    clip: clip.id,
                    track: clip.track,
                });
            }
            snapshot = snapshot.with_clip(clip);
        }
        if let Some(order) = file.track_order {
            snapshot.track_order = order;
        }
        Ok(snapshot)
    }

    pub fn track(&self, id: TrackId) -> Option<&Arc<TrackData>> {
        self.tracks.get(&id)
    }

    pub fn clip(&self, id: ClipId) -> Option<&Arc<ClipData>> {
        self.clips.get(&id)
    }

    /// Insert or replace a track, keeping its existing clip list when the new
    /// data doesn't name any clips.
    pub fn with_track(mut self, mut track: TrackData) -> Self {
        if let Some(existing) = self.tracks.get(&track.id) {
            if track.clips.is_empty() {
                track.clips = existing.clips.clone();
            }
        } else {
            self.track_order.push(track.id);
        }
        self.tracks.insert(track.id, Arc::new(track));
        self
    }

    /// Insert or replace a clip, registering it with its track.
    pub fn with_clip(mut self, clip: ClipData) -> Self {
        if let Some(previous) = self.clips.get(&clip.id).cloned() {
            if previous.track != clip.track {
                self.detach_clip(previous.track, clip.id);
            }
        }

        let track = self
            .tracks
            .get(&clip.track)
            .map(|t| TrackData::clone(t))
            .unwrap_or_else(|| {
                self.track_order.push(clip.track);
                TrackData::new(clip.track)
            });
        if !track.clips.contains(&clip.id) {
            let mut track = track;
            track.clips.push(clip.id);
            self.tracks.insert(track.id, Arc::new(track));
        } else if !self.tracks.contains_key(&track.id) {
            self.tracks.insert(track.id, Arc::new(track));
        }

        self.clips.insert(clip.id, Arc::new(clip));
        self.duration = project_duration(&self, false);
        self
    }

    pub fn with_track_updated(self, id: TrackId, edit: impl FnOnce(&mut TrackData)) -> Self {
        match self.tracks.get(&id) {
            Some(track) => {
                let mut track = TrackData::clone(track);
                edit(&mut track);
                let mut next = self;
                next.tracks.insert(id, Arc::new(track));
                next
            }
            None => self,
        }
    }

    pub fn with_clip_updated(self, id: ClipId, edit: impl FnOnce(&mut ClipData)) -> Self {
        match self.clips.get(&id) {
            Some(clip) => {
                let mut clip = ClipData::clone(clip);
                edit(&mut clip);
                self.with_clip(clip)
            }
            None => self,
        }
    }

    pub fn without_clip(mut self, id: ClipId) -> Self {
        if let Some(clip) = self.clips.remove(&id) {
            self.detach_clip(clip.track, id);
            self.duration = project_duration(&self, false);
        }
        self
    }

    pub fn without_track(mut self, id: TrackId) -> Self {
        if let Some(track) = self.tracks.remove(&id) {
            for clip in &track.clips {
                self.clips.remove(clip);
            }
            self.track_order.retain(|t| *t != id);
            self.duration = project_duration(&self, false);
        }
        self
    }

    fn detach_clip(&mut self, track_id: TrackId, clip_id: ClipId) {
        if let Some(track) = self.tracks.get(&track_id) {
            let mut track = TrackData::clone(track);
            track.clips.retain(|c| *c != clip_id);
            self.tracks.insert(track_id, Arc::new(track));
        }
    }
}

/// Latest end time over the project's clips.
pub fn project_duration(project: &ProjectSnapshot, include_disabled: bool) -> f64 {
    project
        .clips
        .values()
        .filter(|clip| clip.enabled || include_disabled)
        .map(|clip| clip.end())
        .fold(0.0, f64::max)
}
