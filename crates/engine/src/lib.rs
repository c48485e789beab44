//! Streaming playback for multi-track projects.
//!
//! [`Engine`] mirrors a [`deck_project::ProjectSnapshot`] into a
//! [`deck_graph::AudioGraph`]: one gain per track and clip, with each clip's
//! audio streamed chunk by chunk from a [`deck_store::ChunkStore`] by a
//! [`ChunkedClip`]. Tracks are routed to the main bus or through a pluggable
//! [`Spatializer`].

mod chunked_clip;
mod config;
mod engine;
mod error;
mod events;
mod mixer;
mod request;
mod spatializer;

pub use chunked_clip::{ChunkedClip, LoadProgress};
pub use config::{ChannelMode, EngineConfig};
pub use engine::Engine;
pub use error::{EngineError, RequestError};
pub use events::EngineEvent;
pub use mixer::{OUTPUT_CHANNEL_MAP, TRACK_CHANNEL_MAP};
pub use request::{Request, Waiters};
pub use spatializer::{
    Rolloff, SourceOptions, SpatialScene, SpatialSource, Spatializer, SpatializerLoader,
};
