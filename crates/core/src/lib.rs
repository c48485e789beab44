pub mod config;
pub mod offline;
pub mod session;

pub use config::Config;
pub use offline::render_offline;
pub use session::{PlaybackState, Session};

pub use deck_engine::{ChannelMode, Engine, EngineConfig, EngineEvent, RequestError};
pub use deck_project::{ClipData, PanMode, ProjectError, ProjectSnapshot, ProjectStore, TrackData};
pub use deck_store::{ChunkStore, MemoryChunkStore, StoreError};
pub use deck_transport::{AudioBuffer, ClipId, Source, SourceId, TrackId};
