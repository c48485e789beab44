/// Notifications queued by the engine for its controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineEvent {
    Play,
    Pause,
    Ended,
    TimeUpdate,
    DurationChange,
    LoadedMetadata,
    /// Metadata for some referenced source is no longer available
    Unload,
    CanPlay,
}
