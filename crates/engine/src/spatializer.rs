use std::sync::Arc;

use deck_graph::{AudioGraph, GraphError, NodeId};
use futures::future::BoxFuture;

/// Distance attenuation of a spatial source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rolloff {
    #[default]
    Logarithmic,
    Linear,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceOptions {
    pub rolloff: Rolloff,
}

/// A point source inside a [`SpatialScene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpatialSource {
    pub id: u64,
    /// Mono input the source pans
    pub input: NodeId,
}

/// A spatial rendering scene built inside an [`AudioGraph`].
pub trait SpatialScene: Send {
    fn create_source(
        &mut self,
        graph: &mut AudioGraph,
        options: SourceOptions,
    ) -> Result<SpatialSource, GraphError>;

    fn set_position(&mut self, source: &SpatialSource, position: [f32; 3]);

    fn remove_source(&mut self, graph: &mut AudioGraph, source: SpatialSource);

    /// Binaural/stereo render of the scene
    fn output(&self) -> NodeId;

    /// First-order ambisonic render of the scene
    fn ambisonic_output(&self) -> NodeId;

    /// Accepts pre-encoded first-order ambisonic signals for decoding
    fn ambisonic_input(&self) -> NodeId;

    /// Remove every node the scene added to the graph.
    fn disconnect(&mut self, graph: &mut AudioGraph);
}

/// Spatial panning capability.
pub trait Spatializer: Send + Sync {
    fn create_scene(&self, graph: &mut AudioGraph) -> Result<Box<dyn SpatialScene>, GraphError>;
}

/// Deferred access to a [`Spatializer`], fetched the first time a track needs one.
pub trait SpatializerLoader: Send + Sync {
    fn load(&self) -> BoxFuture<'static, Result<Arc<dyn Spatializer>, String>>;
}

pub(crate) enum SpatializerSlot {
    /// No capability injected
    Unavailable,
    Idle(Arc<dyn SpatializerLoader>),
    Loading(BoxFuture<'static, Result<Arc<dyn Spatializer>, String>>),
    Ready(Arc<dyn Spatializer>),
    Failed,
}

impl SpatializerSlot {
    /// Whether spatial routing can ever succeed.
    pub(crate) fn is_available(&self) -> bool {
        !matches!(self, SpatializerSlot::Unavailable | SpatializerSlot::Failed)
    }

    pub(crate) fn is_loading(&self) -> bool {
        matches!(self, SpatializerSlot::Loading(_))
    }
}
