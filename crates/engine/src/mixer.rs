use std::sync::Arc;

use deck_graph::{AudioGraph, FoaRouter, GraphError, NodeId};
use deck_project::{ClipData, PanMode, TrackData};
use deck_transport::TrackId;

use crate::ChunkedClip;
use crate::spatializer::{Rolloff, SourceOptions, SpatialScene, SpatialSource};

/// Channel order of ambisonic track content relative to the scene's decoder input.
pub const TRACK_CHANNEL_MAP: [u16; 4] = [0, 3, 1, 2];

/// Channel order of the ambisonic mix relative to the output device.
pub const OUTPUT_CHANNEL_MAP: [u16; 4] = [0, 2, 3, 1];

/// Distance of the mirrored sources used to spatialize plain tracks.
const FORCED_SOURCE_DISTANCE: f32 = 1e10;

/// Where a track's gain node feeds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Main,
    Spatial,
    Ambisonic,
    /// Non-spatial content rendered through the ambisonic path
    Forced,
}

pub(crate) struct Track {
    pub id: TrackId,
    pub gain: NodeId,
    pub data: Arc<TrackData>,
    pub pan_mode: Option<PanMode>,
    spatial_source: Option<SpatialSource>,
    router: Option<FoaRouter>,
    forced: Option<ForcedRoute>,
}

struct ForcedRoute {
    channels: u16,
    splitter: Option<NodeId>,
    sources: Vec<SpatialSource>,
}

pub(crate) struct Clip {
    pub gain: NodeId,
    pub data: Arc<ClipData>,
    pub chunked: Option<ChunkedClip>,
}

impl Clip {
    pub fn new(gain: NodeId, data: Arc<ClipData>) -> Self {
        Self {
            gain,
            data,
            chunked: None,
        }
    }

    pub fn teardown(mut self, graph: &mut AudioGraph) {
        if let Some(mut chunked) = self.chunked.take() {
            chunked.destroy(graph);
        }
        graph.remove(self.gain);
    }
}

impl Track {
    pub fn new(id: TrackId, gain: NodeId, data: Arc<TrackData>) -> Self {
        Self {
            id,
            gain,
            data,
            pan_mode: None,
            spatial_source: None,
            router: None,
            forced: None,
        }
    }

    /// Drop every connection out of the track gain. Spatial sources and
    /// routers stay allocated for reuse.
    pub fn disconnect_routes(&self, graph: &mut AudioGraph, main: NodeId) {
        graph.disconnect(self.gain, main);
        if let Some(source) = &self.spatial_source {
            graph.disconnect(self.gain, source.input);
        }
        if let Some(router) = &self.router {
            graph.disconnect(self.gain, router.input);
        }
        if let Some(forced) = &self.forced {
            match forced.splitter {
                Some(splitter) => graph.disconnect(self.gain, splitter),
                None => {
                    for source in &forced.sources {
                        graph.disconnect(self.gain, source.input);
                    }
                }
            }
        }
    }

    pub fn connect_main(&self, graph: &mut AudioGraph, main: NodeId) -> Result<(), GraphError> {
        graph.connect(self.gain, main)
    }

    /// One point source, created once and moved to the track's position.
    pub fn set_up_spatial(
        &mut self,
        graph: &mut AudioGraph,
        scene: &mut dyn SpatialScene,
    ) -> Result<(), GraphError> {
        let source = match self.spatial_source {
            Some(source) => source,
            None => {
                let source = scene.create_source(graph, SourceOptions::default())?;
                self.spatial_source = Some(source);
                source
            }
        };
        graph.connect(self.gain, source.input)?;
        scene.set_position(&source, self.data.position.unwrap_or([0.0; 3]));
        Ok(())
    }

    /// Pre-encoded first-order ambisonics go straight to the scene's decoder.
    pub fn set_up_ambisonic(
        &mut self,
        graph: &mut AudioGraph,
        scene: &mut dyn SpatialScene,
    ) -> Result<(), GraphError> {
        if self.router.is_none() {
            self.router = Some(FoaRouter::new(graph, TRACK_CHANNEL_MAP)?);
        }
        let Some(router) = &self.router else {
            return Ok(());
        };
        graph.connect(self.gain, router.input)?;
        graph.connect(router.output, scene.ambisonic_input())
    }

    /// Render plain content through the ambisonic path: one source per
    /// channel pushed far left or right, or a mirrored pair for mono.
    pub fn set_up_forced(
        &mut self,
        graph: &mut AudioGraph,
        scene: &mut dyn SpatialScene,
    ) -> Result<(), GraphError> {
        let channels = graph.channel_count(self.gain).unwrap_or(1).max(1);
        if self.forced.as_ref().is_some_and(|f| f.channels != channels) {
            self.remove_forced(graph, scene);
        }

        if self.forced.is_none() {
            let options = SourceOptions {
                rolloff: Rolloff::None,
            };
            let mut route = ForcedRoute {
                channels,
                splitter: None,
                sources: Vec::new(),
            };
            if channels == 1 {
                for _ in 0..2 {
                    route.sources.push(scene.create_source(graph, options)?);
                }
            } else {
                let splitter = graph.create_splitter(channels);
                route.splitter = Some(splitter);
                for channel in 0..channels {
                    let source = scene.create_source(graph, options)?;
                    graph.connect_ports(splitter, channel, source.input, 0)?;
                    route.sources.push(source);
                }
            }
            self.forced = Some(route);
        }

        if let Some(route) = &self.forced {
            match route.splitter {
                Some(splitter) => graph.connect(self.gain, splitter)?,
                None => {
                    for source in &route.sources {
                        graph.connect(self.gain, source.input)?;
                    }
                }
            }
            for (i, source) in route.sources.iter().enumerate() {
                let sign = if i % 2 == 1 { 1.0 } else { -1.0 };
                scene.set_position(source, [FORCED_SOURCE_DISTANCE * sign, 0.0, 0.0]);
            }
        }
        Ok(())
    }

    fn remove_forced(&mut self, graph: &mut AudioGraph, scene: &mut dyn SpatialScene) {
        if let Some(route) = self.forced.take() {
            if let Some(splitter) = route.splitter {
                graph.remove(splitter);
            }
            for source in route.sources {
                scene.remove_source(graph, source);
            }
        }
    }

    /// Remove the track and everything it allocated from the graph.
    pub fn teardown(
        mut self,
        graph: &mut AudioGraph,
        scene: Option<&mut (dyn SpatialScene + 'static)>,
    ) {
        if let Some(router) = self.router.take() {
            router.remove(graph);
        }
        match scene {
            Some(scene) => {
                if let Some(source) = self.spatial_source.take() {
                    scene.remove_source(graph, source);
                }
                self.remove_forced(graph, scene);
            }
            None => {
                if let Some(route) = self.forced.take() {
                    if let Some(splitter) = route.splitter {
                        graph.remove(splitter);
                    }
                }
            }
        }
        graph.remove(self.gain);
    }
}
