#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use deck_engine::{
    Engine, EngineConfig, SourceOptions, SpatialScene, SpatialSource, Spatializer,
    SpatializerLoader,
};
use deck_graph::{AudioGraph, GraphError, ManualClock, NodeId};
use deck_project::{ClipData, ClipSource, ProjectSnapshot};
use deck_store::MemoryChunkStore;
use deck_transport::{ClipId, Source, SourceId, TrackId};
use parking_lot::Mutex;

pub const RATE: u32 = 100;

/// Positions set on every spatial source, keyed by source id.
pub type Positions = Arc<Mutex<HashMap<u64, [f32; 3]>>>;

/// Spatializer that builds plain gain nodes and records source positions.
#[derive(Default)]
pub struct FakeSpatializer {
    pub positions: Positions,
    pub scenes: Arc<Mutex<usize>>,
}

impl Spatializer for FakeSpatializer {
    fn create_scene(&self, graph: &mut AudioGraph) -> Result<Box<dyn SpatialScene>, GraphError> {
        *self.scenes.lock() += 1;

        let output = graph.create_gain(1.0);
        graph.set_channel_count(output, Some(2))?;
        let ambisonic_output = graph.create_gain(1.0);
        graph.set_channel_count(ambisonic_output, Some(4))?;
        let ambisonic_input = graph.create_gain(1.0);
        graph.set_channel_count(ambisonic_input, Some(4))?;
        graph.connect(ambisonic_input, ambisonic_output)?;

        Ok(Box::new(FakeScene {
            output,
            ambisonic_output,
            ambisonic_input,
            sources: Vec::new(),
            next_id: 0,
            positions: self.positions.clone(),
        }))
    }
}

pub struct FakeScene {
    output: NodeId,
    ambisonic_output: NodeId,
    ambisonic_input: NodeId,
    sources: Vec<NodeId>,
    next_id: u64,
    positions: Positions,
}

impl SpatialScene for FakeScene {
    fn create_source(
        &mut self,
        graph: &mut AudioGraph,
        _options: SourceOptions,
    ) -> Result<SpatialSource, GraphError> {
        let input = graph.create_gain(1.0);
        graph.set_channel_count(input, Some(1))?;
        graph.connect(input, self.output)?;
        graph.connect(input, self.ambisonic_output)?;
        self.sources.push(input);
        self.next_id += 1;
        Ok(SpatialSource {
            id: self.next_id,
            input,
        })
    }

    fn set_position(&mut self, source: &SpatialSource, position: [f32; 3]) {
        self.positions.lock().insert(source.id, position);
    }

    fn remove_source(&mut self, graph: &mut AudioGraph, source: SpatialSource) {
        self.positions.lock().remove(&source.id);
        self.sources.retain(|node| *node != source.input);
        graph.remove(source.input);
    }

    fn output(&self) -> NodeId {
        self.output
    }

    fn ambisonic_output(&self) -> NodeId {
        self.ambisonic_output
    }

    fn ambisonic_input(&self) -> NodeId {
        self.ambisonic_input
    }

    fn disconnect(&mut self, graph: &mut AudioGraph) {
        for node in self.sources.drain(..) {
            graph.remove(node);
        }
        graph.remove(self.output);
        graph.remove(self.ambisonic_output);
        graph.remove(self.ambisonic_input);
    }
}

pub struct Harness {
    pub clock: ManualClock,
    pub store: MemoryChunkStore,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default(), 2)
    }

    pub fn with_config(config: EngineConfig, channels: u16) -> Self {
        let clock = ManualClock::new();
        let store = MemoryChunkStore::new();
        let graph = AudioGraph::new(Arc::new(clock.clone()), RATE, channels);
        let engine = Engine::new(graph, Arc::new(store.clone()), config).unwrap();
        Self {
            clock,
            store,
            engine,
        }
    }

    pub fn with_spatializer(self, spatializer: Arc<dyn Spatializer>) -> Self {
        let Harness {
            clock,
            store,
            engine,
        } = self;
        Self {
            clock,
            store,
            engine: engine.with_spatializer(spatializer),
        }
    }

    pub fn with_spatializer_loader(self, loader: Arc<dyn SpatializerLoader>) -> Self {
        let Harness {
            clock,
            store,
            engine,
        } = self;
        Self {
            clock,
            store,
            engine: engine.with_spatializer_loader(loader),
        }
    }

    /// Register a source of `seconds` one-second chunks, each channel filled with `value`.
    pub fn add_source(&self, id: &str, seconds: usize, channels: u16, value: f32) {
        let id = SourceId::new(id);
        let source =
            Source::from_chunk_lengths(id.clone(), RATE, channels, &vec![RATE as usize; seconds])
                .unwrap();
        for chunk in 0..seconds {
            for channel in 0..channels as usize {
                self.store
                    .insert_samples(&id, chunk, channel, &vec![value; RATE as usize]);
            }
        }
        self.store.insert_source(source);
    }

    /// Pump until no loads remain.
    pub fn settle(&mut self) {
        for _ in 0..100 {
            if self.engine.pump() {
                return;
            }
        }
        panic!("engine did not settle");
    }

    /// Advance the clock to `time` and let the engine react.
    pub fn advance_to(&mut self, time: f64) {
        self.clock.set(time);
        self.engine.pump();
        self.engine.tick();
    }
}

pub fn clip(id: u64, track: u64, source: &str, channels: u16, start: f64, duration: f64) -> ClipData {
    ClipData {
        id: ClipId(id),
        track: TrackId(track),
        start,
        duration,
        offset: 0.0,
        gain: 1.0,
        enabled: true,
        source: ClipSource {
            id: SourceId::new(source),
            channels: Some(channels),
            duration,
        },
    }
}

pub fn project(clips: impl IntoIterator<Item = ClipData>) -> Arc<ProjectSnapshot> {
    Arc::new(
        clips
            .into_iter()
            .fold(ProjectSnapshot::new(), |project, clip| project.with_clip(clip)),
    )
}
