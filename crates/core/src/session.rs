use std::path::Path;
use std::sync::Arc;

use deck_device::DeviceOutput;
use deck_engine::{Engine, EngineEvent, Request, SpatializerLoader};
use deck_graph::AudioGraph;
use deck_project::{ProjectSnapshot, ProjectStore};
use deck_store::ChunkStore;

use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Paused,
    /// Wants to play, but some audio isn't loaded yet
    Waiting,
    Playing,
    Ended,
}

impl PlaybackState {
    pub fn of(engine: &Engine) -> Self {
        if engine.paused() {
            if engine.current_time() >= engine.duration() {
                PlaybackState::Ended
            } else {
                PlaybackState::Paused
            }
        } else if engine.waiting() {
            PlaybackState::Waiting
        } else {
            PlaybackState::Playing
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Waiting)
    }
}

/// An engine playing to the default output device, fed from a project store.
pub struct Session {
    engine: Engine,
    output: DeviceOutput,
    projects: ProjectStore,
}

impl Session {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        config: &Config,
        spatializer: Option<Arc<dyn SpatializerLoader>>,
    ) -> anyhow::Result<Self> {
        let output = deck_device::start()?;
        let graph = AudioGraph::new(
            Arc::new(output.clock().clone()),
            output.sample_rate(),
            output.channels(),
        );

        let mut engine = Engine::new(graph, store, config.engine.clone())?;
        if let Some(loader) = spatializer {
            engine = engine.with_spatializer_loader(loader);
        }
        engine.set_volume(config.volume)?;

        let mut projects = ProjectStore::new();
        engine.subscribe(projects.subscribe());

        Ok(Self {
            engine,
            output,
            projects,
        })
    }

    pub fn from_project(
        path: &Path,
        store: Arc<dyn ChunkStore>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let mut session = Self::new(store, config, None)?;
        session.load_project(path)?;
        Ok(session)
    }

    pub fn load_project(&mut self, path: &Path) -> anyhow::Result<()> {
        let json = std::fs::read_to_string(path)?;
        self.set_project(ProjectSnapshot::from_json(&json)?);
        Ok(())
    }

    /// Publish a new snapshot; the engine picks it up on the next poll.
    pub fn set_project(&mut self, project: ProjectSnapshot) -> Arc<ProjectSnapshot> {
        self.projects.publish(project)
    }

    pub fn update_project(
        &mut self,
        edit: impl FnOnce(ProjectSnapshot) -> ProjectSnapshot,
    ) -> Arc<ProjectSnapshot> {
        self.projects.update(edit)
    }

    pub fn project(&self) -> Option<&Arc<ProjectSnapshot>> {
        self.projects.current()
    }

    pub fn play(&mut self) -> Request {
        self.engine.play()
    }

    pub fn pause(&mut self) {
        self.engine.pause();
    }

    pub fn stop(&mut self) {
        self.engine.pause();
        self.engine.set_current_time(0.0);
    }

    pub fn seek(&mut self, seconds: f64) {
        self.engine.set_current_time(seconds);
    }

    pub fn set_volume(&mut self, volume: f64) -> anyhow::Result<()> {
        self.engine.set_volume(volume)?;
        Ok(())
    }

    /// Drive the engine and hand the current graph to the device.
    /// Call regularly (e.g. once per UI frame); returns the events since the last poll.
    pub fn poll(&mut self) -> Vec<EngineEvent> {
        self.engine.pump();
        self.engine.tick();
        self.output.publish(self.engine.graph());
        self.output.collect();
        self.engine.drain_events()
    }

    pub fn current_time(&self) -> f64 {
        self.engine.current_time()
    }

    pub fn duration(&self) -> f64 {
        self.engine.duration()
    }

    pub fn playback_state(&self) -> PlaybackState {
        PlaybackState::of(&self.engine)
    }

    pub fn is_playing(&self) -> bool {
        self.playback_state().is_playing()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.engine.destroy();
    }
}
