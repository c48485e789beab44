use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::task::{Context, Poll};

use deck_graph::{AudioGraph, FoaRouter, NodeId};
use deck_project::{PanMode, ProjectSnapshot, TrackData, track_pan_mode};
use deck_store::{ChunkStore, StoreError};
use deck_transport::{ClipId, Source, SourceId, TrackId};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::task::noop_waker_ref;
use futures::{FutureExt, StreamExt};

use crate::mixer::{Clip, OUTPUT_CHANNEL_MAP, Route, Track};
use crate::spatializer::{SpatialScene, Spatializer, SpatializerLoader, SpatializerSlot};
use crate::{
    ChannelMode, ChunkedClip, EngineConfig, EngineError, EngineEvent, LoadProgress, Request,
    RequestError, Waiters,
};

type MetadataLoad = BoxFuture<'static, (SourceId, Result<Source, StoreError>)>;

enum SourceState {
    Loading,
    Ready(Arc<Source>),
    Failed,
}

/// Plays a project: mirrors its tracks and clips into the audio graph, streams
/// clip audio through [`ChunkedClip`]s and runs the play/pause/seek state machine.
///
/// The engine is driven from one thread. Async work (metadata, chunks, the
/// spatializer) completes inside [`Engine::pump`] / [`Engine::poll_pump`];
/// clock-driven work happens in [`Engine::tick`].
pub struct Engine {
    graph: AudioGraph,
    store: Arc<dyn ChunkStore>,
    config: EngineConfig,
    main_gain: NodeId,
    output_router: Option<FoaRouter>,

    project: Option<Arc<ProjectSnapshot>>,
    subscription: Option<mpsc::UnboundedReceiver<Arc<ProjectSnapshot>>>,
    tracks: BTreeMap<TrackId, Track>,
    clips: BTreeMap<ClipId, Clip>,
    spatial_tracks: BTreeSet<TrackId>,
    ambisonic_tracks: BTreeSet<TrackId>,
    forced_tracks: BTreeSet<TrackId>,

    sources: HashMap<SourceId, SourceState>,
    metadata_loads: FuturesUnordered<MetadataLoad>,
    spatializer: SpatializerSlot,
    scene: Option<Box<dyn SpatialScene>>,

    play_waiters: Waiters,
    start_requests: FuturesUnordered<Request>,
    events: VecDeque<EngineEvent>,

    volume: f64,
    duration: f64,
    content_duration: f64,
    max_duration: f64,
    has_metadata: bool,
    can_play: bool,
    paused: bool,
    ended: bool,
    play_start_time: f64,
    pause_time: f64,
    play_start_offset: f64,
    timer: Option<NodeId>,
    destroyed: bool,
}

impl Engine {
    pub fn new(
        mut graph: AudioGraph,
        store: Arc<dyn ChunkStore>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let main_gain = graph.create_gain(1.0);
        graph.set_channel_count(main_gain, Some(config.channel_mode.channel_count()))?;

        let output_router = match config.channel_mode {
            ChannelMode::Ambisonic => {
                let router = FoaRouter::new(&mut graph, OUTPUT_CHANNEL_MAP)?;
                graph.connect(main_gain, router.input)?;
                graph.connect(router.output, graph.destination())?;
                Some(router)
            }
            ChannelMode::Stereo => {
                graph.connect(main_gain, graph.destination())?;
                None
            }
        };

        Ok(Self {
            graph,
            store,
            config,
            main_gain,
            output_router,
            project: None,
            subscription: None,
            tracks: BTreeMap::new(),
            clips: BTreeMap::new(),
            spatial_tracks: BTreeSet::new(),
            ambisonic_tracks: BTreeSet::new(),
            forced_tracks: BTreeSet::new(),
            sources: HashMap::new(),
            metadata_loads: FuturesUnordered::new(),
            spatializer: SpatializerSlot::Unavailable,
            scene: None,
            play_waiters: Waiters::new(),
            start_requests: FuturesUnordered::new(),
            events: VecDeque::new(),
            volume: 1.0,
            duration: f64::NAN,
            content_duration: f64::NAN,
            max_duration: f64::INFINITY,
            has_metadata: false,
            can_play: false,
            paused: true,
            ended: true,
            play_start_time: f64::INFINITY,
            pause_time: 0.0,
            play_start_offset: 0.0,
            timer: None,
            destroyed: false,
        })
    }

    /// Use a spatializer that is available right away.
    pub fn with_spatializer(mut self, spatializer: Arc<dyn Spatializer>) -> Self {
        self.spatializer = SpatializerSlot::Ready(spatializer);
        self
    }

    /// Fetch the spatializer the first time a track needs spatial routing.
    pub fn with_spatializer_loader(mut self, loader: Arc<dyn SpatializerLoader>) -> Self {
        self.spatializer = SpatializerSlot::Idle(loader);
        self
    }

    /// Follow a stream of project snapshots; the newest pending one is applied on each pump.
    pub fn subscribe(&mut self, snapshots: mpsc::UnboundedReceiver<Arc<ProjectSnapshot>>) {
        self.subscription = Some(snapshots);
    }

    pub fn graph(&self) -> &AudioGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn project(&self) -> Option<&Arc<ProjectSnapshot>> {
        self.project.as_ref()
    }

    pub fn main_gain(&self) -> NodeId {
        self.main_gain
    }

    pub fn track_gain(&self, id: TrackId) -> Option<NodeId> {
        self.tracks.get(&id).map(|track| track.gain)
    }

    pub fn clip_gain(&self, id: ClipId) -> Option<NodeId> {
        self.clips.get(&id).map(|clip| clip.gain)
    }

    pub fn track_pan_mode(&self, id: TrackId) -> Option<PanMode> {
        self.tracks.get(&id).and_then(|track| track.pan_mode)
    }

    pub fn chunked_clip(&self, id: ClipId) -> Option<&ChunkedClip> {
        self.clips.get(&id).and_then(|clip| clip.chunked.as_ref())
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn content_duration(&self) -> f64 {
        self.content_duration
    }

    pub fn max_duration(&self) -> f64 {
        self.max_duration
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn can_play(&self) -> bool {
        self.can_play
    }

    pub fn has_metadata(&self) -> bool {
        self.has_metadata
    }

    /// Wants to play but nothing is audible yet.
    pub fn waiting(&self) -> bool {
        !self.paused && self.pause_time <= self.graph.now()
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    pub fn current_time(&self) -> f64 {
        let now = self.graph.now();
        if self.pause_time > now {
            self.time_at(now)
        } else {
            self.play_start_offset
        }
    }

    /// Seek. Out-of-range targets, and any target before the duration is known, are ignored.
    pub fn set_current_time(&mut self, time: f64) {
        if self.destroyed || !(time >= 0.0 && time <= self.duration) {
            return;
        }

        self.stop_playing();
        self.play_start_offset = time;
        self.play_start_time = f64::INFINITY;
        self.update_ready_state();
        self.emit(EngineEvent::TimeUpdate);
    }

    pub fn set_volume(&mut self, volume: f64) -> Result<(), EngineError> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(EngineError::VolumeOutOfRange(volume));
        }
        if volume != self.volume {
            self.volume = volume;
            self.graph
                .set_gain_ramp(self.main_gain, volume as f32, self.config.fade_secs)?;
        }
        Ok(())
    }

    pub fn set_max_duration(&mut self, max_duration: f64) -> Result<(), EngineError> {
        if max_duration.is_nan() || max_duration < 0.0 {
            return Err(EngineError::InvalidMaxDuration(max_duration));
        }
        if max_duration != self.max_duration {
            self.max_duration = max_duration;
            self.update_ready_state();
        }
        Ok(())
    }

    /// Start or resume playback.
    ///
    /// The request resolves once every audible clip has been scheduled, and is
    /// cancelled if playback is paused, ended or restarted before that.
    pub fn play(&mut self) -> Request {
        if self.destroyed {
            return Request::settled(Err(RequestError::Cancelled));
        }
        if !self.paused {
            self.play_waiters.cancel_all();
        }
        let request = self.play_waiters.push();

        self.ended = false;
        if self.paused {
            if self.current_time() == self.duration {
                self.set_current_time(0.0);
            }
            self.paused = false;
            self.update_ready_state();
            self.emit(EngineEvent::Play);
            self.emit(EngineEvent::TimeUpdate);
        } else {
            self.update_ready_state();
        }
        request
    }

    /// Pause now.
    pub fn pause(&mut self) {
        let now = self.graph.now();
        self.pause_at(now);
    }

    /// Pause at graph time `when`. A future time only shortens the running
    /// schedule; nothing is torn down until it is reached.
    pub fn pause_at(&mut self, when: f64) {
        if self.destroyed {
            return;
        }
        let now = self.graph.now();
        if when > now {
            if self.pause_time > now {
                self.pause_time = when;
                for clip in self.clips.values_mut() {
                    if let Some(chunked) = &mut clip.chunked {
                        if chunked.is_scheduled(now) {
                            chunked.pause(&mut self.graph, when);
                        }
                    }
                }
                self.start_timer(self.play_start_time, self.pause_time);
                self.update_ready_state();
            } else {
                log::debug!("ignoring deferred pause while nothing is playing");
            }
            return;
        }

        self.stop_playing();
        if !self.paused {
            self.ended = true;
            self.play_waiters.cancel_all();
            self.paused = true;
            self.emit(EngineEvent::Pause);
        }
    }

    /// Replace the project. Passing the snapshot already applied is a no-op.
    pub fn set_project(&mut self, project: Option<Arc<ProjectSnapshot>>) {
        if self.destroyed && project.is_some() {
            return;
        }
        match (&self.project, &project) {
            (Some(current), Some(next)) if Arc::ptr_eq(current, next) => return,
            (None, None) => return,
            _ => {}
        }
        self.project = project.clone();
        let next = project.unwrap_or_default();

        // Failed metadata gets another chance with each new snapshot
        self.sources
            .retain(|_, state| !matches!(state, SourceState::Failed));

        let now = self.graph.now();
        let fade = self.config.fade_secs;
        let mut unused_tracks: BTreeSet<TrackId> = self.tracks.keys().copied().collect();

        for (id, data) in &next.clips {
            unused_tracks.remove(&data.track);

            if !self.tracks.contains_key(&data.track) {
                let track_data = next
                    .tracks
                    .get(&data.track)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(TrackData::new(data.track)));
                let gain = self.graph.create_gain(1.0);
                self.tracks
                    .insert(data.track, Track::new(data.track, gain, track_data));
            }
            let track_gain = self.tracks[&data.track].gain;

            if self
                .clips
                .get(id)
                .is_some_and(|clip| Arc::ptr_eq(&clip.data, data))
            {
                continue;
            }
            let clip = match self.clips.entry(*id) {
                Entry::Occupied(entry) => {
                    let clip = entry.into_mut();
                    if clip.data.source.id != data.source.id {
                        if let Some(mut chunked) = clip.chunked.take() {
                            chunked.destroy(&mut self.graph);
                        }
                    } else if clip.data.timing_differs(data) {
                        if let Some(chunked) = &mut clip.chunked {
                            if chunked.is_scheduled(now) {
                                chunked.pause(&mut self.graph, now);
                            }
                        }
                    }
                    clip.data = data.clone();
                    clip
                }
                Entry::Vacant(entry) => {
                    let gain = self.graph.create_gain(1.0);
                    entry.insert(Clip::new(gain, data.clone()))
                }
            };

            self.graph.disconnect_all(clip.gain);
            if let Err(err) = self.graph.connect(clip.gain, track_gain) {
                log::error!("could not connect clip {id} to {}: {err}", data.track);
            }
            if let Err(err) = self.graph.set_gain_ramp(clip.gain, data.gain, fade) {
                log::error!("could not set gain of clip {id}: {err}");
            }
        }

        let removed_clips: Vec<ClipId> = self
            .clips
            .keys()
            .filter(|id| !next.clips.contains_key(id))
            .copied()
            .collect();
        for id in removed_clips {
            if let Some(clip) = self.clips.remove(&id) {
                clip.teardown(&mut self.graph);
            }
        }

        for id in unused_tracks {
            if let Some(track) = self.tracks.remove(&id) {
                track.teardown(&mut self.graph, self.scene.as_deref_mut());
            }
        }

        for (id, track) in self.tracks.iter_mut() {
            if let Some(data) = next.tracks.get(id) {
                if !Arc::ptr_eq(&track.data, data) {
                    track.data = data.clone();
                }
            }
        }

        self.route_tracks();
        self.update_ready_state();
    }

    /// Tear everything down. The engine emits nothing afterwards.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.stop_playing();
        self.set_project(None);
        self.destroyed = true;
        self.events.clear();
        self.paused = true;

        self.play_waiters.cancel_all();
        self.start_requests = FuturesUnordered::new();
        self.metadata_loads = FuturesUnordered::new();
        self.subscription = None;
        if self.spatializer.is_loading() {
            self.spatializer = SpatializerSlot::Failed;
        }

        self.reset_timer();
        if let Some(mut scene) = self.scene.take() {
            scene.disconnect(&mut self.graph);
        }
        if let Some(router) = self.output_router.take() {
            router.remove(&mut self.graph);
        }
        self.graph.remove(self.main_gain);
    }

    /// Apply completed async work without blocking. Returns true once no
    /// loads are outstanding.
    pub fn pump(&mut self) -> bool {
        let mut cx = Context::from_waker(noop_waker_ref());
        self.poll_pump(&mut cx).is_ready()
    }

    /// Apply completed async work. Ready once no loads are outstanding;
    /// otherwise `cx` is woken when one completes.
    pub fn poll_pump(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while self.drain(cx) {}

        let loading = !self.metadata_loads.is_empty()
            || self.spatializer.is_loading()
            || self
                .clips
                .values()
                .filter_map(|clip| clip.chunked.as_ref())
                .any(|chunked| chunked.pending_loads() > 0);
        if loading { Poll::Pending } else { Poll::Ready(()) }
    }

    /// React to the clock: the end timer, finished clips and time updates.
    pub fn tick(&mut self) {
        if self.destroyed {
            return;
        }
        let now = self.graph.now();

        if let Some(timer) = self.timer {
            if self.graph.is_finished(timer, now) {
                self.on_ended();
            }
        }

        let mut clip_ended = false;
        for clip in self.clips.values_mut() {
            if let Some(chunked) = &mut clip.chunked {
                chunked.tick(&mut self.graph);
                clip_ended |= chunked.take_ended();
            }
        }
        if clip_ended {
            self.check_ended();
        }

        if !self.paused && self.pause_time > now {
            self.emit(EngineEvent::TimeUpdate);
        }
    }

    fn emit(&mut self, event: EngineEvent) {
        if !self.destroyed {
            self.events.push_back(event);
        }
    }

    fn time_at(&self, time: f64) -> f64 {
        let elapsed = (time - self.play_start_time).max(0.0);
        let duration = if self.duration.is_nan() { 0.0 } else { self.duration };
        (self.play_start_offset + elapsed).min(duration).max(0.0)
    }

    fn drain(&mut self, cx: &mut Context<'_>) -> bool {
        let mut changed = false;

        let mut latest = None;
        if let Some(snapshots) = &mut self.subscription {
            loop {
                match snapshots.poll_next_unpin(cx) {
                    Poll::Ready(Some(snapshot)) => latest = Some(snapshot),
                    Poll::Ready(None) => {
                        self.subscription = None;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }
        if let Some(snapshot) = latest {
            self.set_project(Some(snapshot));
        }

        while let Poll::Ready(Some((id, result))) = self.metadata_loads.poll_next_unpin(cx) {
            let result = result.and_then(|source| {
                source
                    .validate()
                    .map(|()| source)
                    .map_err(|err| StoreError::Malformed(err.to_string()))
            });
            match result {
                Ok(source) => {
                    self.sources.insert(id, SourceState::Ready(Arc::new(source)));
                    changed = true;
                }
                Err(err) => {
                    if err.is_not_found() {
                        log::debug!("source {id} unavailable: {err}");
                    } else {
                        log::error!("Error loading source {id}: {err}");
                    }
                    self.sources.insert(id, SourceState::Failed);
                }
            }
        }

        let loaded = match &mut self.spatializer {
            SpatializerSlot::Loading(load) => match load.poll_unpin(cx) {
                Poll::Ready(result) => Some(result),
                Poll::Pending => None,
            },
            _ => None,
        };
        match loaded {
            Some(Ok(spatializer)) => {
                log::debug!("spatializer loaded");
                self.spatializer = SpatializerSlot::Ready(spatializer);
                changed = true;
            }
            Some(Err(reason)) => {
                log::warn!("Failed to load spatializer, falling back to the main bus: {reason}");
                self.spatializer = SpatializerSlot::Failed;
                self.route_tracks();
                changed = true;
            }
            None => {}
        }

        let mut progress = LoadProgress::default();
        for clip in self.clips.values_mut() {
            if let Some(chunked) = &mut clip.chunked {
                progress.merge(chunked.poll_loads(&mut self.graph, cx));
            }
        }
        if progress.loaded > 0 {
            changed = true;
        }

        self.poll_start_requests(cx);

        if changed {
            self.update_ready_state();
        }
        changed
    }

    fn poll_start_requests(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(outcome)) = self.start_requests.poll_next_unpin(cx) {
            if let Err(RequestError::Failed(reason)) = outcome {
                log::warn!("clip failed to start: {reason}");
                self.play_waiters.fail_all(&reason);
            }
        }
        if self.start_requests.is_empty() && !self.paused && self.pause_time > self.graph.now() {
            self.play_waiters.resolve_all();
        }
    }

    fn load_metadata(&mut self, id: &SourceId) {
        self.sources.insert(id.clone(), SourceState::Loading);
        let load = self.store.load_source_metadata(id);
        let id = id.clone();
        self.metadata_loads
            .push(async move { (id, load.await) }.boxed());
    }

    fn reset_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.graph.remove(timer);
        }
    }

    /// Schedule the zero-signal node whose end marks the end of playback.
    fn start_timer(&mut self, start: f64, stop: f64) {
        self.reset_timer();
        let timer = self.graph.create_constant_source(0.0);
        let started = self
            .graph
            .connect(timer, self.graph.destination())
            .and_then(|()| self.graph.start_source(timer, start, 0.0, stop - start));
        match started {
            Ok(()) => self.timer = Some(timer),
            Err(err) => {
                log::error!("could not start end timer: {err}");
                self.graph.remove(timer);
            }
        }
    }

    fn stop_playing(&mut self) {
        let current_time = self.current_time();
        let now = self.graph.now();

        self.reset_timer();
        for clip in self.clips.values_mut() {
            if let Some(chunked) = &mut clip.chunked {
                if chunked.is_scheduled(now) {
                    chunked.pause(&mut self.graph, now);
                }
            }
        }
        if self.pause_time > now {
            self.play_start_offset = current_time;
            self.play_start_time = f64::INFINITY;
            self.pause_time = now;
        }
    }

    /// Playback reached its end (or its deferred pause). Always leaves the engine paused.
    fn on_ended(&mut self) {
        let needs_ended = !self.ended;
        let needs_pause = !self.paused;
        let now = self.graph.now();

        self.play_start_offset = self.time_at(self.pause_time.min(now));
        self.play_start_time = f64::INFINITY;
        self.pause_time = now;
        self.ended = true;
        self.paused = true;

        self.play_waiters.cancel_all();
        self.start_requests = FuturesUnordered::new();
        self.stop_playing();

        if needs_ended {
            self.emit(EngineEvent::Ended);
        }
        if needs_pause {
            self.emit(EngineEvent::Pause);
        }
    }

    fn check_ended(&mut self) {
        let now = self.graph.now();
        if !self.paused && self.play_start_time < now && self.pause_time < now {
            self.on_ended();
        } else {
            self.update_ready_state();
        }
    }

    /// Classify every track by audibility and pan mode and reconnect its gain.
    fn route_tracks(&mut self) {
        let Some(project) = self.project.clone() else {
            self.spatial_tracks.clear();
            self.ambisonic_tracks.clear();
            self.forced_tracks.clear();
            return;
        };

        let fade = self.config.fade_secs;
        let soloed: BTreeSet<TrackId> = self
            .tracks
            .values()
            .filter(|track| track.data.solo)
            .map(|track| track.id)
            .collect();

        self.spatial_tracks.clear();
        self.ambisonic_tracks.clear();
        self.forced_tracks.clear();

        for track in self.tracks.values_mut() {
            let muted = track.data.mute || (!soloed.is_empty() && !soloed.contains(&track.id));
            let gain = if muted { 0.0 } else { track.data.gain };
            if let Err(err) = self.graph.set_gain_ramp(track.gain, gain, fade) {
                log::error!("could not set gain of {}: {err}", track.id);
            }

            track.pan_mode = if muted {
                None
            } else {
                track_pan_mode(&track.data, &project)
            };
            let channels = match track.pan_mode {
                Some(PanMode::Stereo) => 2,
                Some(PanMode::Ambisonic) => 4,
                Some(PanMode::Spatial) | None => 1,
            };
            if let Err(err) = self.graph.set_channel_count(track.gain, Some(channels)) {
                log::error!("could not set channel count of {}: {err}", track.id);
            }

            track.disconnect_routes(&mut self.graph, self.main_gain);

            let mut route = match track.pan_mode {
                Some(PanMode::Spatial) => Route::Spatial,
                Some(PanMode::Ambisonic) => Route::Ambisonic,
                _ if self.config.channel_mode == ChannelMode::Ambisonic => Route::Forced,
                _ => Route::Main,
            };
            if route != Route::Main && !self.spatializer.is_available() {
                log::warn!("no spatializer available, routing {} to the main bus", track.id);
                route = Route::Main;
            }

            match route {
                Route::Spatial => {
                    self.spatial_tracks.insert(track.id);
                }
                Route::Ambisonic => {
                    self.ambisonic_tracks.insert(track.id);
                }
                Route::Forced => {
                    self.forced_tracks.insert(track.id);
                }
                Route::Main => {
                    if let Err(err) = track.connect_main(&mut self.graph, self.main_gain) {
                        log::error!("could not connect {} to the main bus: {err}", track.id);
                    }
                }
            }
        }
    }

    /// Build the spatial scene if needed and wire spatial tracks into it.
    /// Returns false while the spatializer is still on its way.
    fn set_up_spatial_routes(&mut self) -> bool {
        if self.spatial_tracks.is_empty()
            && self.ambisonic_tracks.is_empty()
            && self.forced_tracks.is_empty()
        {
            return true;
        }

        if self.scene.is_none() {
            let spatializer = match &self.spatializer {
                SpatializerSlot::Ready(spatializer) => spatializer.clone(),
                SpatializerSlot::Idle(loader) => {
                    log::debug!("loading spatializer");
                    self.spatializer = SpatializerSlot::Loading(loader.load());
                    return false;
                }
                SpatializerSlot::Loading(_) => return false,
                SpatializerSlot::Unavailable | SpatializerSlot::Failed => return true,
            };

            let scene = spatializer.create_scene(&mut self.graph).and_then(|scene| {
                let output = match self.config.channel_mode {
                    ChannelMode::Ambisonic => scene.ambisonic_output(),
                    ChannelMode::Stereo => scene.output(),
                };
                self.graph.connect(output, self.main_gain)?;
                Ok(scene)
            });
            match scene {
                Ok(scene) => self.scene = Some(scene),
                Err(err) => {
                    log::warn!("Failed to create spatial scene, falling back to the main bus: {err}");
                    self.spatializer = SpatializerSlot::Failed;
                    self.route_tracks();
                    return true;
                }
            }
        }

        let Some(scene) = self.scene.as_deref_mut() else {
            return true;
        };
        for id in &self.spatial_tracks {
            if let Some(track) = self.tracks.get_mut(id) {
                if let Err(err) = track.set_up_spatial(&mut self.graph, &mut *scene) {
                    log::error!("could not route {id} to its spatial source: {err}");
                }
            }
        }
        for id in &self.ambisonic_tracks {
            if let Some(track) = self.tracks.get_mut(id) {
                if let Err(err) = track.set_up_ambisonic(&mut self.graph, &mut *scene) {
                    log::error!("could not route {id} to the ambisonic bus: {err}");
                }
            }
        }
        for id in &self.forced_tracks {
            if let Some(track) = self.tracks.get_mut(id) {
                if let Err(err) = track.set_up_forced(&mut self.graph, &mut *scene) {
                    log::error!("could not spatialize {id}: {err}");
                }
            }
        }
        true
    }

    /// Recompute readiness and duration, keep clips primed around the
    /// playhead, and start or stop audible playback to match.
    fn update_ready_state(&mut self) {
        if self.destroyed {
            return;
        }

        let had_metadata = self.has_metadata;
        let could_play = self.can_play;
        let current_time = self.current_time();
        let now = self.graph.now();

        let mut has_metadata = true;
        let mut can_play = self.set_up_spatial_routes();

        // Metadata and content duration
        let mut content_duration = 0.0f64;
        let mut missing = Vec::new();
        for clip in self.clips.values_mut() {
            let data = clip.data.clone();
            if !data.enabled {
                if let Some(mut chunked) = clip.chunked.take() {
                    chunked.destroy(&mut self.graph);
                }
                continue;
            }

            let source = match self.sources.get(&data.source.id) {
                Some(SourceState::Ready(source)) => source.clone(),
                Some(SourceState::Loading | SourceState::Failed) => {
                    has_metadata = false;
                    continue;
                }
                None => {
                    has_metadata = false;
                    missing.push(data.source.id.clone());
                    continue;
                }
            };
            content_duration = content_duration.max(data.end());

            if clip.chunked.is_none() {
                clip.chunked = Some(ChunkedClip::new(
                    source,
                    self.store.clone(),
                    clip.gain,
                    self.config.lookahead(),
                ));
            }
        }
        for id in missing {
            if !self.sources.contains_key(&id) {
                self.load_metadata(&id);
            }
        }
        if !has_metadata {
            can_play = false;
            content_duration = f64::NAN;
        }

        let duration = if content_duration.is_nan() {
            f64::NAN
        } else {
            content_duration.min(self.max_duration)
        };

        // Keep every clip primed at the playhead
        let known_duration = if duration.is_nan() { 0.0 } else { duration };
        let timeline_end = if self.pause_time > now {
            known_duration.min(current_time + (self.pause_time - now))
        } else {
            known_duration
        };
        for clip in self.clips.values_mut() {
            let data = &clip.data;
            let Some(chunked) = &mut clip.chunked else {
                continue;
            };
            if chunked.is_scheduled(now) {
                continue;
            }

            let desired = desired_clip_offset(data, current_time);
            let clip_end = chunked
                .duration()
                .min(data.offset + data.duration.min(timeline_end - data.start));
            if desired >= clip_end {
                let _ = chunked.unload(&mut self.graph);
                continue;
            }
            if !chunked.is_primed(desired, desired) {
                can_play = false;
                let _ = chunked.prime(&mut self.graph, desired, clip_end - desired);
            }
        }

        let duration_changed = !(self.duration == duration || (self.duration.is_nan() && duration.is_nan()));
        self.content_duration = content_duration;
        self.duration = duration;
        self.has_metadata = has_metadata;
        self.can_play = can_play;

        if duration_changed {
            self.emit(EngineEvent::DurationChange);
        }
        if had_metadata && !has_metadata {
            self.emit(EngineEvent::Unload);
        } else if has_metadata && !had_metadata {
            self.emit(EngineEvent::LoadedMetadata);
        }
        if can_play && !could_play {
            self.emit(EngineEvent::CanPlay);
        }

        if duration_changed && self.current_time() >= duration {
            self.on_ended();
            return;
        }

        if self.paused {
            return;
        }
        if !(can_play && duration > 0.0) {
            // Waiting: still wants to play, but nothing may sound
            self.stop_playing();
            return;
        }

        if self.pause_time <= now {
            let current_time = self.current_time();
            self.play_start_offset = current_time;
            self.play_start_time = now;
            self.pause_time = now + duration - current_time;
            self.start_timer(self.play_start_time, self.pause_time);
            self.emit(EngineEvent::TimeUpdate);
        }

        let current_time = self.current_time();
        for clip in self.clips.values_mut() {
            let data = &clip.data;
            let Some(chunked) = &mut clip.chunked else {
                continue;
            };
            if !data.enabled || chunked.is_scheduled(now) {
                continue;
            }

            let desired = desired_clip_offset(data, current_time);
            let source_duration = chunked.duration();
            if desired >= source_duration {
                continue;
            }
            let start = now + (data.start - current_time).max(0.0);
            let played = desired - data.offset;
            let remaining = (source_duration - desired)
                .min(data.duration - played)
                .min(duration - data.start - played)
                .min(self.pause_time - start);
            if remaining > 0.0 {
                self.start_requests
                    .push(chunked.play(&mut self.graph, desired, remaining, start));
            }
        }

        let mut cx = Context::from_waker(noop_waker_ref());
        self.poll_start_requests(&mut cx);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.play_waiters.cancel_all();
    }
}

/// Offset into the clip's source that should be playing at timeline `time`,
/// or infinity once the clip is over.
fn desired_clip_offset(clip: &deck_project::ClipData, time: f64) -> f64 {
    if clip.end() <= time {
        return f64::INFINITY;
    }
    clip.offset + (time - clip.start).max(0.0)
}

#[cfg(test)]
mod tests {
    use deck_graph::ManualClock;
    use deck_project::{ClipData, ClipSource};
    use deck_store::MemoryChunkStore;

    use super::*;

    const RATE: u32 = 100;

    fn clip(id: u64, start: f64, duration: f64, offset: f64) -> ClipData {
        ClipData {
            id: ClipId(id),
            track: TrackId(1),
            start,
            duration,
            offset,
            gain: 1.0,
            enabled: true,
            source: ClipSource {
                id: SourceId::new("s"),
                channels: Some(1),
                duration: 10.0,
            },
        }
    }

    #[test]
    fn test_desired_clip_offset() {
        let c = clip(1, 2.0, 3.0, 1.0);
        assert_eq!(desired_clip_offset(&c, 0.0), 1.0);
        assert_eq!(desired_clip_offset(&c, 3.5), 2.5);
        assert_eq!(desired_clip_offset(&c, 5.0), f64::INFINITY);
    }

    #[test]
    fn test_volume_validation() {
        let graph = AudioGraph::new(Arc::new(ManualClock::new()), RATE, 2);
        let mut engine =
            Engine::new(graph, Arc::new(MemoryChunkStore::new()), EngineConfig::default()).unwrap();

        assert!(matches!(
            engine.set_volume(-0.1),
            Err(EngineError::VolumeOutOfRange(_))
        ));
        assert!(engine.set_volume(f64::NAN).is_err());
        assert!(engine.set_volume(f64::INFINITY).is_err());
        assert_eq!(engine.volume(), 1.0);

        engine.set_volume(0.5).unwrap();
        assert_eq!(engine.volume(), 0.5);
        assert_eq!(engine.graph().gain_target(engine.main_gain()), Some(0.5));
    }

    #[test]
    fn test_max_duration_validation() {
        let graph = AudioGraph::new(Arc::new(ManualClock::new()), RATE, 2);
        let mut engine =
            Engine::new(graph, Arc::new(MemoryChunkStore::new()), EngineConfig::default()).unwrap();
        assert!(engine.set_max_duration(f64::NAN).is_err());
        assert!(engine.set_max_duration(-1.0).is_err());
        engine.set_max_duration(5.0).unwrap();
        assert_eq!(engine.max_duration(), 5.0);
    }

    #[test]
    fn test_ambisonic_output_topology() {
        let graph = AudioGraph::new(Arc::new(ManualClock::new()), RATE, 4);
        let engine = Engine::new(
            graph,
            Arc::new(MemoryChunkStore::new()),
            EngineConfig {
                channel_mode: ChannelMode::Ambisonic,
                ..EngineConfig::default()
            },
        )
        .unwrap();
        let graph = engine.graph();
        assert_eq!(graph.channel_count(engine.main_gain()), Some(4));
        assert!(!graph.is_connected(engine.main_gain(), graph.destination()));
        // main gain, splitter, merger, destination
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 6);
    }
}
