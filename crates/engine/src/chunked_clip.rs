use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::task::{Context, Poll};

use deck_graph::{AudioGraph, NodeId};
use deck_store::{ChunkStore, StoreError};
use deck_transport::{ChunkBuffer, Source};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::task::noop_waker_ref;
use futures::{FutureExt, StreamExt};

use crate::{Request, RequestError, Waiters};

/// Chunks kept resident even when the lookahead is covered by fewer.
const MIN_RESIDENT_CHUNKS: usize = 2;

/// Result of draining a clip's finished chunk loads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub loaded: usize,
    pub failed: usize,
}

impl LoadProgress {
    pub fn merge(&mut self, other: LoadProgress) {
        self.loaded += other.loaded;
        self.failed += other.failed;
    }
}

struct ActiveChunk {
    ticket: u64,
    buffer: Option<Arc<ChunkBuffer>>,
    node: Option<LiveNode>,
}

struct LiveNode {
    id: NodeId,
    ends_at: f64,
    noticed: bool,
}

struct ChunkLoad {
    index: usize,
    ticket: u64,
    result: Result<ChunkBuffer, StoreError>,
}

struct PendingPlay {
    offset: f64,
    duration: f64,
    when: f64,
    generation: u64,
    prime: Request,
}

/// Streams one clip's source from a [`ChunkStore`] into the graph.
///
/// Keeps a forward window of decoded chunks resident around the playhead and,
/// while playing, one scheduled buffer source per resident chunk. All methods
/// run on the control thread; chunk loads complete when [`ChunkedClip::pump`]
/// or [`ChunkedClip::poll_loads`] is called.
pub struct ChunkedClip {
    source: Arc<Source>,
    store: Arc<dyn ChunkStore>,
    destination: NodeId,
    lookahead: f64,

    active: BTreeMap<usize, ActiveChunk>,
    loads: FuturesUnordered<BoxFuture<'static, ChunkLoad>>,
    next_ticket: u64,
    window_start: usize,

    start_offset: f64,
    /// Where scheduled playback stops, pulled in by a pending pause
    end_offset: f64,
    /// End of the requested range; bounds the window while stopped
    window_end: f64,
    play_start_time: f64,
    play_end_time: f64,
    ended: bool,
    ended_pending: bool,
    destroyed: bool,

    prime_waiters: Waiters,
    play_waiters: Waiters,
    pending_play: Option<PendingPlay>,
}

impl ChunkedClip {
    pub fn new(
        source: Arc<Source>,
        store: Arc<dyn ChunkStore>,
        destination: NodeId,
        lookahead: f64,
    ) -> Self {
        Self {
            source,
            store,
            destination,
            lookahead,
            active: BTreeMap::new(),
            loads: FuturesUnordered::new(),
            next_ticket: 0,
            window_start: usize::MAX,
            start_offset: 0.0,
            end_offset: f64::INFINITY,
            window_end: f64::INFINITY,
            play_start_time: f64::NEG_INFINITY,
            play_end_time: 0.0,
            ended: true,
            ended_pending: false,
            destroyed: false,
            prime_waiters: Waiters::new(),
            play_waiters: Waiters::new(),
            pending_play: None,
        }
    }

    pub fn source(&self) -> &Arc<Source> {
        &self.source
    }

    pub fn duration(&self) -> f64 {
        self.source.duration
    }

    /// Make the window starting at `offset` resident.
    ///
    /// Supersedes a pending prime that targets a different chunk.
    pub fn prime(&mut self, graph: &mut AudioGraph, offset: f64, duration: f64) -> Request {
        self.start_offset = offset;
        self.end_offset = self.source.duration.min(offset + duration);
        self.window_end = self.end_offset;
        if self.play_end_time <= graph.now() {
            // Stopped: the window follows the primed offset, not the last playhead
            self.play_start_time = f64::NEG_INFINITY;
        }
        if self.is_currently_playable(offset) {
            return Request::settled(Ok(()));
        }

        if self.source.find_chunk_index(offset) != self.window_start {
            self.prime_waiters.cancel_all();
        }
        let request = self.prime_waiters.push();
        self.update(graph);
        request
    }

    /// Whether every chunk intersecting `[start, end]` is decoded.
    pub fn is_primed(&self, start: f64, end: f64) -> bool {
        let count = self.source.chunks.len();
        let first = self.source.find_chunk_index(start);
        if first >= count {
            return false;
        }

        let last = if end == start {
            first
        } else if end >= self.source.duration {
            count - 1
        } else {
            self.source.find_chunk_index_from(end, first).min(count - 1)
        };

        (first..=last.max(first)).all(|i| self.is_resident(i))
    }

    /// Release every resident chunk while keeping the clip usable.
    pub fn unload(&mut self, graph: &mut AudioGraph) -> Request {
        self.prime(graph, f64::INFINITY, f64::INFINITY)
    }

    /// Play `duration` seconds from `offset`, timed to graph time `when`.
    ///
    /// Any earlier play request is cancelled. The returned request resolves
    /// once nodes are scheduled.
    pub fn play(&mut self, graph: &mut AudioGraph, offset: f64, duration: f64, when: f64) -> Request {
        self.play_waiters.cancel_all();
        self.pending_play = None;
        let request = self.play_waiters.push();

        if self.is_currently_playable(offset) {
            self.start_playback(graph, offset, duration, when);
        } else {
            let prime = self.prime(graph, offset, duration);
            self.pending_play = Some(PendingPlay {
                offset,
                duration,
                when,
                generation: self.play_waiters.generation(),
                prime,
            });
            self.settle_pending_play(graph);
        }
        request
    }

    /// Stop playback at graph time `when`, clamped to now and to the end of the source.
    pub fn pause(&mut self, graph: &mut AudioGraph, when: f64) {
        let now = graph.now();
        if self.play_end_time > now {
            let source_end = self.play_start_time + self.source.duration - self.start_offset;
            self.play_end_time = now.max(source_end.min(when));
            self.end_offset =
                (self.play_end_time - self.play_start_time).max(0.0) + self.start_offset;
        }

        if self.play_end_time <= now {
            self.ended = true;
            self.pending_play = None;
            self.play_waiters.cancel_all();
        }

        for chunk in self.active.values_mut() {
            if let Some(node) = chunk.node.take() {
                graph.remove(node.id);
            }
        }
        self.update(graph);
    }

    /// Tear down all nodes and chunks and cancel every pending request.
    pub fn destroy(&mut self, graph: &mut AudioGraph) {
        let now = graph.now();
        self.destroyed = true;
        self.pause(graph, now);
        self.prime_waiters.cancel_all();
        self.play_waiters.cancel_all();
        self.pending_play = None;

        let indices: Vec<usize> = self.active.keys().copied().collect();
        for index in indices {
            self.release_chunk(graph, index);
        }
        self.loads = FuturesUnordered::new();
    }

    /// True while `now` lies inside the scheduled playback span.
    pub fn playing(&self, now: f64) -> bool {
        self.play_start_time <= now && now < self.play_end_time
    }

    /// True while playback is scheduled to run past `now`, including a
    /// start that hasn't been reached yet or is still waiting on chunks.
    pub fn is_scheduled(&self, now: f64) -> bool {
        self.pending_play.is_some() || self.play_end_time > now
    }

    /// Whether playback ran out since the last call.
    pub fn take_ended(&mut self) -> bool {
        std::mem::take(&mut self.ended_pending)
    }

    pub fn resident_chunks(&self) -> Vec<usize> {
        self.active
            .iter()
            .filter(|(_, chunk)| chunk.buffer.is_some())
            .map(|(index, _)| *index)
            .collect()
    }

    pub fn requested_chunks(&self) -> Vec<usize> {
        self.active.keys().copied().collect()
    }

    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.active
            .values()
            .filter_map(|chunk| chunk.node.as_ref().map(|node| node.id))
            .collect()
    }

    pub fn pending_loads(&self) -> usize {
        self.loads.len()
    }

    /// React to the clock: nodes that played out and the end of playback.
    pub fn tick(&mut self, graph: &mut AudioGraph) {
        if self.destroyed {
            return;
        }
        let now = graph.now();

        let mut changed = !self.ended && now >= self.play_end_time;
        for chunk in self.active.values_mut() {
            if let Some(node) = &mut chunk.node {
                if !node.noticed && now >= node.ends_at {
                    node.noticed = true;
                    changed = true;
                }
            }
        }

        if changed {
            self.update(graph);
        }
    }

    /// Apply finished chunk loads without blocking.
    pub fn pump(&mut self, graph: &mut AudioGraph) -> LoadProgress {
        let mut cx = Context::from_waker(noop_waker_ref());
        self.poll_loads(graph, &mut cx)
    }

    /// Apply finished chunk loads, registering `cx` for wakeups on pending ones.
    pub fn poll_loads(&mut self, graph: &mut AudioGraph, cx: &mut Context<'_>) -> LoadProgress {
        let mut progress = LoadProgress::default();

        while let Poll::Ready(Some(load)) = self.loads.poll_next_unpin(cx) {
            let current = self
                .active
                .get(&load.index)
                .is_some_and(|chunk| chunk.ticket == load.ticket);
            if !current {
                log::trace!("discarding stale load of chunk {} of {}", load.index, self.source.id);
                continue;
            }

            match load.result {
                Ok(buffer) => {
                    if let Some(chunk) = self.active.get_mut(&load.index) {
                        chunk.buffer = Some(Arc::new(buffer));
                    }
                    progress.loaded += 1;
                }
                Err(err) => {
                    if err.is_not_found() {
                        log::debug!("chunk {} of {} unavailable: {err}", load.index, self.source.id);
                    } else {
                        log::error!("Error loading chunk {} of {}: {err}", load.index, self.source.id);
                    }
                    // Dropped from the window so the next update asks again
                    self.active.remove(&load.index);
                    progress.failed += 1;
                }
            }
        }

        if progress.loaded > 0 {
            self.update(graph);
        }
        progress
    }

    fn is_resident(&self, index: usize) -> bool {
        self.active
            .get(&index)
            .is_some_and(|chunk| chunk.buffer.is_some())
    }

    fn is_currently_playable(&self, offset: f64) -> bool {
        self.is_resident(self.source.find_chunk_index(offset))
    }

    fn start_playback(&mut self, graph: &mut AudioGraph, offset: f64, duration: f64, when: f64) {
        self.ended = false;
        self.start_offset = offset;
        self.window_end = self.source.duration.min(offset + duration);
        self.play_start_time = when;
        self.play_end_time = f64::INFINITY;
        self.play_waiters.resolve_all();
        self.pause(graph, when + duration);
    }

    fn settle_pending_play(&mut self, graph: &mut AudioGraph) {
        let Some(pending) = &mut self.pending_play else {
            return;
        };
        let Some(outcome) = pending.prime.try_outcome() else {
            return;
        };
        let Some(pending) = self.pending_play.take() else {
            return;
        };
        if pending.generation != self.play_waiters.generation() {
            return;
        }

        match outcome {
            Ok(()) => self.start_playback(graph, pending.offset, pending.duration, pending.when),
            Err(RequestError::Cancelled) => self.play_waiters.cancel_all(),
            Err(RequestError::Failed(reason)) => self.play_waiters.fail_all(&reason),
        }
    }

    fn load_chunk(&mut self, index: usize) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.active.insert(
            index,
            ActiveChunk {
                ticket,
                buffer: None,
                node: None,
            },
        );

        let source = self.source.clone();
        let expected = source.chunks[index].sample_count;
        let channels: Vec<_> = (0..source.channels_per_frame as usize)
            .map(|channel| self.store.load_chunk_samples(&source.id, index, channel))
            .collect();

        // Kept at the source rate; the renderer converts on playback
        let load = async move {
            let result = async {
                if channels.is_empty() {
                    return Err(StoreError::Malformed(format!("{} has no channels", source.id)));
                }
                let mut channels = futures::future::try_join_all(channels).await?;
                for samples in &mut channels {
                    if samples.len() != expected {
                        log::warn!(
                            "chunk {index} of {} has {} samples, expected {expected}",
                            source.id,
                            samples.len()
                        );
                        samples.resize(expected, 0.0);
                    }
                }
                Ok(ChunkBuffer::from_channels(channels, source.sample_rate))
            }
            .await;

            ChunkLoad {
                index,
                ticket,
                result,
            }
        };
        self.loads.push(load.boxed());
    }

    fn release_chunk(&mut self, graph: &mut AudioGraph, index: usize) {
        if let Some(chunk) = self.active.remove(&index) {
            if let Some(node) = chunk.node {
                graph.remove(node.id);
            }
        }
    }

    /// Slide the resident window to the playhead and schedule what can play.
    fn update(&mut self, graph: &mut AudioGraph) {
        if self.destroyed {
            return;
        }

        let now = graph.now();
        let is_playing = self.play_end_time > now;
        let (current_offset, window_end) = if is_playing {
            (self.start_offset + (now - self.play_start_time).max(0.0), self.end_offset)
        } else if self.play_start_time.is_finite() {
            // Stopped after playing: hold the window at the position playback reached
            let reached = (self.play_end_time - self.play_start_time).max(0.0);
            (self.start_offset + reached, self.window_end)
        } else {
            (self.start_offset, self.window_end)
        };

        let chunk_count = self.source.chunks.len();
        let horizon = (current_offset + self.lookahead).min(window_end);
        self.window_start = self.source.find_chunk_index(current_offset);

        let mut wanted = BTreeSet::new();
        let mut all_loaded = true;
        let mut offset = current_offset;
        let mut index = self.window_start;
        while offset < window_end
            && index < chunk_count
            && (offset < horizon || wanted.len() < MIN_RESIDENT_CHUNKS)
        {
            wanted.insert(index);
            match self.active.get(&index) {
                Some(chunk) => all_loaded &= chunk.buffer.is_some(),
                None => {
                    self.load_chunk(index);
                    all_loaded = false;
                }
            }
            offset = self.source.chunks[index].end();
            index += 1;
        }

        let stale: Vec<usize> = self
            .active
            .keys()
            .filter(|index| !wanted.contains(index))
            .copied()
            .collect();
        for index in stale {
            self.release_chunk(graph, index);
        }

        if all_loaded || self.is_currently_playable(self.start_offset) {
            self.prime_waiters.resolve_all();
        }

        if is_playing {
            self.schedule_nodes(graph, now);
        } else if !self.ended {
            self.ended = true;
            self.ended_pending = true;
        }

        self.settle_pending_play(graph);
    }

    fn schedule_nodes(&mut self, graph: &mut AudioGraph, now: f64) {
        for (index, chunk) in self.active.iter_mut() {
            if chunk.node.is_some() {
                continue;
            }
            let Some(buffer) = &chunk.buffer else {
                continue;
            };

            let source_chunk = &self.source.chunks[*index];
            let desired_start = self.play_start_time + (source_chunk.offset - self.start_offset).max(0.0);
            let late = (now - desired_start).max(0.0);
            let node_offset = (self.start_offset - source_chunk.offset).max(0.0) + late;
            let node_start = desired_start + late;
            let node_duration = (source_chunk.duration - node_offset)
                .min(self.end_offset - (source_chunk.offset + node_offset))
                .min(self.play_end_time - node_start);

            if node_duration <= 0.0 {
                continue;
            }

            let node = graph.create_buffer_source(buffer.clone());
            if let Err(err) = graph
                .connect(node, self.destination)
                .and_then(|()| graph.start_source(node, node_start, node_offset, node_duration))
            {
                log::error!("could not schedule chunk {index} of {}: {err}", self.source.id);
                graph.remove(node);
                continue;
            }

            chunk.node = Some(LiveNode {
                id: node,
                ends_at: node_start + node_duration,
                noticed: false,
            });
        }
    }
}

impl Drop for ChunkedClip {
    fn drop(&mut self) {
        self.prime_waiters.cancel_all();
        self.play_waiters.cancel_all();
    }
}
