use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use deck_transport::{Source, SourceId};
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::{BlobHandle, ChunkPayload, ChunkStore, ChunkedAudio, StoreError};

type ChunkKey = (SourceId, usize, usize);

/// In-process chunk store.
///
/// Besides serving as the store for imported-in-memory sources, it keeps load
/// counters, tracks how many of its futures are still outstanding, and can hold
/// every load pending until [`MemoryChunkStore::release`] is called.
#[derive(Clone, Default)]
pub struct MemoryChunkStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    sources: Mutex<HashMap<SourceId, Source>>,
    chunks: Mutex<HashMap<ChunkKey, ChunkPayload>>,
    metadata_loads: AtomicUsize,
    chunk_loads: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    fail_chunks: AtomicBool,
    gate: Mutex<Gate>,
}

#[derive(Default)]
struct Gate {
    held: bool,
    waiting: Vec<oneshot::Sender<()>>,
}

/// Counts a store future as outstanding until it completes or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_source(&self, source: Source) {
        self.inner.sources.lock().insert(source.id.clone(), source);
    }

    pub fn insert_samples(&self, id: &SourceId, chunk: usize, channel: usize, samples: &[f32]) {
        self.inner.chunks.lock().insert(
            (id.clone(), chunk, channel),
            ChunkPayload::from_samples(samples),
        );
    }

    pub fn insert_blob(&self, id: &SourceId, chunk: usize, channel: usize, blob: BlobHandle) {
        self.inner
            .chunks
            .lock()
            .insert((id.clone(), chunk, channel), ChunkPayload::Blob(blob));
    }

    /// Insert a chunkified source together with all of its chunk data.
    pub fn insert_chunked(&self, audio: &ChunkedAudio) {
        let id = audio.source.id.clone();
        for (chunk, channels) in audio.chunks.iter().enumerate() {
            for (channel, samples) in channels.iter().enumerate() {
                self.insert_samples(&id, chunk, channel, samples);
            }
        }
        self.insert_source(audio.source.clone());
    }

    pub fn remove_source(&self, id: &SourceId) {
        self.inner.sources.lock().remove(id);
        self.inner.chunks.lock().retain(|(source, _, _), _| source != id);
    }

    /// Number of metadata requests served so far.
    pub fn metadata_loads(&self) -> usize {
        self.inner.metadata_loads.load(Ordering::SeqCst)
    }

    /// Number of chunk-channel requests served so far.
    pub fn chunk_loads(&self) -> usize {
        self.inner.chunk_loads.load(Ordering::SeqCst)
    }

    /// Futures handed out that have neither completed nor been dropped.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Keep every subsequent load pending until [`MemoryChunkStore::release`].
    pub fn hold(&self) {
        self.inner.gate.lock().held = true;
    }

    /// Let all held loads complete and stop holding new ones.
    pub fn release(&self) {
        let mut gate = self.inner.gate.lock();
        gate.held = false;
        for waiter in gate.waiting.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Make chunk loads fail with an I/O error.
    pub fn fail_chunks(&self, fail: bool) {
        self.inner.fail_chunks.store(fail, Ordering::SeqCst);
    }

    fn wait_for_gate(&self) -> Option<oneshot::Receiver<()>> {
        let mut gate = self.inner.gate.lock();
        if !gate.held {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        gate.waiting.push(tx);
        Some(rx)
    }
}

impl ChunkStore for MemoryChunkStore {
    fn load_source_metadata(&self, id: &SourceId) -> BoxFuture<'static, Result<Source, StoreError>> {
        self.inner.metadata_loads.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight::new(&self.inner.in_flight);
        let gate = self.wait_for_gate();
        let inner = self.inner.clone();
        let id = id.clone();

        async move {
            let _guard = guard;
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            inner
                .sources
                .lock()
                .get(&id)
                .cloned()
                .ok_or(StoreError::SourceNotFound(id))
        }
        .boxed()
    }

    fn load_chunk_buffer(
        &self,
        id: &SourceId,
        chunk: usize,
        channel: usize,
    ) -> BoxFuture<'static, Result<ChunkPayload, StoreError>> {
        self.inner.chunk_loads.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight::new(&self.inner.in_flight);
        let gate = self.wait_for_gate();
        let inner = self.inner.clone();
        let id = id.clone();

        async move {
            let _guard = guard;
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if inner.fail_chunks.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("injected chunk failure")));
            }
            inner
                .chunks
                .lock()
                .get(&(id.clone(), chunk, channel))
                .cloned()
                .ok_or(StoreError::ChunkNotFound {
                    source_id: id,
                    chunk,
                    channel,
                })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn store_with_tone() -> (MemoryChunkStore, SourceId) {
        let store = MemoryChunkStore::new();
        let id = SourceId::new("tone");
        let source = Source::from_chunk_lengths(id.clone(), 4, 1, &[4, 4]).unwrap();
        store.insert_source(source);
        store.insert_samples(&id, 0, 0, &[0.1, 0.2, 0.3, 0.4]);
        store.insert_samples(&id, 1, 0, &[0.5, 0.6, 0.7, 0.8]);
        (store, id)
    }

    #[test]
    fn test_loads_metadata_and_chunks() {
        let (store, id) = store_with_tone();

        let source = block_on(store.load_source_metadata(&id)).unwrap();
        assert_eq!(source.chunks.len(), 2);

        let samples = block_on(store.load_chunk_samples(&id, 1, 0)).unwrap();
        assert_eq!(samples, vec![0.5, 0.6, 0.7, 0.8]);

        assert_eq!(store.metadata_loads(), 1);
        assert_eq!(store.chunk_loads(), 1);
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn test_missing_keys_are_not_found() {
        let (store, id) = store_with_tone();
        let err = block_on(store.load_chunk_buffer(&id, 7, 0)).unwrap_err();
        assert!(err.is_not_found());
        let err = block_on(store.load_source_metadata(&SourceId::new("nope"))).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_injected_failures_are_io_errors() {
        let (store, id) = store_with_tone();
        store.fail_chunks(true);
        let err = block_on(store.load_chunk_buffer(&id, 0, 0)).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_hold_keeps_loads_pending_until_release() {
        let (store, id) = store_with_tone();
        store.hold();

        let mut load = store.load_chunk_samples(&id, 0, 0);
        assert!((&mut load).now_or_never().is_none());
        assert_eq!(store.in_flight(), 1);

        store.release();
        let samples = load.now_or_never().expect("released").unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn test_dropping_a_pending_load_clears_in_flight() {
        let (store, id) = store_with_tone();
        store.hold();
        let load = store.load_chunk_buffer(&id, 0, 0);
        assert_eq!(store.in_flight(), 1);
        drop(load);
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn test_remove_source_drops_chunks() {
        let (store, id) = store_with_tone();
        store.remove_source(&id);
        assert!(block_on(store.load_chunk_buffer(&id, 0, 0)).is_err());
        assert!(block_on(store.load_source_metadata(&id)).is_err());
    }
}
