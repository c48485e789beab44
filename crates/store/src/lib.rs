//! Content-addressed chunk storage boundary.
//!
//! The playback engine never reads whole files: it asks a [`ChunkStore`] for a
//! source's metadata and then for individual `(source, chunk, channel)` sample
//! buffers as the playhead approaches them.

mod chunkifier;
mod memory;
mod payload;

use deck_transport::{Source, SourceId};
use futures::future::BoxFuture;

pub use chunkifier::{CHUNK_BYTES, ChunkedAudio, Chunkifier};
pub use memory::MemoryChunkStore;
pub use payload::{BlobHandle, ChunkPayload};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("source '{0}' not found")]
    SourceNotFound(SourceId),

    #[error("chunk {chunk} channel {channel} of source '{source_id}' not found")]
    ChunkNotFound {
        source_id: SourceId,
        chunk: usize,
        channel: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed chunk data: {0}")]
    Malformed(String),
}

impl StoreError {
    /// Missing keys are an expected outcome; only real I/O trouble is worth logging.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::SourceNotFound(_) | StoreError::ChunkNotFound { .. }
        )
    }
}

/// Async, content-addressed access to chunked sources.
///
/// Implementations must tolerate repeated requests for the same key.
pub trait ChunkStore: Send + Sync {
    fn load_source_metadata(&self, id: &SourceId) -> BoxFuture<'static, Result<Source, StoreError>>;

    fn load_chunk_buffer(
        &self,
        id: &SourceId,
        chunk: usize,
        channel: usize,
    ) -> BoxFuture<'static, Result<ChunkPayload, StoreError>>;

    /// Load one channel of a chunk and resolve its payload to samples.
    fn load_chunk_samples(
        &self,
        id: &SourceId,
        chunk: usize,
        channel: usize,
    ) -> BoxFuture<'static, Result<Vec<f32>, StoreError>> {
        use futures::FutureExt;

        self.load_chunk_buffer(id, chunk, channel)
            .then(|payload| match payload {
                Ok(payload) => payload.resolve(),
                Err(err) => futures::future::ready(Err(err)).boxed(),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(StoreError::SourceNotFound(SourceId::new("a")).is_not_found());
        assert!(
            StoreError::ChunkNotFound {
                source_id: SourceId::new("a"),
                chunk: 0,
                channel: 1
            }
            .is_not_found()
        );
        assert!(!StoreError::Io(std::io::Error::other("disk")).is_not_found());
        assert!(!StoreError::Malformed("odd length".into()).is_not_found());
    }
}
