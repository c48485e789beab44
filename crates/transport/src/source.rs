use serde::{Deserialize, Serialize};

use crate::SourceId;

/// Slack allowed between the end of one chunk and the start of the next,
/// in seconds. Chunk offsets are accumulated floats.
const CONTIGUITY_EPSILON: f64 = 1e-6;

/// One contiguous span of a source's samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceChunk {
    /// Start of the chunk in seconds from the start of the source
    pub offset: f64,
    /// Length of the chunk in seconds
    pub duration: f64,
    /// Frames per channel stored for this chunk
    pub sample_count: usize,
}

impl SourceChunk {
    #[inline]
    pub fn end(&self) -> f64 {
        self.offset + self.duration
    }

    #[inline]
    pub fn contains(&self, offset: f64) -> bool {
        self.offset <= offset && offset < self.end()
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SourceError {
    #[error("source has no channels")]
    NoChannels,

    #[error("source sample rate must be positive")]
    InvalidSampleRate,

    #[error("chunk {index} starts at {offset}s, expected {expected}s")]
    Discontiguous {
        index: usize,
        offset: f64,
        expected: f64,
    },

    #[error("chunk {index} has a non-positive duration")]
    EmptyChunk { index: usize },

    #[error("chunks cover {covered}s but the source is {duration}s long")]
    CoverageMismatch { covered: f64, duration: f64 },

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Immutable metadata of a chunked source.
///
/// Chunks are ordered, non-overlapping and cover `[0, duration)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub duration: f64,
    pub sample_rate: u32,
    pub channels_per_frame: u16,
    pub chunks: Vec<SourceChunk>,
}

impl Source {
    pub fn new(
        id: SourceId,
        duration: f64,
        sample_rate: u32,
        channels_per_frame: u16,
        chunks: Vec<SourceChunk>,
    ) -> Result<Self, SourceError> {
        let source = Self {
            id,
            duration,
            sample_rate,
            channels_per_frame,
            chunks,
        };
        source.validate()?;
        Ok(source)
    }

    /// Check the invariants [`Source::new`] enforces. Metadata that arrives
    /// deserialized from a store bypasses the constructor, so it is checked
    /// again before use.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.channels_per_frame == 0 {
            return Err(SourceError::NoChannels);
        }
        if self.sample_rate == 0 {
            return Err(SourceError::InvalidSampleRate);
        }

        let mut expected = 0.0;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if !(chunk.duration > 0.0) {
                return Err(SourceError::EmptyChunk { index });
            }
            if !((chunk.offset - expected).abs() <= CONTIGUITY_EPSILON) {
                return Err(SourceError::Discontiguous {
                    index,
                    offset: chunk.offset,
                    expected,
                });
            }
            expected = chunk.end();
        }

        if !((expected - self.duration).abs() <= CONTIGUITY_EPSILON) {
            return Err(SourceError::CoverageMismatch {
                covered: expected,
                duration: self.duration,
            });
        }
        Ok(())
    }

    /// Build a source from per-chunk frame counts, deriving offsets and durations.
    pub fn from_chunk_lengths(
        id: SourceId,
        sample_rate: u32,
        channels_per_frame: u16,
        chunk_lengths: &[usize],
    ) -> Result<Self, SourceError> {
        if sample_rate == 0 {
            return Err(SourceError::InvalidSampleRate);
        }

        let mut chunks = Vec::with_capacity(chunk_lengths.len());
        let mut frames_so_far = 0usize;
        for &sample_count in chunk_lengths {
            let offset = frames_so_far as f64 / sample_rate as f64;
            frames_so_far += sample_count;
            let end = frames_so_far as f64 / sample_rate as f64;
            chunks.push(SourceChunk {
                offset,
                duration: end - offset,
                sample_count,
            });
        }
        let duration = frames_so_far as f64 / sample_rate as f64;

        Self::new(id, duration, sample_rate, channels_per_frame, chunks)
    }

    /// Index of the chunk containing `offset`.
    ///
    /// Returns `chunks.len()` when `offset` lies outside `[0, duration)`.
    pub fn find_chunk_index(&self, offset: f64) -> usize {
        self.find_chunk_index_from(offset, 0)
    }

    /// Like [`Source::find_chunk_index`], but only searches from `low` onwards.
    pub fn find_chunk_index_from(&self, offset: f64, low: usize) -> usize {
        if !(0.0..self.duration).contains(&offset) {
            return self.chunks.len();
        }
        let low = low.min(self.chunks.len());

        // First chunk whose end lies beyond the needle: the containing chunk,
        // or the insertion point if the needle falls in a gap.
        low + self.chunks[low..].partition_point(|chunk| chunk.end() <= offset)
    }
}
