use std::sync::Arc;

/// Interleaved rendered audio.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn silent(frames: usize, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: vec![0.0; frames * channels as usize],
            sample_rate,
            channels,
        }
    }

    /// Number of frames (samples per channel).
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn append(&mut self, other: &AudioBuffer) {
        debug_assert_eq!(self.channels, other.channels);
        self.samples.extend_from_slice(&other.samples);
    }
}

/// Decoded, planar sample data of one source chunk.
///
/// Each channel is stored in its own `Arc<[f32]>` so cloning the buffer (for
/// example when publishing a graph snapshot to the audio thread) only bumps
/// reference counts.
///
/// # Examples
///
/// ```
/// use deck_transport::ChunkBuffer;
///
/// let buffer = ChunkBuffer::from_channels(vec![vec![0.0, 0.5], vec![1.0, 1.5]], 44100);
/// assert_eq!(buffer.frames(), 2);
/// assert_eq!(buffer.channels(), 2);
/// assert_eq!(buffer.channel(1)[0], 1.0);
/// ```
#[derive(Clone)]
pub struct ChunkBuffer {
    channels: Arc<[Arc<[f32]>]>,
    sample_rate: u32,
    frames: usize,
}

impl ChunkBuffer {
    /// Create a buffer from one sample vector per channel.
    ///
    /// # Panics
    ///
    /// Panics if `channels` is empty or the channels differ in length.
    pub fn from_channels(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        assert!(!channels.is_empty(), "channels must not be empty");
        let frames = channels[0].len();
        assert!(
            channels.iter().all(|c| c.len() == frames),
            "channels must have equal length"
        );
        Self {
            channels: channels.into_iter().map(Arc::from).collect(),
            sample_rate,
            frames,
        }
    }

    #[inline]
    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.channels[channel]
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / self.sample_rate as f64
    }
}

impl std::fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("frames", &self.frames)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels.len())
            .finish()
    }
}
