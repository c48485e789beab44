use deck_transport::{Source, SourceError, SourceId, StreamResampler};

/// Decoded size of one chunk across all channels: 10 MB of `f32` samples.
pub const CHUNK_BYTES: usize = 10 * 1024 * 1024;

const FLOAT_SIZE: usize = 4;

/// A source split into per-(chunk, channel) sample vectors.
#[derive(Debug, Clone)]
pub struct ChunkedAudio {
    pub source: Source,
    /// Indexed by chunk, then channel
    pub chunks: Vec<Vec<Vec<f32>>>,
}

/// Splits an interleaved stream of decoded samples into fixed-size planar chunks.
///
/// Feed decoded packets with [`Chunkifier::add`], then [`Chunkifier::close`] to
/// flush the final (possibly short) chunk and build the [`Source`] metadata.
/// A chunkifier built with [`Chunkifier::resampling`] converts the decoded
/// rate to the stored rate on the way in.
pub struct Chunkifier {
    sample_rate: u32,
    channels: usize,
    chunk_frames: usize,
    current: Vec<Vec<f32>>,
    chunks: Vec<Vec<Vec<f32>>>,
    pending: Vec<f32>,
    resampler: Option<StreamResampler>,
}

impl Chunkifier {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let frames = CHUNK_BYTES / FLOAT_SIZE / channels.max(1) as usize;
        Self::with_chunk_frames(sample_rate, channels, frames)
    }

    /// Use an explicit chunk length in frames per channel.
    pub fn with_chunk_frames(sample_rate: u32, channels: u16, chunk_frames: usize) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            sample_rate,
            channels,
            chunk_frames: chunk_frames.max(1),
            current: vec![Vec::new(); channels],
            chunks: Vec::new(),
            pending: Vec::new(),
            resampler: None,
        }
    }

    /// Accept audio decoded at `input_sample_rate` and store it at `sample_rate`.
    pub fn resampling(
        input_sample_rate: u32,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, SourceError> {
        let mut chunkifier = Self::new(sample_rate, channels);
        if input_sample_rate != sample_rate {
            let resampler =
                StreamResampler::new(input_sample_rate, sample_rate, chunkifier.channels)
                    .map_err(|err| SourceError::Resample(err.to_string()))?;
            chunkifier.resampler = Some(resampler);
        }
        Ok(chunkifier)
    }

    /// Seconds of audio accepted so far.
    pub fn progress(&self) -> f64 {
        let frames = self.chunks.len() * self.chunk_frames + self.current[0].len();
        frames as f64 / self.sample_rate as f64
    }

    /// Append interleaved samples. Partial frames are carried over to the next call.
    pub fn add(&mut self, interleaved: &[f32]) -> Result<(), SourceError> {
        let mut planar = vec![Vec::new(); self.channels];
        let mut samples = interleaved;
        if !self.pending.is_empty() {
            let missing = self.channels - self.pending.len();
            let take = missing.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.pending.len() < self.channels {
                return Ok(());
            }
            let frame = std::mem::take(&mut self.pending);
            push_frame(&mut planar, &frame);
        }

        let mut frames = samples.chunks_exact(self.channels);
        for frame in &mut frames {
            push_frame(&mut planar, frame);
        }
        self.pending.extend_from_slice(frames.remainder());

        let planar = match &mut self.resampler {
            Some(resampler) => resampler
                .process(&planar)
                .map_err(|err| SourceError::Resample(err.to_string()))?,
            None => planar,
        };
        self.push_planar(&planar);
        Ok(())
    }

    fn push_planar(&mut self, planar: &[Vec<f32>]) {
        let total = planar.first().map_or(0, Vec::len);
        let mut start = 0;
        while start < total {
            let room = self.chunk_frames - self.current[0].len();
            let take = room.min(total - start);
            for (current, channel) in self.current.iter_mut().zip(planar) {
                current.extend_from_slice(&channel[start..start + take]);
            }
            start += take;
            if self.current[0].len() >= self.chunk_frames {
                self.finish_chunk();
            }
        }
    }

    fn finish_chunk(&mut self) {
        if self.current[0].is_empty() {
            return;
        }
        let finished = std::mem::replace(&mut self.current, vec![Vec::new(); self.channels]);
        self.chunks.push(finished);
    }

    pub fn close(mut self, id: SourceId) -> Result<ChunkedAudio, SourceError> {
        if !self.pending.is_empty() {
            log::warn!(
                "dropping {} trailing samples that do not form a whole frame",
                self.pending.len()
            );
        }
        if let Some(resampler) = self.resampler.take() {
            let tail = resampler
                .finish()
                .map_err(|err| SourceError::Resample(err.to_string()))?;
            self.push_planar(&tail);
        }
        self.finish_chunk();

        let lengths: Vec<usize> = self.chunks.iter().map(|c| c[0].len()).collect();
        let source =
            Source::from_chunk_lengths(id, self.sample_rate, self.channels as u16, &lengths)?;

        Ok(ChunkedAudio {
            source,
            chunks: self.chunks,
        })
    }
}

fn push_frame(planar: &mut [Vec<f32>], frame: &[f32]) {
    for (channel, &sample) in planar.iter_mut().zip(frame) {
        channel.push(sample);
    }
}
