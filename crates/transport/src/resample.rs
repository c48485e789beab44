use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Input frames handed to the sinc filter per call.
const BLOCK_FRAMES: usize = 1024;

/// Sinc resampler that keeps its filter state across calls.
///
/// Feed planar audio in pieces of any length with [`StreamResampler::process`]
/// and call [`StreamResampler::finish`] when the stream ends. The filter delay
/// is trimmed from the front, so output sample `n` lines up with input time
/// `n / to_sample_rate`, and the total output is `round(frames_in * ratio)`
/// frames no matter how the input was split.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    ratio: f64,
    input: Vec<Vec<f32>>,
    to_skip: usize,
    frames_in: usize,
    frames_out: usize,
}

impl StreamResampler {
    pub fn new(from_sample_rate: u32, to_sample_rate: u32, channels: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            from_sample_rate > 0 && to_sample_rate > 0,
            "sample rates must be positive"
        );
        anyhow::ensure!(channels > 0, "resampler needs at least one channel");

        let ratio = to_sample_rate as f64 / from_sample_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, BLOCK_FRAMES, channels)?;

        Ok(Self {
            to_skip: resampler.output_delay(),
            resampler,
            ratio,
            input: vec![Vec::new(); channels],
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Push planar input and return whatever output the filter can produce so far.
    pub fn process(&mut self, input: &[Vec<f32>]) -> anyhow::Result<Vec<Vec<f32>>> {
        anyhow::ensure!(
            input.len() == self.input.len(),
            "expected {} channels, got {}",
            self.input.len(),
            input.len()
        );
        let frames = input.first().map_or(0, Vec::len);
        anyhow::ensure!(
            input.iter().all(|c| c.len() == frames),
            "channels must have equal length"
        );

        for (buffered, channel) in self.input.iter_mut().zip(input) {
            buffered.extend_from_slice(channel);
        }
        self.frames_in += frames;

        let mut output = vec![Vec::new(); self.input.len()];
        let mut start = 0;
        loop {
            let needed = self.resampler.input_frames_next();
            if self.input[0].len() - start < needed {
                break;
            }
            let block: Vec<&[f32]> = self
                .input
                .iter()
                .map(|c| &c[start..start + needed])
                .collect();
            let produced = self.resampler.process(&block, None)?;
            start += needed;
            self.emit(produced, &mut output);
        }
        for buffered in &mut self.input {
            buffered.drain(..start);
        }

        Ok(output)
    }

    /// Flush the buffered input and the filter tail.
    pub fn finish(mut self) -> anyhow::Result<Vec<Vec<f32>>> {
        let expected = (self.frames_in as f64 * self.ratio).round() as usize;
        let mut output = vec![Vec::new(); self.input.len()];

        if self.input.first().is_some_and(|c| !c.is_empty()) {
            let remaining = std::mem::take(&mut self.input);
            let produced = self.resampler.process_partial(Some(&remaining), None)?;
            self.emit(produced, &mut output);
        }
        while self.frames_out < expected {
            let produced = self.resampler.process_partial::<Vec<f32>>(None, None)?;
            if produced.first().is_none_or(Vec::is_empty) {
                break;
            }
            self.emit(produced, &mut output);
        }

        let excess = self.frames_out.saturating_sub(expected);
        for channel in &mut output {
            let keep = channel.len().saturating_sub(excess);
            channel.truncate(keep);
        }
        Ok(output)
    }

    fn emit(&mut self, produced: Vec<Vec<f32>>, output: &mut [Vec<f32>]) {
        let frames = produced.first().map_or(0, Vec::len);
        let skip = self.to_skip.min(frames);
        self.to_skip -= skip;
        for (out, channel) in output.iter_mut().zip(&produced) {
            out.extend_from_slice(&channel[skip..]);
        }
        self.frames_out += frames - skip;
    }
}

/// Resample a whole planar signal in one go.
pub fn resample_channels(
    input: &[Vec<f32>],
    from_sample_rate: u32,
    to_sample_rate: u32,
) -> anyhow::Result<Vec<Vec<f32>>> {
    if from_sample_rate == to_sample_rate || input.is_empty() {
        return Ok(input.to_vec());
    }
    let mut resampler = StreamResampler::new(from_sample_rate, to_sample_rate, input.len())?;
    let mut output = resampler.process(input)?;
    for (out, tail) in output.iter_mut().zip(resampler.finish()?) {
        out.extend(tail);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(resampler: &mut StreamResampler, pieces: &[usize], value: f32) -> Vec<f32> {
        let mut out = Vec::new();
        for &frames in pieces {
            let produced = resampler.process(&[vec![value; frames]]).unwrap();
            out.extend_from_slice(&produced[0]);
        }
        out
    }

    #[test]
    fn test_output_length_follows_ratio() {
        let mut resampler = StreamResampler::new(44100, 48000, 1).unwrap();
        let mut out = run(&mut resampler, &[2000, 2410], 1.0);
        out.extend_from_slice(&resampler.finish().unwrap()[0]);
        assert_eq!(out.len(), 4800);
    }

    #[test]
    fn test_tail_is_not_zero_padded() {
        let mut resampler = StreamResampler::new(44100, 48000, 1).unwrap();
        let mut out = run(&mut resampler, &[2000, 2410], 1.0);
        out.extend_from_slice(&resampler.finish().unwrap()[0]);

        for sample in &out[200..4600] {
            approx::assert_abs_diff_eq!(*sample, 1.0, epsilon = 0.02);
        }
        // The filter tail is flushed, not padded with silence
        for sample in &out[4780..4790] {
            assert!(*sample > 0.9, "tail sample {sample}");
        }
    }

    #[test]
    fn test_split_input_matches_whole_input() {
        let signal: Vec<f32> = (0..5000).map(|i| (i as f32 * 0.01).sin()).collect();

        let whole = resample_channels(&[signal.clone()], 44100, 48000).unwrap();

        let mut resampler = StreamResampler::new(44100, 48000, 1).unwrap();
        let mut split = Vec::new();
        for piece in signal.chunks(777) {
            split.extend(resampler.process(&[piece.to_vec()]).unwrap().remove(0));
        }
        split.extend(resampler.finish().unwrap().remove(0));

        assert_eq!(whole[0].len(), split.len());
        for (a, b) in whole[0].iter().zip(&split) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_same_rate_is_passthrough() {
        let input = vec![vec![0.25; 10], vec![0.5; 10]];
        assert_eq!(resample_channels(&input, 48000, 48000).unwrap(), input);
    }

    #[test]
    fn test_rejects_channel_mismatch() {
        let mut resampler = StreamResampler::new(44100, 48000, 2).unwrap();
        assert!(resampler.process(&[vec![0.0; 10]]).is_err());
    }
}
