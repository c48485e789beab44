use basedrop::{Collector, Handle, Shared};
use cpal::{
    FromSample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use deck_graph::{AudioGraph, Clock, FrameClock, render};
use deck_transport::AudioBuffer;

type SharedGraph = Shared<AudioGraph>;

/// A running output stream that renders the most recently published graph.
///
/// The stream owns a [`FrameClock`] that advances with every rendered block,
/// so graphs built on [`DeviceOutput::clock`] schedule against the device.
pub struct DeviceOutput {
    graphs: rtrb::Producer<SharedGraph>,
    collector: Collector,
    handle: Handle,
    clock: FrameClock,
    channels: u16,
    _stream: cpal::Stream,
}

impl DeviceOutput {
    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Hand a snapshot of `graph` to the audio thread. Returns false if the
    /// stream hasn't caught up with earlier snapshots yet.
    pub fn publish(&mut self, graph: &AudioGraph) -> bool {
        let shared = Shared::new(&self.handle, graph.clone());
        match self.graphs.push(shared) {
            Ok(()) => true,
            Err(_) => {
                log::trace!("graph queue full, dropping snapshot");
                false
            }
        }
    }

    /// Free graphs the audio thread has let go of.
    pub fn collect(&mut self) {
        self.collector.collect();
    }
}

/// Open the default output device and start streaming silence until a graph is published.
pub fn start() -> anyhow::Result<DeviceOutput> {
    let collector = Collector::new();
    let handle = collector.handle();

    let (graph_tx, graph_rx) = rtrb::RingBuffer::<SharedGraph>::new(4);

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device found"))?;

    let config = device.default_output_config()?;
    let clock = FrameClock::new(config.sample_rate().0);
    let channels = config.channels();

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &config.into(), clock.clone(), graph_rx)?
        }
        sample_format => anyhow::bail!("unsupported sample format '{sample_format}'"),
    };

    stream.play()?;
    log::info!(
        "output stream started: {} Hz, {channels} channels",
        clock.sample_rate()
    );

    Ok(DeviceOutput {
        graphs: graph_tx,
        collector,
        handle,
        clock,
        channels,
        _stream: stream,
    })
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    clock: FrameClock,
    mut graph_rx: rtrb::Consumer<SharedGraph>,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let output_channels = config.channels as usize;
    let mut current: Option<SharedGraph> = None;

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // Swap in the newest graph (lock-free)
            while let Ok(graph) = graph_rx.pop() {
                current = Some(graph);
            }

            let frames = data.len() / output_channels;
            match &current {
                Some(graph) => {
                    let block = render(graph, clock.now(), frames);
                    write_frames(data, output_channels, &block);
                }
                None => {
                    for sample in data.iter_mut() {
                        *sample = T::from_sample(0.0);
                    }
                }
            }
            clock.advance(frames as u64);
        },
        |err| log::error!("stream error: {err}"),
        None,
    )?;

    Ok(stream)
}

/// Copy an interleaved block into a device buffer, wrapping channels when the
/// device has more than the block.
fn write_frames<T>(data: &mut [T], output_channels: usize, block: &AudioBuffer)
where
    T: SizedSample + FromSample<f32>,
{
    let block_channels = block.channels as usize;
    for (index, frame) in data.chunks_mut(output_channels).enumerate() {
        for (ch, sample) in frame.iter_mut().enumerate() {
            let value = if block_channels == 0 {
                0.0
            } else {
                block
                    .samples
                    .get(index * block_channels + ch % block_channels)
                    .copied()
                    .unwrap_or(0.0)
            };
            *sample = T::from_sample(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_frames_matching_channels() {
        let block = AudioBuffer {
            samples: vec![0.1, 0.2, 0.3, 0.4],
            sample_rate: 48000,
            channels: 2,
        };
        let mut data = [0.0f32; 4];
        write_frames(&mut data, 2, &block);
        assert_eq!(data, [0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_write_frames_wraps_mono() {
        let block = AudioBuffer {
            samples: vec![0.5, -0.5],
            sample_rate: 48000,
            channels: 1,
        };
        let mut data = [1.0f32; 4];
        write_frames(&mut data, 2, &block);
        assert_eq!(data, [0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_write_frames_short_block_is_silent() {
        let block = AudioBuffer::silent(0, 48000, 2);
        let mut data = [1.0f32; 4];
        write_frames(&mut data, 2, &block);
        assert_eq!(data, [0.0; 4]);
    }
}
