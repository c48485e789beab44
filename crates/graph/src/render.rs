use std::collections::HashMap;

use deck_transport::AudioBuffer;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::visit::EdgeRef;

use crate::node::NodeKind;
use crate::{AudioGraph, NodeId};

/// Planar block: channels of `frames` samples.
type Block = Vec<Vec<f32>>;

#[derive(Clone, Copy)]
enum Mixing {
    /// Mono fans out to every channel, anything folds to mono by averaging
    Speakers,
    /// Channels map one to one, extras are dropped
    Discrete,
}

/// Render `frames` frames of the graph's destination, starting at graph time
/// `start_time`. Output is interleaved at the graph's sample rate.
pub fn render(graph: &AudioGraph, start_time: f64, frames: usize) -> AudioBuffer {
    let sample_rate = graph.sample_rate();
    let channels = graph.destination_channels();

    let order = match toposort(&graph.graph, None) {
        Ok(order) => order,
        Err(cycle) => {
            log::error!("audio graph has a cycle at {:?}", cycle.node_id());
            return AudioBuffer::silent(frames, sample_rate, channels);
        }
    };

    let mut outputs: HashMap<NodeId, Vec<Block>> = HashMap::with_capacity(order.len());
    for id in order {
        let ports = process(graph, id, &outputs, start_time, frames);
        outputs.insert(id, ports);
    }

    let mut buffer = AudioBuffer::silent(frames, sample_rate, channels);
    if let Some(block) = outputs
        .remove(&graph.destination())
        .and_then(|mut ports| ports.pop())
    {
        let stride = channels as usize;
        for (c, channel) in block.iter().enumerate().take(stride) {
            for (i, sample) in channel.iter().enumerate() {
                buffer.samples[i * stride + c] = *sample;
            }
        }
    }
    buffer
}

fn process(
    graph: &AudioGraph,
    id: NodeId,
    outputs: &HashMap<NodeId, Vec<Block>>,
    start_time: f64,
    frames: usize,
) -> Vec<Block> {
    let Some(node) = graph.node(id) else {
        return Vec::new();
    };
    let sample_rate = graph.sample_rate() as f64;

    match &node.kind {
        NodeKind::Destination { channels } => {
            vec![gather(graph, id, 0, outputs, *channels as usize, frames, Mixing::Speakers)]
        }
        NodeKind::Gain { gain, channels } => {
            let count = channels
                .map(usize::from)
                .unwrap_or_else(|| widest_input(graph, id, outputs));
            let mut block = gather(graph, id, 0, outputs, count, frames, Mixing::Speakers);
            for i in 0..frames {
                let g = gain.value_at(start_time + i as f64 / sample_rate);
                for channel in block.iter_mut() {
                    channel[i] *= g;
                }
            }
            vec![block]
        }
        NodeKind::BufferSource { buffer, schedule } => {
            let mut block = vec![vec![0.0; frames]; buffer.channels()];
            if let Some(schedule) = schedule {
                let buffer_rate = buffer.sample_rate() as f64;
                let same_rate = buffer.sample_rate() == graph.sample_rate();
                let last = buffer.frames().saturating_sub(1);
                for i in 0..frames {
                    let t = start_time + i as f64 / sample_rate;
                    if !schedule.contains(t) {
                        continue;
                    }
                    let position = (schedule.offset + t - schedule.start) * buffer_rate;
                    if same_rate {
                        let index = position.round() as usize;
                        if index >= buffer.frames() {
                            continue;
                        }
                        for (c, channel) in block.iter_mut().enumerate() {
                            channel[i] = buffer.channel(c)[index];
                        }
                        continue;
                    }

                    // Linear interpolation, holding the last frame at the buffer's end
                    let index = position.floor() as usize;
                    if index >= buffer.frames() {
                        continue;
                    }
                    let frac = (position - index as f64) as f32;
                    let next = (index + 1).min(last);
                    for (c, channel) in block.iter_mut().enumerate() {
                        let samples = buffer.channel(c);
                        channel[i] = samples[index] + (samples[next] - samples[index]) * frac;
                    }
                }
            }
            vec![block]
        }
        NodeKind::ConstantSource { value, schedule } => {
            let mut block = vec![vec![0.0; frames]];
            if let Some(schedule) = schedule {
                for (i, sample) in block[0].iter_mut().enumerate() {
                    if schedule.contains(start_time + i as f64 / sample_rate) {
                        *sample = *value;
                    }
                }
            }
            vec![block]
        }
        NodeKind::Splitter { outputs: count } => {
            gather(graph, id, 0, outputs, *count as usize, frames, Mixing::Discrete)
                .into_iter()
                .map(|channel| vec![channel])
                .collect()
        }
        NodeKind::Merger { inputs } => {
            let block = (0..*inputs)
                .map(|port| {
                    gather(graph, id, port, outputs, 1, frames, Mixing::Speakers)
                        .pop()
                        .unwrap_or_else(|| vec![0.0; frames])
                })
                .collect();
            vec![block]
        }
    }
}

/// Mix everything connected to `port` of `id` into a block of `channels` channels.
fn gather(
    graph: &AudioGraph,
    id: NodeId,
    port: u16,
    outputs: &HashMap<NodeId, Vec<Block>>,
    channels: usize,
    frames: usize,
    mixing: Mixing,
) -> Block {
    let mut mixed = vec![vec![0.0; frames]; channels];
    for edge in graph.graph.edges_directed(id, Direction::Incoming) {
        let connection = edge.weight();
        if connection.input != port {
            continue;
        }
        if let Some(source) = outputs
            .get(&edge.source())
            .and_then(|ports| ports.get(connection.output as usize))
        {
            mix_into(&mut mixed, source, mixing);
        }
    }
    mixed
}

fn widest_input(graph: &AudioGraph, id: NodeId, outputs: &HashMap<NodeId, Vec<Block>>) -> usize {
    graph
        .graph
        .edges_directed(id, Direction::Incoming)
        .filter_map(|edge| {
            outputs
                .get(&edge.source())
                .and_then(|ports| ports.get(edge.weight().output as usize))
                .map(Vec::len)
        })
        .max()
        .unwrap_or(1)
        .max(1)
}

fn mix_into(dst: &mut Block, src: &Block, mixing: Mixing) {
    if src.is_empty() || dst.is_empty() {
        return;
    }

    let add = |d: &mut Vec<f32>, s: &[f32], scale: f32| {
        for (d, s) in d.iter_mut().zip(s) {
            *d += s * scale;
        }
    };

    match mixing {
        Mixing::Speakers if src.len() != dst.len() && src.len() == 1 => {
            for d in dst.iter_mut() {
                add(d, &src[0], 1.0);
            }
        }
        Mixing::Speakers if src.len() != dst.len() && dst.len() == 1 => {
            let scale = 1.0 / src.len() as f32;
            for s in src {
                add(&mut dst[0], s, scale);
            }
        }
        _ => {
            for (d, s) in dst.iter_mut().zip(src) {
                add(d, s, 1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use deck_transport::ChunkBuffer;

    use super::*;
    use crate::ManualClock;

    const RATE: u32 = 100;

    fn graph(channels: u16) -> AudioGraph {
        AudioGraph::new(Arc::new(ManualClock::new()), RATE, channels)
    }

    fn ramp_buffer(frames: usize) -> Arc<ChunkBuffer> {
        let samples = (0..frames).map(|i| i as f32).collect();
        Arc::new(ChunkBuffer::from_channels(vec![samples], RATE))
    }

    fn channel(buffer: &AudioBuffer, c: usize) -> Vec<f32> {
        buffer
            .samples
            .iter()
            .skip(c)
            .step_by(buffer.channels as usize)
            .copied()
            .collect()
    }

    #[test]
    fn test_unscheduled_source_is_silent() {
        let mut g = graph(1);
        let source = g.create_buffer_source(ramp_buffer(10));
        g.connect(source, g.destination()).unwrap();
        let out = render(&g, 0.0, 10);
        assert!(out.samples.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_scheduled_source_with_offset() {
        let mut g = graph(1);
        let source = g.create_buffer_source(ramp_buffer(10));
        g.connect(source, g.destination()).unwrap();
        // start at frame 2, skip 3 frames of the buffer, play 4 frames
        g.start_source(source, 0.02, 0.03, 0.04).unwrap();

        let out = render(&g, 0.0, 8);
        assert_eq!(out.samples, vec![0.0, 0.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mono_source_fans_out_to_stereo() {
        let mut g = graph(2);
        let source = g.create_buffer_source(ramp_buffer(4));
        let gain = g.create_gain(0.5);
        g.connect(source, gain).unwrap();
        g.connect(gain, g.destination()).unwrap();
        g.start_source(source, 0.0, 0.0, 1.0).unwrap();

        let out = render(&g, 0.0, 4);
        assert_eq!(channel(&out, 0), vec![0.0, 0.5, 1.0, 1.5]);
        assert_eq!(channel(&out, 1), vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_explicit_mono_gain_downmixes() {
        let mut g = graph(1);
        let stereo = Arc::new(ChunkBuffer::from_channels(vec![vec![1.0; 4], vec![0.0; 4]], RATE));
        let source = g.create_buffer_source(stereo);
        let gain = g.create_gain(1.0);
        g.set_channel_count(gain, Some(1)).unwrap();
        g.connect(source, gain).unwrap();
        g.connect(gain, g.destination()).unwrap();
        g.start_source(source, 0.0, 0.0, 1.0).unwrap();

        let out = render(&g, 0.0, 4);
        assert_eq!(out.samples, vec![0.5; 4]);
    }

    #[test]
    fn test_gain_ramp_is_applied_per_frame() {
        let mut g = graph(1);
        let constant = Arc::new(ChunkBuffer::from_channels(vec![vec![1.0; 10]], RATE));
        let source = g.create_buffer_source(constant);
        let gain = g.create_gain(0.0);
        g.connect(source, gain).unwrap();
        g.connect(gain, g.destination()).unwrap();
        g.start_source(source, 0.0, 0.0, 1.0).unwrap();
        g.set_gain_ramp(gain, 1.0, 0.04).unwrap();

        let out = render(&g, 0.0, 6);
        let expected = [0.0, 0.25, 0.5, 0.75, 1.0, 1.0];
        for (actual, expected) in out.samples.iter().zip(expected) {
            assert_relative_eq!(*actual, expected);
        }
    }

    #[test]
    fn test_lower_rate_buffer_is_interpolated() {
        let mut g = graph(1);
        let half_rate = Arc::new(ChunkBuffer::from_channels(vec![vec![0.0, 2.0, 4.0, 6.0]], RATE / 2));
        let source = g.create_buffer_source(half_rate);
        g.connect(source, g.destination()).unwrap();
        g.start_source(source, 0.0, 0.0, 0.08).unwrap();

        let out = render(&g, 0.0, 8);
        let expected = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 6.0];
        for (actual, expected) in out.samples.iter().zip(expected) {
            assert_relative_eq!(*actual, expected, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_render_continues_across_blocks() {
        let mut g = graph(1);
        let source = g.create_buffer_source(ramp_buffer(10));
        g.connect(source, g.destination()).unwrap();
        g.start_source(source, 0.0, 0.0, 0.1).unwrap();

        let first = render(&g, 0.0, 5);
        let second = render(&g, 0.05, 5);
        assert_eq!(first.samples, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(second.samples, vec![5.0, 6.0, 7.0, 8.0, 9.0]);
    }
}
