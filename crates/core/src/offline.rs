use std::sync::Arc;

use deck_engine::{Engine, EngineConfig};
use deck_graph::{AudioGraph, ManualClock, render};
use deck_project::ProjectSnapshot;
use deck_store::ChunkStore;
use deck_transport::AudioBuffer;
use futures::executor::block_on;
use futures::future::poll_fn;

const BLOCK_FRAMES: usize = 512;

/// Render a whole project into memory.
///
/// Every chunk is loaded before playback starts, and time only moves as fast
/// as blocks are rendered, so the result doesn't depend on load latency.
pub fn render_offline(
    project: Arc<ProjectSnapshot>,
    store: Arc<dyn ChunkStore>,
    config: EngineConfig,
    sample_rate: u32,
    channels: u16,
) -> anyhow::Result<AudioBuffer> {
    let clock = ManualClock::new();
    let graph = AudioGraph::new(Arc::new(clock.clone()), sample_rate, channels);
    let config = EngineConfig {
        offline: true,
        ..config
    };
    let mut engine = Engine::new(graph, store, config)?;

    engine.set_project(Some(project));
    block_on(poll_fn(|cx| engine.poll_pump(cx)));

    let duration = engine.duration();
    if duration.is_nan() {
        anyhow::bail!("project references sources that could not be loaded");
    }

    let mut request = engine.play();
    block_on(poll_fn(|cx| engine.poll_pump(cx)));
    match request.try_outcome() {
        Some(Ok(())) => {}
        Some(Err(err)) => anyhow::bail!("playback did not start: {err}"),
        None if duration == 0.0 => {}
        None => anyhow::bail!("playback did not start"),
    }

    let total = (duration * sample_rate as f64).round() as usize;
    let mut output = AudioBuffer::silent(0, sample_rate, channels);
    let mut rendered = 0;
    while rendered < total {
        let frames = BLOCK_FRAMES.min(total - rendered);
        let start = rendered as f64 / sample_rate as f64;
        clock.set(start);
        engine.pump();
        engine.tick();

        output.append(&render(engine.graph(), start, frames));
        rendered += frames;
    }
    log::debug!("rendered {rendered} frames offline");

    engine.destroy();
    Ok(output)
}
