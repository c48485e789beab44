mod common;

use common::{Harness, RATE, clip, project};
use deck_engine::{EngineConfig, EngineEvent, RequestError};
use deck_project::ProjectStore;
use deck_transport::{ClipId, Source, SourceId, TrackId};

fn count(events: &[EngineEvent], event: EngineEvent) -> usize {
    events.iter().filter(|e| **e == event).count()
}

fn ten_second_tone() -> Harness {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    h.engine
        .set_project(Some(project([clip(1, 1, "tone", 1, 0.0, 10.0)])));
    h.settle();
    h
}

#[test]
fn test_metadata_and_readiness_events() {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    h.engine
        .set_project(Some(project([clip(1, 1, "tone", 1, 0.0, 10.0)])));

    assert!(h.engine.duration().is_nan());
    assert!(!h.engine.has_metadata());
    assert!(h.engine.drain_events().is_empty());

    h.settle();
    assert_eq!(h.engine.duration(), 10.0);
    assert_eq!(h.engine.content_duration(), 10.0);
    assert!(h.engine.can_play());
    assert_eq!(
        h.engine.drain_events(),
        vec![
            EngineEvent::DurationChange,
            EngineEvent::LoadedMetadata,
            EngineEvent::CanPlay
        ]
    );
    assert_eq!(h.store.metadata_loads(), 1);
}

#[test]
fn test_play_to_end() {
    let mut h = ten_second_tone();

    let mut request = h.engine.play();
    assert_eq!(request.try_outcome(), Some(Ok(())));
    assert!(!h.engine.paused());
    assert!(!h.engine.waiting());
    assert!(h.engine.chunked_clip(ClipId(1)).unwrap().is_primed(0.0, 0.0));
    h.engine.drain_events();

    h.advance_to(5.0);
    assert_eq!(h.engine.current_time(), 5.0);

    h.advance_to(9.999);
    let events = h.engine.drain_events();
    assert_eq!(count(&events, EngineEvent::Ended), 0);
    assert!(!h.engine.paused());

    h.advance_to(10.0);
    let events = h.engine.drain_events();
    assert_eq!(count(&events, EngineEvent::Ended), 1);
    assert_eq!(count(&events, EngineEvent::Pause), 1);
    assert!(h.engine.paused());
    assert!(h.engine.ended());
    assert_eq!(h.engine.current_time(), 10.0);

    h.advance_to(11.0);
    assert!(h.engine.drain_events().is_empty());
}

#[test]
fn test_play_at_end_restarts() {
    let mut h = ten_second_tone();
    let _ = h.engine.play();
    h.advance_to(10.0);
    assert_eq!(h.engine.current_time(), 10.0);

    let mut request = h.engine.play();
    assert_eq!(request.try_outcome(), None);
    h.settle();
    assert_eq!(request.try_outcome(), Some(Ok(())));
    assert_eq!(h.engine.current_time(), 0.0);

    h.advance_to(12.0);
    assert_eq!(h.engine.current_time(), 2.0);
}

#[test]
fn test_play_waits_for_loads() {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    h.engine
        .set_project(Some(project([clip(1, 1, "tone", 1, 0.0, 10.0)])));

    let mut request = h.engine.play();
    assert!(!h.engine.paused());
    assert!(h.engine.waiting());
    assert_eq!(request.try_outcome(), None);

    h.settle();
    assert!(!h.engine.waiting());
    assert_eq!(request.try_outcome(), Some(Ok(())));
}

#[test]
fn test_second_play_supersedes_first() {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    h.engine
        .set_project(Some(project([clip(1, 1, "tone", 1, 0.0, 10.0)])));

    let mut first = h.engine.play();
    let mut second = h.engine.play();
    assert_eq!(first.try_outcome(), Some(Err(RequestError::Cancelled)));

    h.settle();
    assert_eq!(second.try_outcome(), Some(Ok(())));
}

#[test]
fn test_pause_cancels_pending_play() {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    h.engine
        .set_project(Some(project([clip(1, 1, "tone", 1, 0.0, 10.0)])));

    let mut request = h.engine.play();
    h.engine.pause();
    assert_eq!(request.try_outcome(), Some(Err(RequestError::Cancelled)));
    assert!(h.engine.paused());
    assert!(!h.engine.waiting());
}

#[test]
fn test_pause_now_keeps_position() {
    let mut h = ten_second_tone();
    let _ = h.engine.play();
    h.advance_to(3.0);
    h.engine.drain_events();

    h.engine.pause();
    assert!(h.engine.paused());
    assert_eq!(h.engine.current_time(), 3.0);
    assert_eq!(h.engine.drain_events(), vec![EngineEvent::Pause]);
    assert!(h.engine.chunked_clip(ClipId(1)).unwrap().live_nodes().is_empty());

    h.advance_to(5.0);
    assert_eq!(h.engine.current_time(), 3.0);
}

#[test]
fn test_deferred_pause_then_play_ends_once() {
    let mut h = ten_second_tone();
    let _ = h.engine.play();
    h.advance_to(2.0);

    h.engine.pause_at(5.0);
    assert!(!h.engine.paused());
    let mut again = h.engine.play();
    assert_eq!(again.try_outcome(), Some(Ok(())));
    h.engine.drain_events();

    h.advance_to(4.0);
    assert!(!h.engine.paused());
    assert_eq!(h.engine.current_time(), 4.0);

    h.advance_to(5.0);
    h.advance_to(8.0);
    let events = h.engine.drain_events();
    assert_eq!(count(&events, EngineEvent::Ended), 1);
    assert!(h.engine.paused());
    assert_eq!(h.engine.current_time(), 5.0);
}

#[test]
fn test_out_of_range_seek_is_ignored() {
    let mut h = ten_second_tone();
    h.engine.drain_events();

    h.engine.set_current_time(-1.0);
    h.engine.set_current_time(10.5);
    h.engine.set_current_time(f64::NAN);
    assert_eq!(h.engine.current_time(), 0.0);
    assert!(h.engine.drain_events().is_empty());

    h.engine.set_current_time(4.0);
    assert_eq!(h.engine.current_time(), 4.0);
    assert_eq!(h.engine.drain_events(), vec![EngineEvent::TimeUpdate]);
}

#[test]
fn test_seek_while_playing() {
    let mut h = ten_second_tone();
    let _ = h.engine.play();
    h.advance_to(1.0);

    h.engine.set_current_time(6.0);
    assert!(!h.engine.paused());
    assert_eq!(h.engine.current_time(), 6.0);
    h.settle();
    assert!(!h.engine.waiting());

    h.advance_to(3.0);
    assert_eq!(h.engine.current_time(), 8.0);
    h.advance_to(5.0);
    assert!(h.engine.paused());
    assert_eq!(h.engine.current_time(), 10.0);
}

#[test]
fn test_max_duration_clamps() {
    let mut h = ten_second_tone();
    h.engine.drain_events();

    h.engine.set_max_duration(4.0).unwrap();
    assert_eq!(h.engine.duration(), 4.0);
    assert_eq!(h.engine.content_duration(), 10.0);
    assert_eq!(h.engine.drain_events(), vec![EngineEvent::DurationChange]);

    let _ = h.engine.play();
    h.advance_to(4.0);
    assert!(h.engine.paused());
    assert_eq!(h.engine.current_time(), 4.0);
}

#[test]
fn test_missing_source_retries_on_next_project() {
    let mut h = Harness::new();
    let clips = [clip(1, 1, "late", 1, 0.0, 3.0)];
    h.engine.set_project(Some(project(clips.clone())));
    h.settle();
    assert!(!h.engine.has_metadata());
    assert!(h.engine.duration().is_nan());
    assert!(!h.engine.can_play());

    h.add_source("late", 3, 1, 0.5);
    h.engine.set_project(Some(project(clips)));
    h.settle();
    assert!(h.engine.has_metadata());
    assert_eq!(h.engine.duration(), 3.0);
    assert!(h.engine.can_play());
    assert_eq!(h.store.metadata_loads(), 2);
}

#[test]
fn test_malformed_source_metadata_is_a_load_failure() {
    let mut h = Harness::new();
    let id = SourceId::new("broken");
    let mut source = Source::from_chunk_lengths(id.clone(), RATE, 1, &[RATE as usize; 3]).unwrap();
    source.channels_per_frame = 0;
    h.store.insert_source(source);

    h.engine
        .set_project(Some(project([clip(1, 1, "broken", 1, 0.0, 3.0)])));
    h.settle();
    assert!(!h.engine.has_metadata());
    assert!(h.engine.duration().is_nan());
    assert!(!h.engine.can_play());
    assert!(h.engine.chunked_clip(ClipId(1)).is_none());
    assert_eq!(h.store.chunk_loads(), 0);
}

#[test]
fn test_failed_chunks_keep_engine_waiting() {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    h.store.fail_chunks(true);
    h.engine
        .set_project(Some(project([clip(1, 1, "tone", 1, 0.0, 10.0)])));
    h.settle();
    assert!(h.engine.has_metadata());
    assert!(!h.engine.can_play());

    h.store.fail_chunks(false);
    h.engine.set_current_time(0.0);
    h.settle();
    assert!(h.engine.can_play());
}

#[test]
fn test_clip_offset_and_late_start() {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    let mut late = clip(1, 1, "tone", 1, 2.0, 3.0);
    late.offset = 4.0;
    h.engine.set_project(Some(project([late])));
    h.settle();
    assert_eq!(h.engine.duration(), 5.0);
    assert!(h.engine.chunked_clip(ClipId(1)).unwrap().is_primed(4.0, 4.0));

    let _ = h.engine.play();
    let chunked = h.engine.chunked_clip(ClipId(1)).unwrap();
    assert!(chunked.is_scheduled(0.0));
    assert!(!chunked.playing(0.0));
    assert!(chunked.playing(2.0));
}

#[test]
fn test_disabled_clip_is_ignored() {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    let mut disabled = clip(2, 1, "tone", 1, 0.0, 10.0);
    disabled.enabled = false;
    h.engine
        .set_project(Some(project([clip(1, 1, "tone", 1, 0.0, 4.0), disabled])));
    h.settle();

    assert_eq!(h.engine.duration(), 4.0);
    assert!(h.engine.chunked_clip(ClipId(1)).is_some());
    assert!(h.engine.chunked_clip(ClipId(2)).is_none());
}

#[test]
fn test_follows_project_store() {
    let mut h = Harness::new();
    h.add_source("tone", 10, 1, 0.5);
    let mut projects = ProjectStore::new();
    h.engine.subscribe(projects.subscribe());

    projects.update(|p| p.with_clip(clip(1, 1, "tone", 1, 0.0, 10.0)));
    projects.update(|p| p.with_clip(clip(2, 2, "tone", 1, 0.0, 6.0)));
    h.settle();
    assert_eq!(h.engine.duration(), 10.0);
    assert!(h.engine.track_gain(TrackId(2)).is_some());

    projects.update(|p| p.without_clip(ClipId(1)));
    h.settle();
    assert_eq!(h.engine.duration(), 6.0);
    assert!(h.engine.track_gain(TrackId(1)).is_none());
    assert!(h.engine.chunked_clip(ClipId(1)).is_none());
}

#[test]
fn test_destroy_while_playing_releases_everything() {
    let mut h = Harness::with_config(
        EngineConfig {
            lookahead_secs: 2.0,
            ..EngineConfig::default()
        },
        2,
    );
    h.add_source("tone", 10, 1, 0.5);
    h.engine
        .set_project(Some(project([clip(1, 1, "tone", 1, 0.0, 10.0)])));
    h.settle();
    let _ = h.engine.play();
    h.advance_to(0.5);

    h.store.hold();
    h.advance_to(1.5);
    assert!(h.store.in_flight() > 0);
    assert!(!h.engine.pump());

    h.engine.destroy();
    assert_eq!(h.store.in_flight(), 0);
    assert_eq!(h.engine.graph().node_count(), 1);
    assert_eq!(h.engine.graph().edge_count(), 0);
    assert!(h.engine.pump());
    assert!(h.engine.drain_events().is_empty());

    let mut request = h.engine.play();
    assert_eq!(request.try_outcome(), Some(Err(RequestError::Cancelled)));
    h.store.release();
}
