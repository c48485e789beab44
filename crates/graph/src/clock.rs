use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic time source for a graph, in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Clock moved by hand. Used for tests and offline rendering.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    seconds: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds: f64) {
        self.seconds.store(seconds.to_bits(), Ordering::Release);
    }

    pub fn advance(&self, seconds: f64) {
        let _ = self
            .seconds
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + seconds).to_bits())
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.seconds.load(Ordering::Acquire))
    }
}

/// Clock driven by an output device: counts rendered frames.
#[derive(Debug, Clone)]
pub struct FrameClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Clock for FrameClock {
    fn now(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0.0);
        clock.advance(0.25);
        clock.advance(0.25);
        assert_relative_eq!(clock.now(), 0.5);
        clock.set(3.0);
        assert_eq!(clock.now(), 3.0);

        let shared = clock.clone();
        shared.advance(1.0);
        assert_eq!(clock.now(), 4.0);
    }

    #[test]
    fn test_frame_clock() {
        let clock = FrameClock::new(48000);
        clock.advance(24000);
        assert_relative_eq!(clock.now(), 0.5);
        assert_eq!(clock.frames(), 24000);
    }
}
