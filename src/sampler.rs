//! Frame-skip sampling strategies.

use std::time::{Duration, Instant};

/// Decides which acquired frames go to inference.
pub trait FrameSampler: Send {
    /// `frame_counter` is the 1-based count of frames acquired this session.
    fn should_sample(&mut self, frame_counter: u64) -> bool;

    /// Forget timing state at session start.
    fn reset(&mut self) {}
}

/// Sample every `n`-th frame (`frame_counter % n == 0`).
#[derive(Clone, Copy, Debug)]
pub struct EveryNth {
    n: u64,
}

impl EveryNth {
    pub fn new(n: u64) -> Self {
        Self { n: n.max(1) }
    }
}

impl FrameSampler for EveryNth {
    fn should_sample(&mut self, frame_counter: u64) -> bool {
        frame_counter % self.n == 0
    }
}

/// Sample at most once per `interval` of wall-clock time.
#[derive(Clone, Debug)]
pub struct IntervalSampler {
    interval: Duration,
    last: Option<Instant>,
}

impl IntervalSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }
}

impl FrameSampler for IntervalSampler {
    fn should_sample(&mut self, _frame_counter: u64) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_nth_samples_floor_n_over_skip() {
        for (frames, skip) in [(12u64, 4u64), (13, 4), (3, 4), (10, 1), (100, 7)] {
            let mut sampler = EveryNth::new(skip);
            let sampled = (1..=frames).filter(|&c| sampler.should_sample(c)).count() as u64;
            assert_eq!(sampled, frames / skip, "frames={frames} skip={skip}");
        }
    }

    #[test]
    fn zero_skip_is_treated_as_one() {
        let mut sampler = EveryNth::new(0);
        assert!(sampler.should_sample(1));
    }

    #[test]
    fn interval_sampler_throttles() {
        let mut sampler = IntervalSampler::new(Duration::from_secs(60));
        assert!(sampler.should_sample(1));
        assert!(!sampler.should_sample(2));
        sampler.reset();
        assert!(sampler.should_sample(3));
    }
}
