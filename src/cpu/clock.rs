//! Time-stamp counter frequency estimation
//!
//! The counter is read at the start and end of a busy-waited wall-clock
//! window. Samples whose start or end overshoot the window edges by more
//! than the allowed error are discarded; the result is the median of the
//! accepted samples.

use log::{debug, trace};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Free-running counter (the TSC on x86)
pub trait TickSource: Send + Sync {
    fn ticks(&self) -> u64;
}

/// High-resolution wall-clock timer
pub trait Stopwatch: Send + Sync {
    /// Ticks per second
    fn frequency(&self) -> u64;

    fn now(&self) -> u64;
}

/// The `rdtsc` instruction
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTsc;

impl TickSource for NativeTsc {
    #[cfg(target_arch = "x86_64")]
    fn ticks(&self) -> u64 {
        // SAFETY: rdtsc is available on every x86_64 processor
        unsafe { std::arch::x86_64::_rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn ticks(&self) -> u64 {
        0
    }
}

/// Nanosecond stopwatch over [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicStopwatch {
    origin: Instant,
}

impl Default for MonotonicStopwatch {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Stopwatch for MonotonicStopwatch {
    fn frequency(&self) -> u64 {
        1_000_000_000
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Counter and timer pair used for bus clock estimation
#[derive(Clone)]
pub struct ClockSources {
    pub counter: Arc<dyn TickSource>,
    pub stopwatch: Arc<dyn Stopwatch>,
}

impl ClockSources {
    pub fn native() -> Self {
        Self {
            counter: Arc::new(NativeTsc),
            stopwatch: Arc::new(MonotonicStopwatch::default()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    frequency: f64,
    error: f64,
}

/// Busy-wait window sampler
#[derive(Debug, Clone, Copy)]
pub struct ClockEstimator {
    pub window: Duration,
    /// Maximum relative overshoot of the window edges
    pub max_error: f64,
    pub samples: usize,
    pub max_attempts: usize,
}

impl Default for ClockEstimator {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(25),
            max_error: 0.001,
            samples: 3,
            max_attempts: 12,
        }
    }
}

impl ClockEstimator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    fn sample(&self, counter: &dyn TickSource, timer: &dyn Stopwatch) -> Option<Sample> {
        let window_ticks = (timer.frequency() as f64 * self.window.as_secs_f64()) as u64;
        if window_ticks == 0 {
            return None;
        }
        let lead = (window_ticks as f64 * 0.001).ceil() as u64;
        let time_begin = timer.now() + lead;
        let time_end = time_begin + window_ticks;

        while timer.now() < time_begin {}
        let count_begin = counter.ticks();
        let after_begin = timer.now();
        while timer.now() < time_end {}
        let count_end = counter.ticks();
        let after_end = timer.now();

        let delta = (time_end - time_begin) as f64;
        let frequency =
            count_end.wrapping_sub(count_begin) as f64 * timer.frequency() as f64 / delta;
        let error = (after_begin.saturating_sub(time_begin) as f64
            + after_end.saturating_sub(time_end) as f64)
            / delta;
        Some(Sample { frequency, error })
    }

    /// Estimated counter frequency in Hz
    pub fn estimate(&self, counter: &dyn TickSource, timer: &dyn Stopwatch) -> Option<f64> {
        let mut accepted = Vec::with_capacity(self.samples);
        let mut best: Option<Sample> = None;

        for _ in 0..self.max_attempts {
            if accepted.len() >= self.samples {
                break;
            }
            let Some(sample) = self.sample(counter, timer) else {
                return None;
            };
            trace!(
                "Counter sample {:.0} Hz, window error {:.5}",
                sample.frequency,
                sample.error
            );
            if sample.error <= self.max_error {
                accepted.push(sample.frequency);
            } else if best.map_or(true, |b| sample.error < b.error) {
                best = Some(sample);
            }
        }

        if accepted.is_empty() {
            debug!("No clock sample within error bound, using best effort");
            return best.map(|b| b.frequency).filter(|f| *f > 0.0);
        }
        accepted.sort_by(|a, b| a.total_cmp(b));
        Some(accepted[accepted.len() / 2]).filter(|f| *f > 0.0)
    }
}
