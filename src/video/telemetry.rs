//! Frame-rate telemetry
//!
//! Measures the delivery rate of completed buffers over fixed windows.
//! Purely observational: nothing here feeds back into buffer handling.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Default measurement window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

/// Default number of windows closed before samples are emitted
pub const DEFAULT_WARMUP_WINDOWS: u32 = 10;

/// One closed measurement window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FpsSample {
    pub frames: u64,
    pub elapsed_ms: u64,
    pub fps: f64,
}

/// Windowed frame-rate meter
#[derive(Debug)]
pub struct FpsMeter {
    window: Duration,
    warmup_windows: u32,
    last: Option<Instant>,
    frames: u64,
    accumulated: Duration,
    windows_closed: u32,
}

impl FpsMeter {
    pub fn new(window: Duration, warmup_windows: u32) -> Self {
        Self {
            window,
            warmup_windows,
            last: None,
            frames: 0,
            accumulated: Duration::ZERO,
            windows_closed: 0,
        }
    }

    /// Record a completion at `at`
    ///
    /// Returns a sample when this completion closes a window after warmup.
    pub fn record(&mut self, at: Instant) -> Option<FpsSample> {
        let interval = match self.last.replace(at) {
            Some(prev) => at.saturating_duration_since(prev),
            None => return None,
        };

        if self.accumulated >= self.window {
            let sample = FpsSample {
                frames: self.frames,
                elapsed_ms: self.accumulated.as_millis() as u64,
                fps: self.frames as f64 / self.accumulated.as_secs_f64(),
            };
            self.windows_closed = self.windows_closed.saturating_add(1);
            self.frames = 0;
            self.accumulated = Duration::ZERO;
            return (self.windows_closed >= self.warmup_windows).then_some(sample);
        }

        if !interval.is_zero() {
            self.frames += 1;
            self.accumulated += interval;
        }
        None
    }

    /// Windows closed since the last reset
    pub fn windows_closed(&self) -> u32 {
        self.windows_closed
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.frames = 0;
        self.accumulated = Duration::ZERO;
        self.windows_closed = 0;
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_WARMUP_WINDOWS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(meter: &mut FpsMeter, start: Instant, frames: u32, step: Duration) -> Vec<FpsSample> {
        (1..=frames)
            .filter_map(|i| meter.record(start + step * i))
            .collect()
    }

    #[test]
    fn test_samples_after_warmup() {
        let mut meter = FpsMeter::new(Duration::from_millis(100), 2);
        let start = Instant::now();
        meter.record(start);

        // 10 ms per frame, 100 ms window: a window closes every 11 frames
        let samples = drive(&mut meter, start, 44, Duration::from_millis(10));
        assert_eq!(meter.windows_closed(), 4);
        assert_eq!(samples.len(), 3);
        for sample in samples {
            assert_eq!(sample.frames, 10);
            assert!((sample.fps - 100.0).abs() < 0.5);
        }
    }

    #[test]
    fn test_zero_interval_ignored() {
        let mut meter = FpsMeter::new(Duration::from_millis(50), 0);
        let start = Instant::now();
        meter.record(start);
        meter.record(start);
        meter.record(start + Duration::from_millis(50));
        let sample = meter.record(start + Duration::from_millis(60)).unwrap();
        assert_eq!(sample.frames, 1);
    }

    #[test]
    fn test_reset() {
        let mut meter = FpsMeter::new(Duration::from_millis(10), 0);
        let start = Instant::now();
        meter.record(start);
        drive(&mut meter, start, 5, Duration::from_millis(10));
        assert!(meter.windows_closed() > 0);

        meter.reset();
        assert_eq!(meter.windows_closed(), 0);
        assert!(meter.record(start).is_none());
    }
}
