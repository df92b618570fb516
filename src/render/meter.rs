//! Frame accounting for the render thread

use std::time::{Duration, Instant};

use super::FrameStats;

/// Totals over one reporting window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub fps: f64,
    pub frames: u32,
    /// Mean windows drawn per frame
    pub drawn_per_frame: f64,
    pub skipped: usize,
}

/// Accumulates per-frame stats and yields a report once per interval
pub struct FrameMeter {
    interval: Duration,
    window_start: Instant,
    frames: u32,
    drawn: usize,
    skipped: usize,
    total_frames: u64,
}

impl FrameMeter {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    fn starting_at(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            window_start: start,
            frames: 0,
            drawn: 0,
            skipped: 0,
            total_frames: 0,
        }
    }

    pub fn record(&mut self, stats: FrameStats) -> Option<FrameReport> {
        self.record_at(stats, Instant::now())
    }

    fn record_at(&mut self, stats: FrameStats, now: Instant) -> Option<FrameReport> {
        self.frames += 1;
        self.total_frames += 1;
        self.drawn += stats.drawn;
        self.skipped += stats.skipped;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }

        let report = FrameReport {
            fps: self.frames as f64 / elapsed.as_secs_f64(),
            frames: self.frames,
            drawn_per_frame: self.drawn as f64 / self.frames as f64,
            skipped: self.skipped,
        };
        *self = Self {
            total_frames: self.total_frames,
            ..Self::starting_at(self.interval, now)
        };
        Some(report)
    }

    /// Frames presented since the meter was created
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_covers_one_interval() {
        let start = Instant::now();
        let mut meter = FrameMeter::starting_at(Duration::from_secs(1), start);
        let stats = FrameStats { drawn: 3, skipped: 1 };

        for i in 1..10 {
            assert!(meter.record_at(stats, start + Duration::from_millis(i * 100)).is_none());
        }
        let report = meter.record_at(stats, start + Duration::from_secs(1)).unwrap();

        assert_eq!(report.frames, 10);
        assert!((report.fps - 10.0).abs() < 1e-9);
        assert!((report.drawn_per_frame - 3.0).abs() < 1e-9);
        assert_eq!(report.skipped, 10);
    }

    #[test]
    fn test_counts_restart_after_report_but_total_does_not() {
        let start = Instant::now();
        let mut meter = FrameMeter::starting_at(Duration::from_millis(500), start);

        meter.record_at(FrameStats::default(), start + Duration::from_millis(600)).unwrap();
        assert!(meter.record_at(FrameStats::default(), start + Duration::from_millis(700)).is_none());

        assert_eq!(meter.frames, 1);
        assert_eq!(meter.total_frames(), 2);
    }
}
