use std::time::{Duration, Instant};

/// One window of `frame_rate` recorded video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputSample {
    pub frames: u32,
    pub consumed: Duration,
    /// 1-based index of the window, i.e. seconds of video pushed so far.
    pub second: u64,
    pub average: Duration,
}

/// Counts recorded video frames and reports how long each second of video took.
#[derive(Debug)]
pub struct ThroughputMeter {
    frame_rate: u32,
    frames: u32,
    window_start: Instant,
    seconds: u64,
    total: Duration,
}

impl ThroughputMeter {
    pub fn new(frame_rate: u32, now: Instant) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
            frames: 0,
            window_start: now,
            seconds: 0,
            total: Duration::ZERO,
        }
    }

    /// Accounts one recorded frame; audio frames never close a window.
    pub fn record(&mut self, is_video: bool, now: Instant) -> Option<ThroughputSample> {
        if is_video {
            self.frames += 1;
        }
        if self.frames < self.frame_rate {
            return None;
        }

        let consumed = now.saturating_duration_since(self.window_start);
        self.seconds += 1;
        self.total += consumed;
        let sample = ThroughputSample {
            frames: self.frames,
            consumed,
            second: self.seconds,
            average: self.total / self.seconds as u32,
        };

        self.frames = 0;
        self.window_start = now;
        Some(sample)
    }
}
