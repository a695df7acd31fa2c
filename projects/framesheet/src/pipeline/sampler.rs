// Time sampler: turns (fps, range, cap, duration) into sample timestamps.

use serde::Serialize;

/// One timestamp at which a still frame is pulled from the video.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameSample {
    pub index: usize,
    pub timestamp_sec: f64,
}

/// Clamped sampling window. Iterating it yields a finite, ordered sequence
/// and can be restarted any number of times.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSampler {
    start_sec: f64,
    end_sec: f64,
    fps: f64,
    max_frames: usize,
}

impl TimeSampler {
    pub fn new(
        fps: u32,
        start_sec: f64,
        end_sec: Option<f64>,
        max_frames: u32,
        duration_sec: f64,
    ) -> Self {
        let duration = if duration_sec.is_finite() && duration_sec > 0.0 {
            duration_sec
        } else {
            0.0
        };

        let start = if start_sec.is_finite() {
            start_sec.clamp(0.0, duration)
        } else {
            0.0
        };

        // Absent or non-positive end means "until the end of the video".
        let end = match end_sec {
            Some(e) if e.is_finite() && e > 0.0 => e.clamp(start, duration),
            _ => duration,
        };

        Self {
            start_sec: start,
            end_sec: end,
            fps: fps.max(1) as f64,
            max_frames: max_frames as usize,
        }
    }

    pub fn start_sec(&self) -> f64 {
        self.start_sec
    }

    pub fn end_sec(&self) -> f64 {
        self.end_sec
    }

    pub fn iter(&self) -> Samples {
        Samples {
            sampler: *self,
            next_index: 0,
        }
    }

    pub fn collect(&self) -> Vec<FrameSample> {
        self.iter().collect()
    }
}

impl IntoIterator for &TimeSampler {
    type Item = FrameSample;
    type IntoIter = Samples;

    fn into_iter(self) -> Samples {
        self.iter()
    }
}

pub struct Samples {
    sampler: TimeSampler,
    next_index: usize,
}

impl Iterator for Samples {
    type Item = FrameSample;

    fn next(&mut self) -> Option<FrameSample> {
        let s = &self.sampler;
        if self.next_index >= s.max_frames {
            return None;
        }

        // Offsets are computed from the index rather than accumulated so
        // that float drift never adds or drops a sample at the boundary.
        let t = s.start_sec + self.next_index as f64 / s.fps;
        if t >= s.end_sec {
            return None;
        }

        let sample = FrameSample {
            index: self.next_index,
            timestamp_sec: t,
        };
        self.next_index += 1;
        Some(sample)
    }
}
