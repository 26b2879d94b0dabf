use std::fmt;

use serde::Serialize;

use crate::Dsec;

const BUCKET_STEPS: usize = 9;
const DECADES: usize = 5;
const WINDOW_SLOTS: usize = 10;

/// Latency histogram with exponential buckets.
///
/// Samples below 10 microseconds only feed the running average; everything
/// above lands in one of `DECADES` x `BUCKET_STEPS` buckets (10us, 20us, ..
/// 90us, 100us, 200us, ..). A short ring of per-window maxima backs the
/// "max latency over the last N windows" reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TimeHistogram {
    /// Smallest latency tracked by the buckets, in seconds.
    min_delta: Dsec,
    cnt: u64,
    high_cnt: u64,
    max_dt: Dsec,
    /// Max latency inside the current window, reset by [`update`](Self::update).
    window_max: Dsec,
    average: Dsec,
    sum: Dsec,
    histogram: Vec<u64>,
    max_win: [Dsec; WINDOW_SLOTS],
    win_idx: usize,
}

impl Default for TimeHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeHistogram {
    pub fn new() -> Self {
        Self {
            min_delta: 10.0 / 1_000_000.0,
            cnt: 0,
            high_cnt: 0,
            max_dt: 0.0,
            window_max: 0.0,
            average: 0.0,
            sum: 0.0,
            histogram: vec![0; DECADES * BUCKET_STEPS],
            max_win: [0.0; WINDOW_SLOTS],
            win_idx: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record one sample, in seconds.
    pub fn add(&mut self, dt: Dsec) {
        self.cnt += 1;
        self.sum += dt;
        if dt > self.max_dt {
            self.max_dt = dt;
        }
        if dt > self.window_max {
            self.window_max = dt;
        }
        if dt < self.min_delta {
            return;
        }
        self.high_cnt += 1;

        let mut d = dt / self.min_delta;
        for decade in 0..DECADES {
            if d < 10.0 {
                let step = (d as usize).clamp(1, BUCKET_STEPS) - 1;
                self.histogram[decade * BUCKET_STEPS + step] += 1;
                return;
            }
            d /= 10.0;
        }
        // off the top of the scale, count it in the last bucket
        self.histogram[DECADES * BUCKET_STEPS - 1] += 1;
    }

    /// Close the current measurement window: refresh the running average and
    /// rotate the per-window max ring.
    pub fn update(&mut self) {
        self.max_win[self.win_idx] = self.window_max;
        self.win_idx = (self.win_idx + 1) % WINDOW_SLOTS;
        self.window_max = 0.0;

        if self.cnt > 0 {
            let win_avg = self.sum / self.cnt as f64;
            self.average = if self.average == 0.0 {
                win_avg
            } else {
                (self.average + win_avg) / 2.0
            };
        }
        self.sum = 0.0;
        self.cnt = 0;
    }

    /// Average latency in microseconds.
    pub fn average_usec(&self) -> f64 {
        self.average * 1_000_000.0
    }

    /// Highest latency ever observed, in microseconds.
    pub fn max_usec(&self) -> f64 {
        self.max_dt * 1_000_000.0
    }

    /// Highest latency over the retained windows, in microseconds.
    pub fn max_win_usec(&self) -> f64 {
        self.max_win.iter().copied().fold(0.0, f64::max) * 1_000_000.0
    }

    pub fn sample_count(&self) -> u64 {
        self.high_cnt
    }
}

impl fmt::Display for TimeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            " avg/max latency usec: {:.0}/{:.0}  win-max: {:.0}",
            self.average_usec(),
            self.max_usec(),
            self.max_win_usec()
        )?;
        for decade in 0..DECADES {
            for step in 0..BUCKET_STEPS {
                let cnt = self.histogram[decade * BUCKET_STEPS + step];
                if cnt > 0 {
                    let low = 10u64.pow(decade as u32 + 1) * (step as u64 + 1);
                    writeln!(f, "   {:>9} usec: {}", low, cnt)?;
                }
            }
        }
        Ok(())
    }
}
