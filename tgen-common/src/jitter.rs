use serde::Serialize;

use crate::Dsec;

/// RFC 3550 style jitter estimator.
///
/// Fed with per-packet transfer times; the estimate converges on the mean
/// absolute deviation with a 1/16 gain.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Jitter {
    last: Dsec,
    jitter: Dsec,
}

impl Jitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feed one transfer-time sample, in seconds.
    pub fn calc(&mut self, dtime: Dsec) {
        let d = (dtime - self.last).abs();
        self.last = dtime;
        self.jitter += (d - self.jitter) / 16.0;
    }

    /// Current estimate, in seconds.
    pub fn get_jitter(&self) -> Dsec {
        self.jitter
    }

    /// Current estimate, in whole microseconds.
    pub fn get_jitter_usec(&self) -> u32 {
        (self.jitter * 1_000_000.0) as u32
    }
}
