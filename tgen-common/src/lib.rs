//! Common time and measurement types shared by the tgen crates.

use std::time::{Instant, SystemTime};

mod histogram;
mod jitter;

pub use histogram::TimeHistogram;
pub use jitter::Jitter;

/// Time in seconds, as used by the timer wheel and aging logic.
pub type Dsec = f64;

/// Returns the current UNIX timestamp in microseconds.
#[inline]
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}

/// Returns seconds elapsed since an arbitrary process-local epoch.
///
/// Monotonic; safe to feed into [`Dsec`] comparisons on the data path.
#[inline]
pub fn now_sec() -> Dsec {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_secs_f64()
}
