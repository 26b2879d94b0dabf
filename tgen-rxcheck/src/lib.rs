//! Traffic verification for tgen.
//!
//! The TX side stamps every generated packet with an in-band
//! [`RxMarker`](tgen_wire::RxMarker); this crate's [`RxCheckEngine`] consumes
//! the markers on the receive side and verifies per-direction sequencing,
//! duplication, drops and flow aging, reporting everything through counters.

mod engine;
mod flow;
mod stats;

pub use engine::{RxCheckEngine, TemplateInfo, MAX_TEMPLATE_STATS};
pub use flow::{DirRecord, RxCheckFlow};
pub use stats::RxCheckStats;
