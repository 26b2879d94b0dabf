#![doc(issue_tracker_base_url = "https://github.com/chainbound/tgen-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Data-plane core of a high-throughput traffic generator: flow
//! classification, UDP flow lifecycle, lazy-deletion timers and in-band
//! traffic verification.

pub use tgen_common::{now_sec, unix_micros, Dsec, Jitter, TimeHistogram};
pub use tgen_flow::*;
pub use tgen_rxcheck::*;
pub use tgen_timer::{TimerHandle, TimerWheel, TimerWheelCounters};
pub use tgen_wire::*;
