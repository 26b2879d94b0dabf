use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tgen_common::{Dsec, Jitter, TimeHistogram};
use tgen_timer::TimerWheel;
use tgen_wire::{RxMarker, MARKER_MAGIC};
use tracing::{debug, trace};

use crate::{flow::RxCheckFlow, stats::RxCheckStats};

/// Number of per-template counter slots; markers with a template id past
/// the range share the last slot.
pub const MAX_TEMPLATE_STATS: usize = 32;

/// A flow with no traffic is aged out after at least this many seconds,
/// whatever the marker declares.
const MIN_AGING_SEC: u16 = 5;

/// Aging is serviced opportunistically once per this many lookups.
const AGING_LOOKUP_MASK: u64 = 0xff;

/// Per-template receive and error accounting, with a latency jitter
/// estimate fed from the marker timestamps.
#[derive(Debug, Default, Clone)]
pub struct TemplateInfo {
    errors: u64,
    rx_pkts: u64,
    jitter: Jitter,
}

impl TemplateInfo {
    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn rx_pkts(&self) -> u64 {
        self.rx_pkts
    }

    pub fn jitter_usec(&self) -> u32 {
        self.jitter.get_jitter_usec()
    }
}

/// Verifies generated traffic from the in-band markers: per-direction
/// sequencing, duplication, drops and flow aging. Single-threaded; one
/// engine per rx worker.
#[derive(Debug)]
pub struct RxCheckEngine {
    tw: TimerWheel<u64>,
    ft: FxHashMap<u64, RxCheckFlow>,
    stats: RxCheckStats,
    hist: TimeHistogram,
    templates: Vec<TemplateInfo>,
    /// Suppresses drop/aging accounting while flushing at shutdown.
    on_drain: bool,
    cur_time: Dsec,
}

impl Default for RxCheckEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RxCheckEngine {
    pub fn new() -> Self {
        Self {
            tw: TimerWheel::new(),
            ft: FxHashMap::default(),
            stats: RxCheckStats::default(),
            hist: TimeHistogram::new(),
            templates: vec![TemplateInfo::default(); MAX_TEMPLATE_STATS],
            on_drain: false,
            cur_time: 0.0,
        }
    }

    pub fn stats(&self) -> &RxCheckStats {
        &self.stats
    }

    pub fn hist(&self) -> &TimeHistogram {
        &self.hist
    }

    pub fn active_flows(&self) -> usize {
        self.ft.len()
    }

    pub fn total_rx(&self) -> u64 {
        self.stats.total_rx
    }

    /// Accounts payload bytes carried alongside verified markers.
    pub fn add_rx_bytes(&mut self, bytes: u64) {
        self.stats.total_rx_bytes += bytes;
    }

    pub fn template(&self, id: u8) -> &TemplateInfo {
        &self.templates[Self::template_idx(id)]
    }

    fn template_mut(&mut self, id: u8) -> &mut TemplateInfo {
        &mut self.templates[Self::template_idx(id)]
    }

    fn template_idx(id: u8) -> usize {
        (id as usize).min(MAX_TEMPLATE_STATS - 1)
    }

    pub fn max_jitter_usec(&self) -> u32 {
        self.templates.iter().map(TemplateInfo::jitter_usec).max().unwrap_or(0)
    }

    /// One marker through the verifier. `now` is the worker's clock;
    /// malformed markers are counted and dropped, never propagated.
    pub fn handle_packet(&mut self, h: &RxMarker, now: Dsec) {
        self.stats.total_rx += 1;
        if h.magic != MARKER_MAGIC {
            self.stats.err_no_magic += 1;
            self.template_mut(h.template_id).errors += 1;
            return;
        }
        if u32::from(h.pkt_id) + 1 > u32::from(h.flow_size) {
            self.stats.err_wrong_pkt_id += 1;
            self.template_mut(h.template_id).errors += 1;
            return;
        }

        self.cur_time = now;

        let dt = latency_sec(now, h.time_stamp);
        self.hist.add(dt);
        let t = self.template_mut(h.template_id);
        t.jitter.calc(dt);
        t.rx_pkts += 1;

        self.stats.lookup += 1;
        let dir = h.dir();
        let mut any_err = false;

        let flow = match self.ft.entry(h.flow_id) {
            Entry::Vacant(e) => {
                let mut flow = RxCheckFlow::new(h.flow_id);
                flow.both_dir = h.both_dir();
                flow.dir[dir].set_fif_seen(h.flow_size);
                if h.is_fif() {
                    self.stats.fif += 1;
                } else {
                    // opened mid-flow, its first packet never arrived
                    self.stats.err_open_with_no_fif_pkt += 1;
                    flow.oo_err += 1;
                    any_err = true;
                }
                self.stats.add += 1;
                self.stats.active += 1;
                trace!(flow_id = h.flow_id, "flow opened");
                e.insert(flow)
            }
            Entry::Occupied(e) => {
                let flow = e.into_mut();
                self.stats.found += 1;
                let d = &mut flow.dir[dir];
                if h.is_fif() {
                    if d.is_fif_seen() {
                        flow.oo_err += 1;
                        any_err = true;
                        self.stats.err_fif_seen_twice += 1;
                        if d.flow_size != h.flow_size {
                            self.stats.err_flow_length_changed += 1;
                            flow.oo_err += 1;
                        }
                        d.pkts += 1;
                    } else {
                        // first packet of the second direction
                        d.set_fif_seen(h.flow_size);
                    }
                } else if !d.is_fif_seen() {
                    d.set_fif_seen(h.flow_size);
                } else {
                    if d.flow_size != h.flow_size {
                        self.stats.err_flow_length_changed += 1;
                        flow.oo_err += 1;
                        any_err = true;
                    }
                    let c_seq = d.seq;
                    if c_seq != h.pkt_id {
                        flow.oo_err += 1;
                        any_err = true;
                        if c_seq.wrapping_sub(1) == h.pkt_id {
                            self.stats.err_oo_dup += 1;
                        } else if c_seq < h.pkt_id {
                            // jumped ahead of the expected id: a gap
                            self.stats.err_oo_early += 1;
                        } else {
                            self.stats.err_oo_late += 1;
                        }
                    }
                    // resynchronize on whatever arrived
                    d.seq = h.pkt_id.wrapping_add(1);
                    d.pkts += 1;
                }
                flow
            }
        };

        let deadline = now + Dsec::from(h.aging_sec.max(MIN_AGING_SEC));
        self.tw.restart_timer(&mut flow.aging, deadline, h.flow_id);

        let done = flow.is_all_pkts_seen();
        if done {
            self.tw.stop_timer(&mut flow.aging);
            flow.aged_correctly = true;
        }
        if done {
            self.on_flow_end(h.flow_id);
        }
        if any_err {
            self.template_mut(h.template_id).errors += 1;
        }

        if self.stats.lookup & AGING_LOOKUP_MASK == 0 {
            let t = self.cur_time;
            self.tw_handle(t);
        }
    }

    /// Services expired aging timers up to `now`.
    pub fn tw_handle(&mut self, now: Dsec) {
        self.cur_time = now;
        let mut ended = Vec::new();
        self.tw.try_handle_events(now, |flow_id| ended.push(flow_id));
        for flow_id in ended {
            self.on_flow_end(flow_id);
        }
    }

    /// Flushes every tracked flow without counting drop or aging errors.
    /// Shutdown path.
    pub fn tw_drain(&mut self) {
        self.on_drain = true;
        let mut ended = Vec::new();
        self.tw.drain_all(|flow_id| ended.push(flow_id));
        for flow_id in ended {
            self.on_flow_end(flow_id);
        }
        self.on_drain = false;
    }

    fn on_flow_end(&mut self, flow_id: u64) {
        let Some(flow) = self.ft.remove(&flow_id) else {
            return;
        };
        self.stats.remove += 1;
        self.stats.active = self.stats.active.saturating_sub(1);
        if !self.on_drain {
            let exp = flow.total_expected();
            let seen = flow.total_seen();
            if exp > seen {
                self.stats.err_drop += u64::from(exp - seen);
            }
            if !flow.aged_correctly {
                self.stats.err_aged += 1;
                debug!(flow_id, exp, seen, "flow aged out");
            }
        }
    }

    pub fn dump(&self) -> String {
        let mut out = self.stats.to_string();
        out.push_str(&self.hist.to_string());
        for (i, t) in self.templates.iter().enumerate() {
            if t.errors > 0 || t.rx_pkts > 0 {
                out.push_str(&format!(
                    " template_id_{i:2} , errors: {:8}, jitter: {} rx: {:8}\n",
                    t.errors,
                    t.jitter_usec(),
                    t.rx_pkts
                ));
            }
        }
        out
    }

    /// One-line operator summary: latency, jitter and the headline counters.
    pub fn dump_short(&mut self) -> String {
        self.hist.update();
        format!(
            "rx check: avg/max/jitter latency, {:8.0}, {:8.0}, {:8} | active flows: {}, fif: {}, drop: {}, errors: {}",
            self.hist.average_usec(),
            self.hist.max_usec(),
            self.max_jitter_usec(),
            self.stats.active,
            self.stats.fif,
            self.stats.err_drop,
            self.stats.total_err(),
        )
    }

    pub fn dump_json(&mut self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct TemplateDump {
            id: usize,
            val: u64,
            rx_pkts: u64,
            jitter: u32,
        }
        #[derive(Serialize)]
        struct EngineDump<'a> {
            name: &'static str,
            stats: &'a RxCheckStats,
            latency_avg_usec: f64,
            latency_max_usec: f64,
            template: Vec<TemplateDump>,
        }
        self.hist.update();
        serde_json::to_string(&EngineDump {
            name: "rx-check",
            stats: &self.stats,
            latency_avg_usec: self.hist.average_usec(),
            latency_max_usec: self.hist.max_usec(),
            template: self
                .templates
                .iter()
                .enumerate()
                .map(|(id, t)| TemplateDump {
                    id,
                    val: t.errors,
                    rx_pkts: t.rx_pkts,
                    jitter: t.jitter_usec(),
                })
                .collect(),
        })
    }
}

/// Transfer time from the marker's 32-bit microsecond timestamp to the
/// worker clock, tolerant to tick wraparound.
fn latency_sec(now: Dsec, time_stamp: u32) -> Dsec {
    let now_ticks = (now * 1e6) as u64 as u32;
    f64::from(now_ticks.wrapping_sub(time_stamp)) / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(flow_id: u64, pkt_id: u16, flow_size: u16) -> RxMarker {
        let mut m = RxMarker::new(flow_id);
        m.pkt_id = pkt_id;
        m.flow_size = flow_size;
        m.aging_sec = 10;
        m
    }

    #[test]
    fn in_order_flow_completes_clean() {
        let mut e = RxCheckEngine::new();
        for i in 0..10 {
            e.handle_packet(&marker(7, i, 10), 1.0);
        }
        assert_eq!(e.stats().total_err(), 0);
        assert_eq!(e.stats().add, 1);
        assert_eq!(e.stats().remove, 1);
        assert_eq!(e.stats().fif, 1);
        assert_eq!(e.stats().active, 0);
        assert_eq!(e.active_flows(), 0);
        assert_eq!(e.hist().sample_count(), 10);
        assert_eq!(e.template(0).rx_pkts(), 10);
        assert_eq!(e.template(0).errors(), 0);
    }

    #[test]
    fn dropped_packet_leaves_gap() {
        let mut e = RxCheckEngine::new();
        for i in 0..10 {
            if i == 4 {
                continue;
            }
            e.handle_packet(&marker(7, i, 10), 1.0);
        }
        e.tw_drain();
        assert_eq!(e.stats().err_oo_early, 1);
        assert_eq!(e.stats().add, 1);
        assert_eq!(e.stats().remove, 1);
    }

    #[test]
    fn swapped_packets_count_early_and_late() {
        let mut e = RxCheckEngine::new();
        for i in 0..10 {
            let pkt_id = match i {
                4 => 5,
                5 => 4,
                _ => i,
            };
            e.handle_packet(&marker(7, pkt_id, 10), 1.0);
        }
        e.tw_drain();
        // 5 ahead of 4, then 4 behind the reset sequence, then the gap
        // left by the reset when 6 arrives
        assert_eq!(e.stats().err_oo_early, 2);
        assert_eq!(e.stats().err_oo_late, 1);
    }

    #[test]
    fn pkt_id_beyond_flow_size_rejected() {
        let mut e = RxCheckEngine::new();
        for i in 0..10 {
            let pkt_id = if i == 4 { 56565 } else { i };
            e.handle_packet(&marker(7, pkt_id, 10), 1.0);
        }
        e.tw_drain();
        assert_eq!(e.stats().err_wrong_pkt_id, 1);
        assert_eq!(e.stats().err_oo_early, 1);
        assert_eq!(e.template(0).errors(), 2);
    }

    #[test]
    fn missing_fif_opens_flow_with_error() {
        let mut e = RxCheckEngine::new();
        for i in 0..10 {
            let pkt_id = match i {
                0 => 7,
                7 => 0,
                _ => i,
            };
            e.handle_packet(&marker(7, pkt_id, 10), 1.0);
        }
        e.tw_drain();
        assert_eq!(e.stats().err_open_with_no_fif_pkt, 1);
        assert_eq!(e.stats().err_oo_early, 1);
        assert_eq!(e.stats().fif, 0);
    }

    #[test]
    fn duplicate_packet_counted() {
        let mut e = RxCheckEngine::new();
        e.handle_packet(&marker(7, 0, 10), 1.0);
        e.handle_packet(&marker(7, 1, 10), 1.0);
        e.handle_packet(&marker(7, 1, 10), 1.0);
        assert_eq!(e.stats().err_oo_dup, 1);
        assert_eq!(e.stats().err_oo_early, 0);
        assert_eq!(e.stats().err_oo_late, 0);
    }

    #[test]
    fn both_dir_flow_waits_for_second_direction() {
        let mut e = RxCheckEngine::new();
        let mut m = marker(7, 0, 10);
        m.set_both_dir(true);
        for i in 0..10 {
            m.pkt_id = i;
            m.set_dir(0);
            e.handle_packet(&m, 1.0);
        }
        // one full direction does not complete a bidirectional flow
        assert_eq!(e.stats().add, 1);
        assert_eq!(e.stats().remove, 0);
        assert_eq!(e.stats().total_err(), 0);

        for i in 0..10 {
            m.pkt_id = i;
            m.set_dir(1);
            e.handle_packet(&m, 1.0);
        }
        assert_eq!(e.stats().remove, 1);
        assert_eq!(e.stats().total_err(), 0);
    }

    #[test]
    fn single_packet_flow_completes() {
        let mut e = RxCheckEngine::new();
        e.handle_packet(&marker(7, 0, 1), 1.0);
        assert_eq!(e.stats().add, 1);
        assert_eq!(e.stats().remove, 1);
        assert_eq!(e.stats().total_err(), 0);
    }

    #[test]
    fn aging_counts_drops() {
        let mut e = RxCheckEngine::new();
        for i in 0..5 {
            e.handle_packet(&marker(7, i, 10), 1.0);
        }
        // aging_sec is 10: nothing expires yet
        e.tw_handle(5.0);
        assert_eq!(e.stats().remove, 0);

        e.tw_handle(20.0);
        assert_eq!(e.stats().remove, 1);
        assert_eq!(e.stats().err_aged, 1);
        assert_eq!(e.stats().err_drop, 5);
        assert_eq!(e.stats().active, 0);
        assert_eq!(e.active_flows(), 0);
    }

    #[test]
    fn drain_suppresses_drop_accounting() {
        let mut e = RxCheckEngine::new();
        for i in 0..5 {
            e.handle_packet(&marker(7, i, 10), 1.0);
        }
        e.tw_drain();
        assert_eq!(e.stats().remove, 1);
        assert_eq!(e.stats().err_drop, 0);
        assert_eq!(e.stats().err_aged, 0);
    }

    #[test]
    fn bad_magic_counted_per_template() {
        let mut e = RxCheckEngine::new();
        let mut m = marker(7, 0, 10);
        m.magic = 0xdead;
        m.template_id = 3;
        e.handle_packet(&m, 1.0);
        assert_eq!(e.stats().err_no_magic, 1);
        assert_eq!(e.stats().lookup, 0);
        assert_eq!(e.template(3).errors(), 1);
        assert_eq!(e.template(3).rx_pkts(), 0);
    }

    #[test]
    fn flow_length_change_detected() {
        let mut e = RxCheckEngine::new();
        e.handle_packet(&marker(7, 0, 10), 1.0);
        e.handle_packet(&marker(7, 1, 10), 1.0);
        e.handle_packet(&marker(7, 2, 8), 1.0);
        assert_eq!(e.stats().err_flow_length_changed, 1);
    }

    #[test]
    fn out_of_range_template_shares_last_slot() {
        let mut e = RxCheckEngine::new();
        let mut m = marker(7, 0, 1);
        m.template_id = 200;
        e.handle_packet(&m, 1.0);
        assert_eq!(e.template(200).rx_pkts(), 1);
        assert_eq!(e.template(31).rx_pkts(), 1);
    }

    #[test]
    fn dump_json_is_valid() {
        let mut e = RxCheckEngine::new();
        for i in 0..10 {
            e.handle_packet(&marker(9, i, 10), 2.0);
        }
        let json = e.dump_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["name"], "rx-check");
        assert_eq!(v["stats"]["total_rx"], 10);
        assert_eq!(v["template"].as_array().unwrap().len(), MAX_TEMPLATE_STATS);
        assert!(!e.dump_short().is_empty());
        assert!(!e.dump().is_empty());
    }
}
