use bytes::Bytes;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::hash_map::Entry;
use tgen_common::Dsec;
use tgen_wire::{tcp_flags, ParseError, ParsedPacket, RxMeta};
use tracing::{debug, info};

use crate::{
    flow::{Flow, FlowBase, TcpFlow},
    hooks::{FlowContext, FlowEnv, RstInfo},
    stats::FlowTableStats,
    template::FlowTemplate,
    tuple::{FlowKey, FullTuple},
    udp::UdpFlow,
};

/// Lookup keyed on destination port and protocol, consulted when a packet
/// arrives for which no flow exists and the table is allowed to originate
/// one. The value is the offload flag set new flows inherit.
type TemplateRegistry = FxHashMap<(u16, u8), u8>;

/// Single-threaded flow table for one traffic side of one worker.
///
/// Packets are classified by a reduced tuple: the client table keys on the
/// packet's destination address, the server table on its source, so one
/// ip/port/proto triple identifies a connection within a side.
#[derive(Debug)]
pub struct FlowTable {
    map: FxHashMap<FlowKey, Flow>,
    capacity: usize,
    client_side: bool,
    templates: TemplateRegistry,
    stats: FlowTableStats,
}

impl FlowTable {
    /// `size` is rounded up to a power of two and bounds the number of
    /// concurrent flows; beyond it new flows fail with `err_no_memory`.
    pub fn new(size: usize, client_side: bool) -> Self {
        let capacity = size.max(1).next_power_of_two();
        info!(capacity, client_side, "flow table created");
        Self {
            map: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            capacity,
            client_side,
            templates: TemplateRegistry::default(),
            stats: FlowTableStats::default(),
        }
    }

    /// Registers a listener: packets to `port`/`proto` with no flow may
    /// originate one, inheriting `offload_flags`.
    pub fn set_server_template(&mut self, port: u16, proto: u8, offload_flags: u8) {
        self.templates.insert((port, proto), offload_flags);
    }

    pub fn has_template(&self, port: u16, proto: u8) -> bool {
        self.templates.contains_key(&(port, proto))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_client_side(&self) -> bool {
        self.client_side
    }

    pub fn stats(&self) -> &FlowTableStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn get(&self, key: &FlowKey) -> Option<&Flow> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut Flow> {
        self.map.get_mut(key)
    }

    /// One received frame, end to end: parse, classify, then either feed the
    /// matching flow or try to originate one.
    pub fn rx_handle_packet(
        &mut self,
        ctx: &mut FlowContext,
        env: &mut impl FlowEnv,
        frame: &Bytes,
        meta: RxMeta,
    ) {
        self.stats.rx_pkts += 1;
        let Some((pkt, key, ftuple)) = self.parse_packet(frame, env, &meta, ctx.rx_l4_check)
        else {
            return;
        };

        if let Some(flow) = self.map.get_mut(&key) {
            let close = match flow {
                Flow::Tcp(f) => {
                    env.tcp_flow_input(f, frame, &ftuple);
                    f.is_can_close()
                }
                Flow::Udp(f) => {
                    f.on_rx_packet(ctx, env, frame, &ftuple);
                    f.is_closed()
                }
            };
            if close {
                self.handle_close(ctx, env, key);
            }
            return;
        }

        self.handle_flow_miss(ctx, env, frame, &pkt, key, &ftuple);
    }

    /// Packet matched no flow. Client tables never originate from received
    /// traffic; server tables do, if a listener template exists.
    fn handle_flow_miss(
        &mut self,
        ctx: &mut FlowContext,
        env: &mut impl FlowEnv,
        frame: &Bytes,
        pkt: &ParsedPacket,
        key: FlowKey,
        ftuple: &FullTuple,
    ) {
        if self.client_side {
            self.stats.err_client_pkt_without_flow += 1;
            return;
        }

        if pkt.is_tcp() {
            if pkt.tcp_flags & tcp_flags::RST != 0 {
                // never answer a RST
                self.stats.err_no_syn += 1;
                return;
            }
            if pkt.tcp_flags & tcp_flags::SYN == 0 {
                self.stats.err_no_syn += 1;
                env.tcp_respond_rst(rst_for(pkt));
                return;
            }
        }

        let Some(&offload_flags) = self.templates.get(&(pkt.dst_port, pkt.proto)) else {
            self.stats.err_no_template += 1;
            debug!(port = pkt.dst_port, proto = pkt.proto, "no listener template");
            if pkt.is_tcp() {
                env.tcp_respond_rst(rst_for(pkt));
            }
            return;
        };

        // originate: the packet's destination is this side's address
        let mut template = FlowTemplate::new(
            pkt.dst_ip,
            pkt.src_ip,
            pkt.dst_port,
            pkt.src_port,
            pkt.vlan_tag,
            pkt.proto,
            !pkt.ipv4,
            offload_flags,
        );
        template.learn_mac_from_frame(frame);
        let base = FlowBase { key, template };

        let flow = if pkt.is_tcp() {
            let mut f = TcpFlow::new(base);
            env.tcp_listen(&mut f);
            Flow::Tcp(f)
        } else {
            Flow::Udp(UdpFlow::new(base, ctx, false))
        };
        // allocation failure drops the packet silently, no RST
        if !self.insert_new_flow(ctx, flow) {
            return;
        }

        // feed the triggering packet to the freshly created flow
        let close = match self.map.get_mut(&key) {
            Some(Flow::Tcp(f)) => {
                env.tcp_flow_input(f, frame, ftuple);
                f.is_can_close()
            }
            Some(Flow::Udp(f)) => {
                f.on_rx_packet(ctx, env, frame, ftuple);
                f.is_closed()
            }
            None => false,
        };
        if close {
            self.handle_close(ctx, env, key);
        }
    }

    /// Inserts a fully constructed flow. On duplicate tuple or a full table
    /// the flow is torn down, the error counted and the map left untouched.
    pub fn insert_new_flow(&mut self, ctx: &mut FlowContext, mut flow: Flow) -> bool {
        let key = flow.key();
        if self.map.len() >= self.capacity {
            self.stats.err_no_memory += 1;
            if let Flow::Udp(f) = &mut flow {
                f.disconnect(ctx);
            }
            return false;
        }
        match self.map.entry(key) {
            Entry::Occupied(_) => {
                self.stats.err_duplicate_client_tuple += 1;
                debug!(?key, "duplicate tuple rejected");
                if let Flow::Udp(f) = &mut flow {
                    f.disconnect(ctx);
                }
                false
            }
            Entry::Vacant(e) => {
                e.insert(flow);
                self.stats.flows_opened += 1;
                true
            }
        }
    }

    /// Client-side active open: build the flow from `template`, arm its
    /// keepalive and insert it. The table keys on the template's own
    /// (source) address, which is where peer traffic will arrive.
    pub fn open_udp_flow(&mut self, ctx: &mut FlowContext, template: FlowTemplate) -> Option<FlowKey> {
        let key =
            FlowKey::new(template.src_ip, template.src_port, template.proto, !template.is_ipv6);
        let flow = UdpFlow::new(FlowBase { key, template }, ctx, true);
        self.insert_new_flow(ctx, Flow::Udp(flow)).then_some(key)
    }

    /// Client-side active open for TCP. The caller drives the connect
    /// through its protocol machine after insertion.
    pub fn open_tcp_flow(&mut self, ctx: &mut FlowContext, template: FlowTemplate) -> Option<FlowKey> {
        let key =
            FlowKey::new(template.src_ip, template.src_port, template.proto, !template.is_ipv6);
        let flow = TcpFlow::new(FlowBase { key, template });
        self.insert_new_flow(ctx, Flow::Tcp(flow)).then_some(key)
    }

    /// Removes a flow, stopping its timers and notifying the environment.
    pub fn handle_close(&mut self, ctx: &mut FlowContext, env: &mut impl FlowEnv, key: FlowKey) {
        if let Some(mut flow) = self.map.remove(&key) {
            if let Flow::Udp(f) = &mut flow {
                f.disconnect(ctx);
            }
            env.on_flow_close(key);
            self.stats.flows_closed += 1;
        }
    }

    /// Advances time and services expired keepalives: every expired UDP flow
    /// either re-arms for its next interval or is closed.
    pub fn handle_tick(&mut self, ctx: &mut FlowContext, env: &mut impl FlowEnv, now: Dsec) {
        ctx.now = now;
        let mut expired = Vec::new();
        ctx.tw.try_handle_events(now, |key| expired.push(key));
        for key in expired {
            let mut close = false;
            if let Some(Flow::Udp(f)) = self.map.get_mut(&key) {
                match f.on_tick(ctx) {
                    Some(delay) => ctx.tw.restart_timer(&mut f.keepalive, now + delay, key),
                    None => close = true,
                }
            }
            if close {
                self.handle_close(ctx, env, key);
            }
        }
    }

    /// Parses one frame and applies the drop/redirect policy, updating the
    /// error counters. Returns the classification inputs on success.
    fn parse_packet(
        &mut self,
        frame: &Bytes,
        env: &mut impl FlowEnv,
        meta: &RxMeta,
        rx_l4_check: bool,
    ) -> Option<(ParsedPacket, FlowKey, FullTuple)> {
        let pkt = match ParsedPacket::parse(frame) {
            Ok(p) => p,
            Err(ParseError::UnsupportedEtherType(_)) => {
                self.stats.redirects += 1;
                env.on_redirect(frame);
                return None;
            }
            Err(ParseError::UnsupportedL4(_)) => {
                self.stats.err_no_tcp_udp += 1;
                self.stats.redirects += 1;
                env.on_redirect(frame);
                return None;
            }
            Err(ParseError::Ipv4Fragment) => {
                self.stats.err_fragments_ipv4_drop += 1;
                return None;
            }
            Err(ParseError::Truncated | ParseError::BadHeaderLen) => {
                self.stats.err_len_err += 1;
                return None;
            }
        };

        // the declared length must fit the buffer and cover the L4 header
        let declared_end = pkt.l3_offset as usize + pkt.l3_total_len as usize;
        let l4_span = pkt.l4_offset - pkt.l3_offset + u16::from(pkt.l4_hdr_len);
        if declared_end > frame.len() || pkt.l3_total_len < l4_span {
            self.stats.err_len_err += 1;
            return None;
        }

        if meta.l3_cs_bad && pkt.ipv4 {
            self.stats.err_l3_cs += 1;
            return None;
        }
        if rx_l4_check && meta.l4_cs_bad {
            self.stats.err_l4_cs += 1;
            return None;
        }

        let key = if self.client_side {
            FlowKey::new(pkt.dst_ip, pkt.dst_port, pkt.proto, pkt.ipv4)
        } else {
            FlowKey::new(pkt.src_ip, pkt.src_port, pkt.proto, pkt.ipv4)
        };
        let ftuple = FullTuple {
            ipv4: pkt.ipv4,
            proto: pkt.proto,
            l3_offset: pkt.l3_offset,
            l4_offset: pkt.l4_offset,
            l7_offset: pkt.l4_offset + u16::from(pkt.l4_hdr_len),
            l7_total_len: pkt.l3_total_len - l4_span,
        };
        Some((pkt, key, ftuple))
    }

    pub fn dump(&self) -> String {
        format!(
            "flows: {}/{} ({} side)\n{}",
            self.map.len(),
            self.capacity,
            if self.client_side { "client" } else { "server" },
            self.stats
        )
    }

    pub fn dump_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct TableDump<'a> {
            active_flows: usize,
            capacity: usize,
            client_side: bool,
            stats: &'a FlowTableStats,
        }
        serde_json::to_string(&TableDump {
            active_flows: self.map.len(),
            capacity: self.capacity,
            client_side: self.client_side,
            stats: &self.stats,
        })
    }
}

fn rst_for(pkt: &ParsedPacket) -> RstInfo {
    RstInfo {
        src_ip: pkt.dst_ip,
        dst_ip: pkt.src_ip,
        src_port: pkt.dst_port,
        dst_port: pkt.src_port,
        vlan: pkt.vlan_tag,
        is_ipv6: !pkt.ipv4,
        ack_seq: pkt.tcp_seq.wrapping_add(1),
    }
}
