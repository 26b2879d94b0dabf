use bytes::Bytes;
use tgen_common::Dsec;
use tgen_timer::TimerWheel;

use crate::{
    flow::TcpFlow,
    stats::UdpStats,
    tuple::{FlowKey, FullTuple},
};

/// Addressing for a RST generated in response to a packet that matched no
/// flow. The external TCP engine owns segment construction.
#[derive(Debug, Clone, Copy)]
pub struct RstInfo {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub vlan: u16,
    pub is_ipv6: bool,
    /// Ack number to respond with: the offending segment's seq + 1.
    pub ack_seq: u32,
}

/// Collaborator surface of the flow table.
///
/// The TCP state machine (congestion control, retransmission) and the
/// application-program layer both live outside this crate; the table
/// reaches them through this trait, one implementation per worker.
pub trait FlowEnv {
    /// Feed one classified packet to the flow's TCP state machine.
    fn tcp_flow_input(&mut self, flow: &mut TcpFlow, frame: &Bytes, ftuple: &FullTuple);

    /// Move a freshly originated server flow into LISTEN.
    fn tcp_listen(&mut self, flow: &mut TcpFlow);

    /// Emit a RST for a packet that could not be matched or originated.
    fn tcp_respond_rst(&mut self, rst: RstInfo);

    /// Flow finished; invoked before the flow is removed from the table.
    fn on_flow_close(&mut self, key: FlowKey);

    /// Frame the data plane does not handle, handed to the control plane.
    fn on_redirect(&mut self, frame: &Bytes);

    /// Reassembled UDP payload going up to the application program.
    fn on_udp_payload(&mut self, key: FlowKey, payload: Bytes);
}

/// Per-worker context shared by the flow table and its flows: the keepalive
/// timer wheel, UDP counters and the worker's notion of time.
///
/// Exclusively owned by one thread; everything here is plain state.
#[derive(Debug)]
pub struct FlowContext {
    pub tw: TimerWheel<FlowKey>,
    pub udp_stats: UdpStats,
    /// Current time, advanced by the driver loop.
    pub now: Dsec,
    /// Keepalive timer granularity.
    pub tick_period: Dsec,
    /// Default UDP keepalive budget.
    pub keepalive_msec: u64,
    /// Validate NIC L4 checksum verdicts on rx.
    pub rx_l4_check: bool,
}

impl Default for FlowContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowContext {
    pub fn new() -> Self {
        Self {
            tw: TimerWheel::new(),
            udp_stats: UdpStats::default(),
            now: 0.0,
            tick_period: 0.5,
            keepalive_msec: 2_000,
            rx_l4_check: true,
        }
    }

    /// Keepalive budget in timer ticks, at least one.
    pub fn keepalive_ticks(&self) -> u32 {
        let tick_msec = (self.tick_period * 1000.0) as u64;
        ((self.keepalive_msec / tick_msec.max(1)) as u32).max(1)
    }
}
