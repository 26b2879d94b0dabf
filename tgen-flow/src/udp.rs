use bytes::{Bytes, BytesMut};
use tgen_common::Dsec;
use tgen_timer::TimerHandle;
use tgen_wire::{fold_checksum, fold_sum, internet_checksum, pseudo_header_sum, PROTO_UDP};
use tracing::{debug, trace};

use crate::{
    flow::FlowBase,
    hooks::{FlowContext, FlowEnv},
    template::offload,
    tuple::FullTuple,
};

/// Largest frame the generator will emit (jumbo).
pub const MAX_FRAME_SIZE: usize = 9216;

const UDP_HDR_LEN: usize = 8;

/// Longest interval, in ticks, a keepalive timer is armed for. A large
/// budget is paid off across several bounded intervals instead of one
/// heap entry far in the future.
const MAX_TICK_CHUNK: u32 = 32;

/// A payload handed to [`UdpFlow::send_pkt`]: zero or more reference-counted
/// segments, chained without copying.
#[derive(Debug, Clone, Default)]
pub struct MsgBuffer {
    segs: Vec<Bytes>,
    len: usize,
}

impl MsgBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(payload: Bytes) -> Self {
        let len = payload.len();
        Self { segs: vec![payload], len }
    }

    pub fn push(&mut self, seg: Bytes) {
        self.len += seg.len();
        self.segs.push(seg);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segs(&self) -> &[Bytes] {
        &self.segs
    }
}

/// An outgoing frame: a freshly patched header chain plus the payload
/// segments, still shared with the sender.
#[derive(Debug, Clone)]
pub struct TxFrame {
    pub header: Bytes,
    pub segs: Vec<Bytes>,
}

impl TxFrame {
    pub fn len(&self) -> usize {
        self.header.len() + self.segs.iter().map(Bytes::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the chain into one contiguous buffer. Test and simulation
    /// helper; the driver hands the chain to the NIC as-is.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        out.extend_from_slice(&self.header);
        for seg in &self.segs {
            out.extend_from_slice(seg);
        }
        out.freeze()
    }
}

/// A UDP connection entry: INIT -> ACTIVE (keepalive armed) -> CLOSED.
#[derive(Debug)]
pub struct UdpFlow {
    pub base: FlowBase,
    pub(crate) keepalive: TimerHandle,
    /// Full keepalive budget, in ticks.
    keepalive_ticks: u32,
    /// What is left of the budget since the last observed traffic.
    remain_ticks: u32,
    /// Interval the timer is currently armed for.
    armed_ticks: u32,
    saw_traffic: bool,
    closed: bool,
}

impl UdpFlow {
    /// Creates the flow and arms its keepalive. `client_origin` selects
    /// which of the connect/accept counters the flow lands in.
    pub(crate) fn new(base: FlowBase, ctx: &mut FlowContext, client_origin: bool) -> Self {
        let ticks = ctx.keepalive_ticks();
        let armed = ticks.min(MAX_TICK_CHUNK);
        let mut flow = Self {
            base,
            keepalive: TimerHandle::new(),
            keepalive_ticks: ticks,
            remain_ticks: ticks,
            armed_ticks: armed,
            saw_traffic: false,
            closed: false,
        };
        if client_origin {
            ctx.udp_stats.connects += 1;
        } else {
            ctx.udp_stats.accepts += 1;
        }
        let deadline = ctx.now + f64::from(armed) * ctx.tick_period;
        ctx.tw.restart_timer(&mut flow.keepalive, deadline, flow.base.key);
        flow
    }

    /// Builds one outgoing packet around `buf`.
    ///
    /// The header template is cloned and patched; payload segments are
    /// chained by reference count, never copied. Returns `None` (counted)
    /// for oversize frames.
    pub fn send_pkt(&mut self, ctx: &mut FlowContext, buf: &MsgBuffer) -> Option<TxFrame> {
        let t = &self.base.template;
        if t.hdr_len() + buf.len() > MAX_FRAME_SIZE {
            ctx.udp_stats.pkt_toobig += 1;
            debug!(key = ?self.base.key, len = buf.len(), "oversize frame dropped");
            return None;
        }

        let udp_len = (UDP_HDR_LEN + buf.len()) as u16;
        let mut hdr = t.clone_and_patch(udp_len);
        let l4 = t.offset_l4();
        hdr[l4 + 4..l4 + 6].copy_from_slice(&udp_len.to_be_bytes());
        hdr[l4 + 6..l4 + 8].copy_from_slice(&[0, 0]);

        let pseudo = pseudo_header_sum(t.src_ip, t.dst_ip, PROTO_UDP, udp_len);
        let cs = if t.offload_flags & offload::TX_CHECKSUM != 0 {
            // hardware completes the sum; seed with the pseudo header
            fold_sum(pseudo)
        } else {
            let acc = internet_checksum(pseudo, &hdr[l4..l4 + UDP_HDR_LEN]);
            let cs = fold_checksum(sum_segments(acc, buf.segs()));
            if cs == 0 {
                0xffff
            } else {
                cs
            }
        };
        hdr[l4 + 6..l4 + 8].copy_from_slice(&cs.to_be_bytes());

        ctx.udp_stats.snd_pkts += 1;
        ctx.udp_stats.snd_bytes += buf.len() as u64;
        trace!(key = ?self.base.key, len = buf.len(), "udp tx");

        Some(TxFrame { header: hdr.freeze(), segs: buf.segs().to_vec() })
    }

    /// Strips headers and any trailing padding beyond the declared L7
    /// length, resets the keepalive and forwards the payload up.
    pub fn on_rx_packet(
        &mut self,
        ctx: &mut FlowContext,
        env: &mut impl FlowEnv,
        frame: &Bytes,
        ftuple: &FullTuple,
    ) {
        let start = ftuple.l7_offset as usize;
        let payload = frame.slice(start..start + ftuple.l7_total_len as usize);

        ctx.udp_stats.rcv_pkts += 1;
        ctx.udp_stats.rcv_bytes += payload.len() as u64;
        self.saw_traffic = true;

        env.on_udp_payload(self.base.key, payload);
    }

    /// One keepalive expiry. Returns the delay to re-arm for, or `None`
    /// when the flow disconnected.
    pub(crate) fn on_tick(&mut self, ctx: &mut FlowContext) -> Option<Dsec> {
        if self.closed {
            return None;
        }
        if self.saw_traffic {
            self.saw_traffic = false;
            self.remain_ticks = self.keepalive_ticks;
        } else {
            self.remain_ticks = self.remain_ticks.saturating_sub(self.armed_ticks);
            if self.remain_ticks == 0 {
                ctx.udp_stats.keepdrops += 1;
                self.disconnect(ctx);
                return None;
            }
        }
        self.armed_ticks = self.remain_ticks.min(MAX_TICK_CHUNK);
        Some(f64::from(self.armed_ticks) * ctx.tick_period)
    }

    /// Idempotent teardown: stops the keepalive and marks the flow closed.
    pub fn disconnect(&mut self, ctx: &mut FlowContext) {
        if self.closed {
            return;
        }
        ctx.tw.stop_timer(&mut self.keepalive);
        self.closed = true;
        ctx.udp_stats.closed += 1;
        trace!(key = ?self.base.key, "udp flow disconnected");
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// One's-complement sum over chained segments, keeping 16-bit alignment
/// across odd-length segment boundaries.
fn sum_segments(mut acc: u32, segs: &[Bytes]) -> u32 {
    let mut leftover: Option<u8> = None;
    for seg in segs {
        let mut s = &seg[..];
        if let Some(b) = leftover.take() {
            if let Some((first, rest)) = s.split_first() {
                acc += u32::from(u16::from_be_bytes([b, *first]));
                s = rest;
            } else {
                leftover = Some(b);
                continue;
            }
        }
        let mut chunks = s.chunks_exact(2);
        for c in &mut chunks {
            acc += u32::from(u16::from_be_bytes([c[0], c[1]]));
        }
        if let [last] = chunks.remainder() {
            leftover = Some(*last);
        }
    }
    if let Some(b) = leftover {
        acc += u32::from(u16::from_be_bytes([b, 0]));
    }
    acc
}
