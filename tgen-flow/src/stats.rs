use std::fmt;

use serde::Serialize;

/// Per-table counters. Instance-scoped on purpose: one table per side per
/// worker, so these never need atomics or globals.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FlowTableStats {
    pub rx_pkts: u64,
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub redirects: u64,

    pub err_no_tcp_udp: u64,
    pub err_fragments_ipv4_drop: u64,
    pub err_len_err: u64,
    pub err_l3_cs: u64,
    pub err_l4_cs: u64,
    pub err_client_pkt_without_flow: u64,
    pub err_no_syn: u64,
    pub err_no_template: u64,
    pub err_duplicate_client_tuple: u64,
    pub err_no_memory: u64,
}

impl FlowTableStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn total_err(&self) -> u64 {
        self.err_no_tcp_udp
            + self.err_fragments_ipv4_drop
            + self.err_len_err
            + self.err_l3_cs
            + self.err_l4_cs
            + self.err_client_pkt_without_flow
            + self.err_no_syn
            + self.err_no_template
            + self.err_duplicate_client_tuple
            + self.err_no_memory
    }
}

macro_rules! dump_nz {
    ($f:expr, $self:expr, $($field:ident),+ $(,)?) => {
        $(
            if $self.$field != 0 {
                writeln!($f, " {:<32}: {}", stringify!($field), $self.$field)?;
            }
        )+
    };
}

impl fmt::Display for FlowTableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dump_nz!(
            f,
            self,
            rx_pkts,
            flows_opened,
            flows_closed,
            redirects,
            err_no_tcp_udp,
            err_fragments_ipv4_drop,
            err_len_err,
            err_l3_cs,
            err_l4_cs,
            err_client_pkt_without_flow,
            err_no_syn,
            err_no_template,
            err_duplicate_client_tuple,
            err_no_memory,
        );
        Ok(())
    }
}

/// UDP flow lifecycle counters, kept per worker context.
#[derive(Debug, Default, Clone, Serialize)]
pub struct UdpStats {
    pub snd_bytes: u64,
    pub snd_pkts: u64,
    pub rcv_bytes: u64,
    pub rcv_pkts: u64,
    /// Server-originated flows.
    pub accepts: u64,
    /// Client-originated flows.
    pub connects: u64,
    pub closed: u64,
    /// Flows dropped by keepalive expiry.
    pub keepdrops: u64,
    pub pkt_toobig: u64,
}

impl UdpStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for UdpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dump_nz!(
            f,
            self,
            snd_bytes,
            snd_pkts,
            rcv_bytes,
            rcv_pkts,
            accepts,
            connects,
            closed,
            keepdrops,
            pkt_toobig,
        );
        Ok(())
    }
}
