use bytes::{BufMut, BytesMut};
use tgen_wire::{ipv4_header_checksum, PROTO_TCP, PROTO_UDP};

const ETH_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;
const UDP_HDR_LEN: usize = 8;
const TCP_HDR_LEN: usize = 20;

/// Hardware offload capability flags carried by a flow template.
pub mod offload {
    /// NIC computes L3/L4 checksums on transmit.
    pub const TX_CHECKSUM: u8 = 0x01;
    /// NIC validates the L4 checksum on receive.
    pub const RX_CHECKSUM: u8 = 0x04;
}

/// Per-flow address template: the full header chain of an outgoing packet,
/// built once at flow creation and cloned/patched per transmitted packet.
#[derive(Debug, Clone)]
pub struct FlowTemplate {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub vlan: u16,
    pub proto: u8,
    pub is_ipv6: bool,
    pub offload_flags: u8,
    offset_ip: u16,
    offset_l4: u16,
    hdr: Vec<u8>,
}

impl FlowTemplate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src_ip: u32,
        dst_ip: u32,
        src_port: u16,
        dst_port: u16,
        vlan: u16,
        proto: u8,
        is_ipv6: bool,
        offload_flags: u8,
    ) -> Self {
        let mut t = Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            vlan,
            proto,
            is_ipv6,
            offload_flags,
            offset_ip: 0,
            offset_l4: 0,
            hdr: Vec::new(),
        };
        t.build();
        t
    }

    /// Length of the prebuilt header chain.
    pub fn hdr_len(&self) -> usize {
        self.hdr.len()
    }

    pub fn offset_ip(&self) -> usize {
        self.offset_ip as usize
    }

    pub fn offset_l4(&self) -> usize {
        self.offset_l4 as usize
    }

    pub fn header_bytes(&self) -> &[u8] {
        &self.hdr
    }

    /// Copies the peer's source MAC from a received frame into the
    /// template's destination MAC. Server flows learn their peer this way.
    pub fn learn_mac_from_frame(&mut self, frame: &[u8]) {
        if frame.len() >= 12 {
            self.hdr[..6].copy_from_slice(&frame[6..12]);
        }
    }

    fn build(&mut self) {
        let mut h = Vec::with_capacity(ETH_HDR_LEN + VLAN_TAG_LEN + IPV6_HDR_LEN + TCP_HDR_LEN);
        // MACs start zeroed; learned from traffic or set by the driver.
        h.resize(12, 0);
        if self.vlan != 0 {
            h.put_u16(0x8100);
            h.put_u16(self.vlan);
        }
        h.put_u16(if self.is_ipv6 { 0x86DD } else { 0x0800 });
        self.offset_ip = h.len() as u16;

        if self.is_ipv6 {
            h.put_u8(0x60);
            h.put_u8(0);
            h.put_u16(0);
            h.put_u16(0); // payload length, patched per packet
            h.put_u8(self.proto);
            h.put_u8(64);
            h.extend_from_slice(&[0u8; 12]);
            h.put_u32(self.src_ip);
            h.extend_from_slice(&[0u8; 12]);
            h.put_u32(self.dst_ip);
        } else {
            h.put_u8(0x45);
            h.put_u8(0);
            h.put_u16(0); // total length, patched per packet
            h.put_u16(0); // id
            h.put_u16(0); // no fragmentation
            h.put_u8(64);
            h.put_u8(self.proto);
            h.put_u16(0); // checksum, patched per packet
            h.put_u32(self.src_ip);
            h.put_u32(self.dst_ip);
        }
        self.offset_l4 = h.len() as u16;

        match self.proto {
            PROTO_UDP => {
                h.put_u16(self.src_port);
                h.put_u16(self.dst_port);
                h.put_u16(0); // length, patched per packet
                h.put_u16(0); // checksum
            }
            PROTO_TCP => {
                h.put_u16(self.src_port);
                h.put_u16(self.dst_port);
                h.put_u32(0); // seq
                h.put_u32(0); // ack
                h.put_u8(0x50);
                h.put_u8(0);
                h.put_u16(0xffff);
                h.put_u16(0); // checksum
                h.put_u16(0); // urgent
            }
            _ => {}
        }
        self.hdr = h;
    }

    /// Clones the header chain and patches the per-packet IP length fields.
    /// L4 checksum handling stays with the caller (it depends on the
    /// payload and the offload path).
    pub fn clone_and_patch(&self, l4_total_len: u16) -> BytesMut {
        let mut hdr = BytesMut::from(&self.hdr[..]);
        let ip = self.offset_ip as usize;
        if self.is_ipv6 {
            hdr[ip + 4..ip + 6].copy_from_slice(&l4_total_len.to_be_bytes());
        } else {
            let total = (self.offset_l4 - self.offset_ip) + l4_total_len;
            hdr[ip + 2..ip + 4].copy_from_slice(&total.to_be_bytes());
            hdr[ip + 10..ip + 12].copy_from_slice(&[0, 0]);
            if self.offload_flags & offload::TX_CHECKSUM == 0 {
                let cs = ipv4_header_checksum(&hdr[ip..ip + IPV4_HDR_LEN]);
                hdr[ip + 10..ip + 12].copy_from_slice(&cs.to_be_bytes());
            }
        }
        hdr
    }
}
