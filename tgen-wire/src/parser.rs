use thiserror::Error;

use crate::{PROTO_TCP, PROTO_UDP};

const ETH_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;
const TCP_MIN_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;

const ETH_TYPE_IPV4: u16 = 0x0800;
const ETH_TYPE_IPV6: u16 = 0x86DD;
const ETH_TYPE_VLAN: u16 = 0x8100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame truncated inside a header")]
    Truncated,
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),
    #[error("unsupported L4 protocol {0}")]
    UnsupportedL4(u8),
    #[error("IPv4 fragment")]
    Ipv4Fragment,
    #[error("bad IP header length")]
    BadHeaderLen,
}

/// NIC receive metadata, the checksum verdicts the hardware attached to the
/// frame descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxMeta {
    pub l3_cs_bad: bool,
    pub l4_cs_bad: bool,
}

/// Everything the flow table needs from one pass over the headers.
///
/// Offsets are relative to the start of the frame. IPv6 addresses are
/// reduced to their low 32 bits, which is how the generator allocates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket {
    pub ipv4: bool,
    pub vlan_tag: u16,
    pub proto: u8,
    pub l3_offset: u16,
    pub l4_offset: u16,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    /// Bytes from the start of the L3 header through the end of the payload,
    /// as declared by the IP header.
    pub l3_total_len: u16,
    /// L4 header length; valid for TCP (data offset) and UDP (8).
    pub l4_hdr_len: u8,
    pub tcp_flags: u8,
    pub tcp_seq: u32,
}

impl ParsedPacket {
    /// Parses the fixed header chain of `frame`. Pure function of the input
    /// bytes; never looks past the declared headers.
    pub fn parse(frame: &[u8]) -> Result<Self, ParseError> {
        if frame.len() < ETH_HDR_LEN {
            return Err(ParseError::Truncated);
        }

        let mut vlan_tag = 0u16;
        let mut ethertype = read_u16(frame, 12);
        let mut l3_offset = ETH_HDR_LEN;
        if ethertype == ETH_TYPE_VLAN {
            if frame.len() < ETH_HDR_LEN + VLAN_TAG_LEN {
                return Err(ParseError::Truncated);
            }
            vlan_tag = read_u16(frame, ETH_HDR_LEN) & 0x0fff;
            ethertype = read_u16(frame, ETH_HDR_LEN + 2);
            l3_offset += VLAN_TAG_LEN;
        }

        match ethertype {
            ETH_TYPE_IPV4 => Self::parse_ipv4(frame, l3_offset, vlan_tag),
            ETH_TYPE_IPV6 => Self::parse_ipv6(frame, l3_offset, vlan_tag),
            other => Err(ParseError::UnsupportedEtherType(other)),
        }
    }

    fn parse_ipv4(frame: &[u8], l3: usize, vlan_tag: u16) -> Result<Self, ParseError> {
        if frame.len() < l3 + IPV4_MIN_HDR_LEN {
            return Err(ParseError::Truncated);
        }
        let ihl = ((frame[l3] & 0x0f) as usize) * 4;
        if ihl < IPV4_MIN_HDR_LEN {
            return Err(ParseError::BadHeaderLen);
        }
        if frame.len() < l3 + ihl {
            return Err(ParseError::Truncated);
        }

        let frag = read_u16(frame, l3 + 6);
        // MF set or a non-zero fragment offset
        if frag & 0x3fff != 0 {
            return Err(ParseError::Ipv4Fragment);
        }

        let proto = frame[l3 + 9];
        let total_len = read_u16(frame, l3 + 2);
        let src_ip = read_u32(frame, l3 + 12);
        let dst_ip = read_u32(frame, l3 + 16);
        let l4 = l3 + ihl;

        Self::parse_l4(frame, l4, proto).map(|l4p| Self {
            ipv4: true,
            vlan_tag,
            proto,
            l3_offset: l3 as u16,
            l4_offset: l4 as u16,
            src_ip,
            dst_ip,
            l3_total_len: total_len,
            ..l4p
        })
    }

    fn parse_ipv6(frame: &[u8], l3: usize, vlan_tag: u16) -> Result<Self, ParseError> {
        if frame.len() < l3 + IPV6_HDR_LEN {
            return Err(ParseError::Truncated);
        }
        let proto = frame[l3 + 6];
        let payload_len = read_u16(frame, l3 + 4);
        // low 32 bits of the addresses
        let src_ip = read_u32(frame, l3 + 8 + 12);
        let dst_ip = read_u32(frame, l3 + 24 + 12);
        let l4 = l3 + IPV6_HDR_LEN;

        Self::parse_l4(frame, l4, proto).map(|l4p| Self {
            ipv4: false,
            vlan_tag,
            proto,
            l3_offset: l3 as u16,
            l4_offset: l4 as u16,
            src_ip,
            dst_ip,
            l3_total_len: IPV6_HDR_LEN as u16 + payload_len,
            ..l4p
        })
    }

    /// Parses the L4 header and returns a partially filled packet; the
    /// caller overlays the L3 fields.
    fn parse_l4(frame: &[u8], l4: usize, proto: u8) -> Result<Self, ParseError> {
        let blank = Self {
            ipv4: false,
            vlan_tag: 0,
            proto,
            l3_offset: 0,
            l4_offset: 0,
            src_ip: 0,
            dst_ip: 0,
            src_port: 0,
            dst_port: 0,
            l3_total_len: 0,
            l4_hdr_len: 0,
            tcp_flags: 0,
            tcp_seq: 0,
        };
        match proto {
            PROTO_TCP => {
                if frame.len() < l4 + TCP_MIN_HDR_LEN {
                    return Err(ParseError::Truncated);
                }
                let data_off = ((frame[l4 + 12] >> 4) as u8) * 4;
                if (data_off as usize) < TCP_MIN_HDR_LEN {
                    return Err(ParseError::BadHeaderLen);
                }
                Ok(Self {
                    src_port: read_u16(frame, l4),
                    dst_port: read_u16(frame, l4 + 2),
                    tcp_seq: read_u32(frame, l4 + 4),
                    tcp_flags: frame[l4 + 13],
                    l4_hdr_len: data_off,
                    ..blank
                })
            }
            PROTO_UDP => {
                if frame.len() < l4 + UDP_HDR_LEN {
                    return Err(ParseError::Truncated);
                }
                Ok(Self {
                    src_port: read_u16(frame, l4),
                    dst_port: read_u16(frame, l4 + 2),
                    l4_hdr_len: UDP_HDR_LEN as u8,
                    ..blank
                })
            }
            other => Err(ParseError::UnsupportedL4(other)),
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.proto == PROTO_TCP
    }

    pub fn is_udp(&self) -> bool {
        self.proto == PROTO_UDP
    }
}

#[inline]
fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

#[inline]
fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}
