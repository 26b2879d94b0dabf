use std::fmt;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Reduced flow tuple, packed into a single word.
///
/// The generator owns one table per side, so one ip/port pair plus the
/// protocol identifies a connection: the client table keys on the packet's
/// destination, the server table on its source.
///
/// Layout: `ip:32 | port:16 | proto:8 | flags:8` (bit 0 of flags = ipv4).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey(u64);

impl FlowKey {
    pub fn new(ip: u32, port: u16, proto: u8, ipv4: bool) -> Self {
        Self(
            (u64::from(ip) << 32)
                | (u64::from(port) << 16)
                | (u64::from(proto) << 8)
                | u64::from(ipv4),
        )
    }

    pub fn ip(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn port(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn proto(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn is_ipv4(&self) -> bool {
        self.0 & 1 == 1
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Mixed 32-bit hash of the key, for dumps and sharding decisions.
    pub fn mixed_hash(&self) -> u32 {
        let mut h = FxHasher::default();
        self.0.hash(&mut h);
        let v = h.finish();
        ((v >> 32) ^ v) as u32
    }
}

impl fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FlowKey(ip={:#010x} port={} proto={} ipv4={})",
            self.ip(),
            self.port(),
            self.proto(),
            self.is_ipv4()
        )
    }
}

/// Offsets and lengths computed once by parsing and consumed by flow
/// processing. Offsets are from the start of the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullTuple {
    pub ipv4: bool,
    pub proto: u8,
    pub l3_offset: u16,
    pub l4_offset: u16,
    pub l7_offset: u16,
    /// Declared L7 length; zero is a valid payload.
    pub l7_total_len: u16,
}
