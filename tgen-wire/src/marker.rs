use bytes::{Buf, BufMut};
use thiserror::Error;

/// Magic prefix of a valid rx-check marker.
pub const MARKER_MAGIC: u32 = 0xB3A5_51B3;

/// Wire length of the marker, in bytes.
pub const MARKER_LEN: usize = 28;

/// IP option type carrying the marker in IPv4 packets.
pub const OPT_TYPE_V4: u8 = 0x42;
/// Destination-option type carrying the marker in IPv6 packets.
pub const OPT_TYPE_V6: u8 = 0x3c;

const FLAG_DIR: u8 = 0x01;
const FLAG_BOTH_DIR: u8 = 0x02;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkerError {
    #[error("marker truncated: need {MARKER_LEN} bytes, got {0}")]
    Truncated(usize),
}

/// In-band verification marker written by the TX side into every generated
/// packet and consumed by the rx-check engine.
///
/// A bad magic is deliberately not a decode error: the engine counts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxMarker {
    pub magic: u32,
    pub option_type: u8,
    pub option_len: u8,
    pub template_id: u8,
    pub flow_id: u64,
    pub pkt_id: u16,
    pub flow_size: u16,
    pub aging_sec: u16,
    pub time_stamp: u32,
    flags: u8,
}

impl RxMarker {
    /// A marker with valid magic and zeroed fields; test and TX-side seed.
    pub fn new(flow_id: u64) -> Self {
        Self {
            magic: MARKER_MAGIC,
            option_type: OPT_TYPE_V4,
            option_len: MARKER_LEN as u8,
            template_id: 0,
            flow_id,
            pkt_id: 0,
            flow_size: 0,
            aging_sec: 0,
            time_stamp: 0,
            flags: 0,
        }
    }

    pub fn decode(mut src: impl Buf) -> Result<Self, MarkerError> {
        if src.remaining() < MARKER_LEN {
            return Err(MarkerError::Truncated(src.remaining()));
        }
        let magic = src.get_u32();
        let option_type = src.get_u8();
        let option_len = src.get_u8();
        let flags = src.get_u8();
        let template_id = src.get_u8();
        let flow_id = src.get_u64();
        let pkt_id = src.get_u16();
        let flow_size = src.get_u16();
        let aging_sec = src.get_u16();
        let _pad = src.get_u16();
        let time_stamp = src.get_u32();
        Ok(Self {
            magic,
            option_type,
            option_len,
            template_id,
            flow_id,
            pkt_id,
            flow_size,
            aging_sec,
            time_stamp,
            flags,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.magic);
        dst.put_u8(self.option_type);
        dst.put_u8(self.option_len);
        dst.put_u8(self.flags);
        dst.put_u8(self.template_id);
        dst.put_u64(self.flow_id);
        dst.put_u16(self.pkt_id);
        dst.put_u16(self.flow_size);
        dst.put_u16(self.aging_sec);
        dst.put_u16(0);
        dst.put_u32(self.time_stamp);
    }

    /// First-in-flow marker: the first packet the TX side sent in this
    /// direction.
    #[inline]
    pub fn is_fif(&self) -> bool {
        self.pkt_id == 0
    }

    #[inline]
    pub fn dir(&self) -> usize {
        (self.flags & FLAG_DIR) as usize
    }

    pub fn set_dir(&mut self, dir: usize) {
        if dir == 0 {
            self.flags &= !FLAG_DIR;
        } else {
            self.flags |= FLAG_DIR;
        }
    }

    #[inline]
    pub fn both_dir(&self) -> bool {
        self.flags & FLAG_BOTH_DIR != 0
    }

    pub fn set_both_dir(&mut self, both: bool) {
        if both {
            self.flags |= FLAG_BOTH_DIR;
        } else {
            self.flags &= !FLAG_BOTH_DIR;
        }
    }
}
