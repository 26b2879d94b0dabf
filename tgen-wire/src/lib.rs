//! Wire-level building blocks for the tgen data plane: a deterministic
//! Ethernet/IP/L4 header parser, the in-band rx-check marker codec and
//! internet checksum helpers.

mod csum;
mod marker;
mod parser;

pub use csum::{fold_checksum, fold_sum, internet_checksum, ipv4_header_checksum, pseudo_header_sum};
pub use marker::{MarkerError, RxMarker, MARKER_LEN, MARKER_MAGIC, OPT_TYPE_V4, OPT_TYPE_V6};
pub use parser::{ParseError, ParsedPacket, RxMeta};

/// IP protocol numbers understood by the flow table.
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// TCP header flags.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;
}
