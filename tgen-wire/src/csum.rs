//! One's-complement checksum helpers for the software checksum path.

/// Sums `data` into a 32-bit one's-complement accumulator.
pub fn internet_checksum(mut acc: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        acc += u32::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [last] = chunks.remainder() {
        acc += u32::from(u16::from_be_bytes([*last, 0]));
    }
    acc
}

/// Folds the accumulator and returns the final inverted 16-bit checksum.
pub fn fold_checksum(acc: u32) -> u16 {
    !fold_sum(acc)
}

/// Folds the accumulator without the final complement. This is what a
/// checksum-offloading NIC expects pre-seeded in the L4 checksum field.
pub fn fold_sum(mut acc: u32) -> u16 {
    while acc > 0xffff {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    acc as u16
}

/// Checksum over an IPv4 header slice (checksum field must be zeroed).
pub fn ipv4_header_checksum(hdr: &[u8]) -> u16 {
    fold_checksum(internet_checksum(0, hdr))
}

/// Partial sum over the TCP/UDP pseudo header. IPv6 addresses are reduced
/// to their low 32 bits by the generator, so both families sum the same way
/// apart from the address width handled by the caller.
pub fn pseudo_header_sum(src_ip: u32, dst_ip: u32, proto: u8, l4_len: u16) -> u32 {
    let mut acc = 0u32;
    acc += src_ip >> 16;
    acc += src_ip & 0xffff;
    acc += dst_ip >> 16;
    acc += dst_ip & 0xffff;
    acc += u32::from(proto);
    acc += u32::from(l4_len);
    acc
}
