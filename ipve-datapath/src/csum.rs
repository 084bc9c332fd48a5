//! One's-complement checksum arithmetic (RFC 1071 / RFC 1624).
//!
//! Header rewrites never recompute a checksum from scratch; they patch it
//! incrementally with the old and new value of the field that changed.

use ipve_common::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

/// Location of the L4 checksum relative to the start of the L4 header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsumOffset {
    /// Offset of the checksum field, 0 if the protocol has none we maintain.
    pub offset: usize,
    /// Whether the checksum covers the IP pseudo header.
    pub pseudo: bool,
    /// UDP semantics: a zero checksum means "not computed" and must stay zero.
    pub mangled_0: bool,
}

impl CsumOffset {
    pub fn is_some(&self) -> bool {
        self.offset != 0
    }
}

/// Checksum location for an L4 protocol.
pub fn csum_l4_offset_and_flags(nexthdr: u8) -> CsumOffset {
    match nexthdr {
        IPPROTO_TCP => CsumOffset {
            offset: 16,
            pseudo: true,
            mangled_0: false,
        },
        IPPROTO_UDP => CsumOffset {
            offset: 6,
            pseudo: true,
            mangled_0: true,
        },
        IPPROTO_ICMPV6 => CsumOffset {
            offset: 2,
            pseudo: true,
            mangled_0: false,
        },
        IPPROTO_ICMP => CsumOffset {
            offset: 2,
            pseudo: false,
            mangled_0: false,
        },
        _ => CsumOffset::default(),
    }
}

/// Fold a 32-bit accumulator into 16 bits.
pub fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Sum big-endian 16-bit words of `data` into `sum` (odd tail padded with zero).
pub fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([c[0], c[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    // Keep the accumulator from overflowing on long inputs.
    (sum & 0xffff) + (sum >> 16)
}

/// Full Internet checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(accumulate(0, data))
}

/// Difference to apply when `old` bytes are replaced by `new` bytes.
///
/// Both slices must have the same, even length.
pub fn diff(old: &[u8], new: &[u8]) -> u32 {
    debug_assert_eq!(old.len(), new.len());
    let mut sum = 0u32;
    for (o, n) in old.chunks_exact(2).zip(new.chunks_exact(2)) {
        let o = u16::from_be_bytes([o[0], o[1]]);
        let n = u16::from_be_bytes([n[0], n[1]]);
        sum = sum.wrapping_add((!o) as u32).wrapping_add(n as u32);
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum
}

/// Apply a difference produced by [`diff`] to an existing checksum.
pub fn apply(check: u16, diff: u32) -> u16 {
    // HC' = ~(~HC + ~m + m')
    let sum = ((!check) as u32).wrapping_add(diff);
    !fold(sum)
}

/// Incrementally update `check` for `old` -> `new`.
pub fn replace(check: u16, old: &[u8], new: &[u8]) -> u16 {
    apply(check, diff(old, new))
}
