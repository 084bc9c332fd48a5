//! IPv6 header helpers.

use std::net::Ipv6Addr;

use ipve_common::*;

use crate::csum::CsumOffset;
use crate::error::{DropReason, Result};
use crate::family::L3Header;
use crate::packet::Packet;
use smoltcp::wire::{Ipv6ExtHeader, Ipv6FragmentHeader, Ipv6Packet};

// Field offsets relative to the start of the IPv6 header
const HOP_LIMIT_OFF: usize = 7;
const SADDR_OFF: usize = 8;
const DADDR_OFF: usize = 24;

const FLOWLABEL_MASK: u32 = 0x000f_ffff;

/// Parse the fixed header at `l3_off` and walk its extension headers.
///
/// The payload length is not checked: ICMP errors quote truncated datagrams.
pub fn parse(pkt: &Packet, l3_off: usize) -> Result<L3Header<Ipv6Addr>> {
    pkt.ensure(l3_off, IPV6_HLEN)?;
    let data = pkt.data();
    let ip = Ipv6Packet::new_unchecked(&data[l3_off..]);
    if ip.version() != 6 {
        return Err(DropReason::InvalidPacket);
    }

    let mut nexthdr = u8::from(ip.next_header());
    let mut len = IPV6_HLEN;
    let mut is_fragment = false;
    let mut non_first_fragment = false;

    for _ in 0..IPV6_MAX_HEADERS {
        if !is_extension_header(nexthdr) {
            break;
        }
        let rest = data
            .get(l3_off + len..)
            .ok_or(DropReason::InvalidPacket)?;
        match nexthdr {
            IPPROTO_AH => {
                // AH counts its length in 4-byte units.
                pkt.ensure(l3_off + len, 2)?;
                let ah = Ipv6ExtHeader::new_unchecked(rest);
                len += (ah.header_len() as usize + 2) * 4;
                nexthdr = ah.next_header().into();
            }
            IPPROTO_FRAGMENT => {
                let ext = Ipv6ExtHeader::new_checked(rest)?;
                let frag = Ipv6FragmentHeader::new_checked(ext.payload())?;
                is_fragment = true;
                non_first_fragment = frag.frag_offset() != 0;
                len += 8;
                nexthdr = ext.next_header().into();
            }
            _ => {
                let ext = Ipv6ExtHeader::new_checked(rest)?;
                len += (ext.header_len() as usize + 1) * 8;
                nexthdr = ext.next_header().into();
            }
        }
    }

    if is_extension_header(nexthdr) {
        return Err(DropReason::InvalidExtensionHeader);
    }

    Ok(L3Header {
        saddr: ip.src_addr(),
        daddr: ip.dst_addr(),
        nexthdr,
        l3_off,
        l4_off: l3_off + len,
        is_fragment,
        non_first_fragment,
    })
}

fn is_extension_header(nexthdr: u8) -> bool {
    matches!(
        nexthdr,
        IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_FRAGMENT | IPPROTO_AH | IPPROTO_DSTOPTS
    )
}

pub fn decrement_hop_limit(pkt: &mut Packet, l3_off: usize) -> Result<()> {
    let hl = pkt.load_u8(l3_off + HOP_LIMIT_OFF)?;
    if hl <= 1 {
        return Err(DropReason::TtlExceeded);
    }
    pkt.store_bytes(l3_off + HOP_LIMIT_OFF, &[hl - 1])
}

/// Store `label` in the low 20 bits of the flow label.
pub fn store_flowlabel(pkt: &mut Packet, l3_off: usize, label: u32) -> Result<()> {
    let word = pkt
        .load_be32(l3_off)
        .map_err(|_| DropReason::WriteError)?;
    let word = (word & !FLOWLABEL_MASK) | (label & FLOWLABEL_MASK);
    pkt.store_bytes(l3_off, &word.to_be_bytes())
}

pub fn load_flowlabel(pkt: &Packet, l3_off: usize) -> Result<u32> {
    Ok(pkt.load_be32(l3_off)? & FLOWLABEL_MASK)
}

pub fn store_saddr(
    pkt: &mut Packet,
    hdr: &L3Header<Ipv6Addr>,
    csum_off: &CsumOffset,
    addr: Ipv6Addr,
) -> Result<()> {
    store_addr(pkt, hdr, csum_off, SADDR_OFF, addr)
}

pub fn store_daddr(
    pkt: &mut Packet,
    hdr: &L3Header<Ipv6Addr>,
    csum_off: &CsumOffset,
    addr: Ipv6Addr,
) -> Result<()> {
    store_addr(pkt, hdr, csum_off, DADDR_OFF, addr)
}

// IPv6 has no header checksum; only the L4 pseudo header is affected.
fn store_addr(
    pkt: &mut Packet,
    hdr: &L3Header<Ipv6Addr>,
    csum_off: &CsumOffset,
    field: usize,
    addr: Ipv6Addr,
) -> Result<()> {
    let off = hdr.l3_off + field;
    let old = pkt.load_bytes::<16>(off)?;
    let new = addr.octets();
    pkt.store_bytes(off, &new)?;
    if hdr.non_first_fragment {
        return Ok(());
    }
    pkt.l4_csum_replace(hdr.l4_off, csum_off, &old, &new, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(nexthdr: u8, ext: &[u8]) -> Packet {
        let mut buf = vec![0u8; ETH_HLEN + IPV6_HLEN];
        buf[ETH_HLEN] = 0x60;
        buf[ETH_HLEN + 6] = nexthdr;
        buf[ETH_HLEN + HOP_LIMIT_OFF] = 64;
        buf[ETH_HLEN + SADDR_OFF + 15] = 1;
        buf[ETH_HLEN + DADDR_OFF + 15] = 2;
        buf.extend_from_slice(ext);
        buf.extend_from_slice(&[0u8; 8]);
        Packet::new(buf)
    }

    #[test]
    fn test_plain_header() {
        let pkt = header(IPPROTO_TCP, &[]);
        let hdr = parse(&pkt, ETH_HLEN).unwrap();
        assert_eq!(hdr.nexthdr, IPPROTO_TCP);
        assert_eq!(hdr.l4_off, ETH_HLEN + IPV6_HLEN);
        assert_eq!(hdr.saddr, "::1".parse::<Ipv6Addr>().unwrap());
        assert!(!hdr.is_fragment);
    }

    #[test]
    fn test_extension_headers() {
        // hop-by-hop (8 bytes) -> fragment (8 bytes, offset 0) -> UDP
        let mut ext = vec![IPPROTO_FRAGMENT, 0, 0, 0, 0, 0, 0, 0];
        ext.extend_from_slice(&[IPPROTO_UDP, 0, 0x00, 0x01, 0, 0, 0, 1]);
        let pkt = header(IPPROTO_HOPOPTS, &ext);
        let hdr = parse(&pkt, ETH_HLEN).unwrap();
        assert_eq!(hdr.nexthdr, IPPROTO_UDP);
        assert_eq!(hdr.l4_off, ETH_HLEN + IPV6_HLEN + 16);
        assert!(hdr.is_fragment);
        assert!(!hdr.non_first_fragment);
    }

    #[test]
    fn test_auth_header_length_in_words() {
        // AH with a payload length of 4 spans (4 + 2) * 4 = 24 bytes.
        let mut ext = vec![IPPROTO_TCP, 4];
        ext.resize(24, 0);
        let hdr = parse(&header(IPPROTO_AH, &ext), ETH_HLEN).unwrap();
        assert_eq!(hdr.nexthdr, IPPROTO_TCP);
        assert_eq!(hdr.l4_off, ETH_HLEN + IPV6_HLEN + 24);
    }

    #[test]
    fn test_truncated_extension_header() {
        let pkt = header(IPPROTO_DSTOPTS, &[IPPROTO_UDP, 2]);
        assert_eq!(parse(&pkt, ETH_HLEN), Err(DropReason::InvalidPacket));
    }

    #[test]
    fn test_non_first_fragment() {
        let ext = [IPPROTO_TCP, 0, 0x05, 0x01, 0, 0, 0, 1];
        let hdr = parse(&header(IPPROTO_FRAGMENT, &ext), ETH_HLEN).unwrap();
        assert!(hdr.non_first_fragment);
    }

    #[test]
    fn test_too_many_extension_headers() {
        let mut ext = Vec::new();
        for _ in 0..IPV6_MAX_HEADERS {
            ext.extend_from_slice(&[IPPROTO_DSTOPTS, 0, 0, 0, 0, 0, 0, 0]);
        }
        assert_eq!(
            parse(&header(IPPROTO_DSTOPTS, &ext), ETH_HLEN),
            Err(DropReason::InvalidExtensionHeader)
        );
    }

    #[test]
    fn test_truncated() {
        let pkt = Packet::new(vec![0x60; ETH_HLEN + 20]);
        assert_eq!(parse(&pkt, ETH_HLEN), Err(DropReason::InvalidPacket));
    }

    #[test]
    fn test_hop_limit() {
        let mut pkt = header(IPPROTO_TCP, &[]);
        decrement_hop_limit(&mut pkt, ETH_HLEN).unwrap();
        assert_eq!(pkt.load_u8(ETH_HLEN + HOP_LIMIT_OFF).unwrap(), 63);

        pkt.store_bytes(ETH_HLEN + HOP_LIMIT_OFF, &[1]).unwrap();
        assert_eq!(
            decrement_hop_limit(&mut pkt, ETH_HLEN),
            Err(DropReason::TtlExceeded)
        );
    }

    #[test]
    fn test_flowlabel_keeps_version() {
        let mut pkt = header(IPPROTO_TCP, &[]);
        store_flowlabel(&mut pkt, ETH_HLEN, 0x12345678).unwrap();
        assert_eq!(load_flowlabel(&pkt, ETH_HLEN).unwrap(), 0x45678);
        assert_eq!(pkt.load_u8(ETH_HLEN).unwrap() >> 4, 6);
    }
}
