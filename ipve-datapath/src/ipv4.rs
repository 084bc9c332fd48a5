//! IPv4 header helpers.

use std::net::Ipv4Addr;

use ipve_common::IPV4_MIN_HLEN;
use smoltcp::wire::Ipv4Packet;

use crate::csum::CsumOffset;
use crate::error::{DropReason, Result};
use crate::family::L3Header;
use crate::packet::Packet;

// Field offsets relative to the start of the IPv4 header
const TTL_OFF: usize = 8;
const CSUM_OFF: usize = 10;
const SADDR_OFF: usize = 12;
const DADDR_OFF: usize = 16;

/// Parse the header at `l3_off`.
///
/// The total length is not checked: ICMP errors quote truncated datagrams.
pub fn parse(pkt: &Packet, l3_off: usize) -> Result<L3Header<Ipv4Addr>> {
    pkt.ensure(l3_off, IPV4_MIN_HLEN)?;
    let ip = Ipv4Packet::new_unchecked(&pkt.data()[l3_off..]);
    if ip.version() != 4 {
        return Err(DropReason::InvalidPacket);
    }
    let hdrlen = ip.header_len() as usize;
    if hdrlen < IPV4_MIN_HLEN {
        return Err(DropReason::InvalidPacket);
    }
    pkt.ensure(l3_off, hdrlen)?;

    Ok(L3Header {
        saddr: ip.src_addr(),
        daddr: ip.dst_addr(),
        nexthdr: ip.next_header().into(),
        l3_off,
        l4_off: l3_off + hdrlen,
        is_fragment: ip.more_frags() || ip.frag_offset() != 0,
        non_first_fragment: ip.frag_offset() != 0,
    })
}

pub fn decrement_ttl(pkt: &mut Packet, l3_off: usize) -> Result<()> {
    let old = pkt.load_bytes::<2>(l3_off + TTL_OFF)?;
    if old[0] <= 1 {
        return Err(DropReason::TtlExceeded);
    }
    let new = [old[0] - 1, old[1]];
    pkt.store_bytes(l3_off + TTL_OFF, &new)?;
    pkt.l3_csum_replace(l3_off + CSUM_OFF, &old, &new)
}

pub fn store_saddr(
    pkt: &mut Packet,
    hdr: &L3Header<Ipv4Addr>,
    csum_off: &CsumOffset,
    addr: Ipv4Addr,
) -> Result<()> {
    store_addr(pkt, hdr, csum_off, SADDR_OFF, addr)
}

pub fn store_daddr(
    pkt: &mut Packet,
    hdr: &L3Header<Ipv4Addr>,
    csum_off: &CsumOffset,
    addr: Ipv4Addr,
) -> Result<()> {
    store_addr(pkt, hdr, csum_off, DADDR_OFF, addr)
}

fn store_addr(
    pkt: &mut Packet,
    hdr: &L3Header<Ipv4Addr>,
    csum_off: &CsumOffset,
    field: usize,
    addr: Ipv4Addr,
) -> Result<()> {
    let off = hdr.l3_off + field;
    let old = pkt.load_bytes::<4>(off)?;
    let new = addr.octets();
    pkt.store_bytes(off, &new)?;
    pkt.l3_csum_replace(hdr.l3_off + CSUM_OFF, &old, &new)?;
    if hdr.non_first_fragment {
        return Ok(());
    }
    pkt.l4_csum_replace(hdr.l4_off, csum_off, &old, &new, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csum;
    use ipve_common::{ETH_HLEN, IPPROTO_UDP};

    fn header(ihl: u8, frag: u16) -> Packet {
        let hlen = ihl as usize * 4;
        let mut buf = vec![0u8; ETH_HLEN + hlen.max(IPV4_MIN_HLEN) + 8];
        let ip = &mut buf[ETH_HLEN..];
        ip[0] = 0x40 | ihl;
        ip[6..8].copy_from_slice(&frag.to_be_bytes());
        ip[TTL_OFF] = 64;
        ip[9] = IPPROTO_UDP;
        ip[SADDR_OFF..SADDR_OFF + 4].copy_from_slice(&[10, 0, 0, 1]);
        ip[DADDR_OFF..DADDR_OFF + 4].copy_from_slice(&[10, 0, 0, 2]);
        if hlen >= IPV4_MIN_HLEN {
            let check = csum::checksum(&ip[..hlen]);
            ip[CSUM_OFF..CSUM_OFF + 2].copy_from_slice(&check.to_be_bytes());
        }
        Packet::new(buf)
    }

    #[test]
    fn test_parse() {
        let hdr = parse(&header(5, 0), ETH_HLEN).unwrap();
        assert_eq!(hdr.saddr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(hdr.daddr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(hdr.nexthdr, IPPROTO_UDP);
        assert_eq!(hdr.l4_off, ETH_HLEN + 20);
        assert!(!hdr.is_fragment);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut pkt = header(5, 0);
        pkt.store_bytes(ETH_HLEN, &[0x65]).unwrap();
        assert_eq!(parse(&pkt, ETH_HLEN), Err(DropReason::InvalidPacket));
    }

    #[test]
    fn test_short_ihl_rejected() {
        assert_eq!(parse(&header(4, 0), ETH_HLEN), Err(DropReason::InvalidPacket));
    }

    #[test]
    fn test_options_must_fit() {
        // IHL 15 claims 60 bytes but only 28 follow the L2 header.
        let mut pkt = header(5, 0);
        pkt.store_bytes(ETH_HLEN, &[0x4f]).unwrap();
        assert_eq!(parse(&pkt, ETH_HLEN), Err(DropReason::InvalidPacket));
    }

    #[test]
    fn test_fragments() {
        let first = parse(&header(5, 0x2000), ETH_HLEN).unwrap();
        assert!(first.is_fragment);
        assert!(!first.non_first_fragment);

        let later = parse(&header(5, 185), ETH_HLEN).unwrap();
        assert!(later.is_fragment);
        assert!(later.non_first_fragment);
    }

    #[test]
    fn test_decrement_ttl_keeps_checksum_valid() {
        let mut pkt = header(5, 0);
        decrement_ttl(&mut pkt, ETH_HLEN).unwrap();
        let ip = &pkt.data()[ETH_HLEN..ETH_HLEN + 20];
        assert_eq!(ip[TTL_OFF], 63);
        assert_eq!(csum::checksum(ip), 0);
    }

    #[test]
    fn test_ttl_exceeded() {
        let mut pkt = header(5, 0);
        pkt.store_bytes(ETH_HLEN + TTL_OFF, &[1]).unwrap();
        assert_eq!(decrement_ttl(&mut pkt, ETH_HLEN), Err(DropReason::TtlExceeded));
    }
}
