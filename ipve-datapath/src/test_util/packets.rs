//! Frame builders.
//!
//! Every frame is addressed from [`super::CLIENT_MAC`] to
//! [`super::ROUTER_MAC`] with valid IPv4 header and L4 checksums.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipve_common::*;

use crate::csum;
use crate::packet::Packet;

use super::{CLIENT_MAC, ROUTER_MAC};

pub const DEFAULT_TTL: u8 = 64;

fn eth(ethertype: u16, l3: &[u8]) -> Packet {
    let mut buf = Vec::with_capacity(ETH_HLEN + l3.len());
    buf.extend_from_slice(&ROUTER_MAC);
    buf.extend_from_slice(&CLIENT_MAC);
    buf.extend_from_slice(&ethertype.to_be_bytes());
    buf.extend_from_slice(l3);
    Packet::new(buf)
}

fn tcp_header(sport: u16, dport: u16, flags: u8) -> Vec<u8> {
    let mut tcp = vec![0u8; TCP_MIN_HLEN];
    tcp[0..2].copy_from_slice(&sport.to_be_bytes());
    tcp[2..4].copy_from_slice(&dport.to_be_bytes());
    tcp[4..8].copy_from_slice(&1u32.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&64240u16.to_be_bytes());
    tcp
}

fn udp_header(sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let len = (UDP_HLEN + payload.len()) as u16;
    let mut udp = Vec::with_capacity(len as usize);
    udp.extend_from_slice(&sport.to_be_bytes());
    udp.extend_from_slice(&dport.to_be_bytes());
    udp.extend_from_slice(&len.to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    udp
}

fn echo(icmp_type: u8, id: u16) -> Vec<u8> {
    let mut icmp = vec![0u8; ICMP_HLEN + 4];
    icmp[0] = icmp_type;
    icmp[4..6].copy_from_slice(&id.to_be_bytes());
    icmp[6..8].copy_from_slice(&1u16.to_be_bytes());
    icmp[8..].copy_from_slice(b"ping");
    icmp
}

/// Offset of the checksum inside an L4 header, if we fill one in.
fn l4_csum_offset(proto: u8) -> Option<usize> {
    let off = csum::csum_l4_offset_and_flags(proto);
    off.is_some().then_some(off.offset)
}

fn fill_l4_csum(l4: &mut [u8], proto: u8, pseudo: u32) {
    let Some(off) = l4_csum_offset(proto) else {
        return;
    };
    if l4.len() < off + 2 {
        return;
    }
    l4[off..off + 2].copy_from_slice(&[0, 0]);
    let mut check = !csum::fold(csum::accumulate(pseudo, l4));
    if proto == IPPROTO_UDP && check == 0 {
        check = 0xffff;
    }
    l4[off..off + 2].copy_from_slice(&check.to_be_bytes());
}

// IPv6

fn pseudo6(src: Ipv6Addr, dst: Ipv6Addr, len: usize, proto: u8) -> u32 {
    let mut sum = csum::accumulate(0, &src.octets());
    sum = csum::accumulate(sum, &dst.octets());
    sum = csum::accumulate(sum, &(len as u32).to_be_bytes());
    csum::accumulate(sum, &[0, 0, 0, proto])
}

fn ipv6_header(src: Ipv6Addr, dst: Ipv6Addr, nexthdr: u8, payload_len: usize) -> Vec<u8> {
    let mut ip = vec![0u8; IPV6_HLEN];
    ip[0] = 0x60;
    ip[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    ip[6] = nexthdr;
    ip[7] = DEFAULT_TTL;
    ip[8..24].copy_from_slice(&src.octets());
    ip[24..40].copy_from_slice(&dst.octets());
    ip
}

fn ipv6_l3(src: Ipv6Addr, dst: Ipv6Addr, nexthdr: u8, mut l4: Vec<u8>) -> Vec<u8> {
    if nexthdr == IPPROTO_ICMPV6 || nexthdr == IPPROTO_TCP || nexthdr == IPPROTO_UDP {
        let pseudo = pseudo6(src, dst, l4.len(), nexthdr);
        fill_l4_csum(&mut l4, nexthdr, pseudo);
    }
    let mut ip = ipv6_header(src, dst, nexthdr, l4.len());
    ip.extend_from_slice(&l4);
    ip
}

/// IPv6 frame carrying `payload` verbatim after the fixed header.
pub fn ipv6_raw(src: Ipv6Addr, dst: Ipv6Addr, nexthdr: u8, payload: &[u8]) -> Packet {
    let mut ip = ipv6_header(src, dst, nexthdr, payload.len());
    ip.extend_from_slice(payload);
    eth(ETH_P_IPV6, &ip)
}

pub fn tcp6(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16, flags: u8) -> Packet {
    let ip = ipv6_l3(src, dst, IPPROTO_TCP, tcp_header(sport, dport, flags));
    eth(ETH_P_IPV6, &ip)
}

pub fn udp6(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16, payload: &[u8]) -> Packet {
    let ip = ipv6_l3(src, dst, IPPROTO_UDP, udp_header(sport, dport, payload));
    eth(ETH_P_IPV6, &ip)
}

pub fn icmp6_echo(src: Ipv6Addr, dst: Ipv6Addr, id: u16, reply: bool) -> Packet {
    let ty = if reply {
        ICMPV6_ECHO_REPLY
    } else {
        ICMPV6_ECHO_REQUEST
    };
    let ip = ipv6_l3(src, dst, IPPROTO_ICMPV6, echo(ty, id));
    eth(ETH_P_IPV6, &ip)
}

/// Neighbour solicitation from `src` for `target`, sent to the target's
/// solicited-node multicast group. A specified source carries its
/// link-layer address option.
pub fn neighbor_solicit(src: Ipv6Addr, target: Ipv6Addr) -> Packet {
    const NDISC_NEIGHBOR_SOLICIT: u8 = 135;
    const NDISC_SOURCE_LLADDR: u8 = 1;

    let t = target.octets();
    let dst = Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, t[13], t[14], t[15],
    ]);
    let mut icmp = vec![0u8; ICMP_HLEN];
    icmp[0] = NDISC_NEIGHBOR_SOLICIT;
    icmp.extend_from_slice(&t);
    if !src.is_unspecified() {
        icmp.extend_from_slice(&[NDISC_SOURCE_LLADDR, 1]);
        icmp.extend_from_slice(&CLIENT_MAC);
    }
    let mut ip = ipv6_l3(src, dst, IPPROTO_ICMPV6, icmp);
    ip[7] = 255;
    eth(ETH_P_IPV6, &ip)
}

/// Destination unreachable from `src` to `dst` quoting `original`.
pub fn icmp6_error(src: Ipv6Addr, dst: Ipv6Addr, original: &Packet) -> Packet {
    let mut icmp = vec![0u8; ICMP_HLEN];
    icmp[0] = ICMPV6_DEST_UNREACH;
    icmp.extend_from_slice(&original.data()[ETH_HLEN..]);
    let ip = ipv6_l3(src, dst, IPPROTO_ICMPV6, icmp);
    eth(ETH_P_IPV6, &ip)
}

/// IPv6 frame with a fragment header in front of `payload`.
///
/// `offset` is in 8-byte units.
pub fn ipv6_fragment(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    nexthdr: u8,
    offset: u16,
    more: bool,
    payload: &[u8],
) -> Packet {
    let mut frag = vec![0u8; 8];
    frag[0] = nexthdr;
    let off = (offset << 3) | u16::from(more);
    frag[2..4].copy_from_slice(&off.to_be_bytes());
    frag[4..8].copy_from_slice(&0x1234u32.to_be_bytes());
    frag.extend_from_slice(payload);
    ipv6_raw(src, dst, IPPROTO_FRAGMENT, &frag)
}

/// IPv6 frame whose fixed header is followed by `count` empty
/// destination options headers and then a UDP datagram.
pub fn ipv6_with_dstopts(src: Ipv6Addr, dst: Ipv6Addr, count: usize) -> Packet {
    let udp = {
        let mut udp = udp_header(1000, 53, b"q");
        let pseudo = pseudo6(src, dst, udp.len(), IPPROTO_UDP);
        fill_l4_csum(&mut udp, IPPROTO_UDP, pseudo);
        udp
    };
    let mut ext = Vec::new();
    for i in 0..count {
        let next = if i + 1 == count {
            IPPROTO_UDP
        } else {
            IPPROTO_DSTOPTS
        };
        // PadN filling the remaining six bytes.
        ext.extend_from_slice(&[next, 0, 1, 4, 0, 0, 0, 0]);
    }
    ext.extend_from_slice(&udp);
    let first = if count == 0 { IPPROTO_UDP } else { IPPROTO_DSTOPTS };
    ipv6_raw(src, dst, first, &ext)
}

// IPv4

fn pseudo4(src: Ipv4Addr, dst: Ipv4Addr, len: usize, proto: u8) -> u32 {
    let mut sum = csum::accumulate(0, &src.octets());
    sum = csum::accumulate(sum, &dst.octets());
    csum::accumulate(sum, &[0, proto, (len >> 8) as u8, len as u8])
}

fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload_len: usize, frag: u16) -> Vec<u8> {
    let mut ip = vec![0u8; IPV4_MIN_HLEN];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((IPV4_MIN_HLEN + payload_len) as u16).to_be_bytes());
    ip[4..6].copy_from_slice(&0x4242u16.to_be_bytes());
    ip[6..8].copy_from_slice(&frag.to_be_bytes());
    ip[8] = DEFAULT_TTL;
    ip[9] = proto;
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&dst.octets());
    let check = csum::checksum(&ip);
    ip[10..12].copy_from_slice(&check.to_be_bytes());
    ip
}

fn ipv4_l3(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, mut l4: Vec<u8>) -> Vec<u8> {
    let pseudo = if proto == IPPROTO_ICMP {
        0
    } else {
        pseudo4(src, dst, l4.len(), proto)
    };
    fill_l4_csum(&mut l4, proto, pseudo);
    let mut ip = ipv4_header(src, dst, proto, l4.len(), 0);
    ip.extend_from_slice(&l4);
    ip
}

pub fn ipv4_raw(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Packet {
    let mut ip = ipv4_header(src, dst, proto, payload.len(), 0);
    ip.extend_from_slice(payload);
    eth(ETH_P_IP, &ip)
}

pub fn tcp4(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, flags: u8) -> Packet {
    let ip = ipv4_l3(src, dst, IPPROTO_TCP, tcp_header(sport, dport, flags));
    eth(ETH_P_IP, &ip)
}

pub fn udp4(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Packet {
    let ip = ipv4_l3(src, dst, IPPROTO_UDP, udp_header(sport, dport, payload));
    eth(ETH_P_IP, &ip)
}

pub fn icmp4_echo(src: Ipv4Addr, dst: Ipv4Addr, id: u16, reply: bool) -> Packet {
    let ty = if reply { ICMP_ECHOREPLY } else { ICMP_ECHO };
    let ip = ipv4_l3(src, dst, IPPROTO_ICMP, echo(ty, id));
    eth(ETH_P_IP, &ip)
}

/// Destination unreachable from `src` to `dst` quoting `original`.
pub fn icmp4_error(src: Ipv4Addr, dst: Ipv4Addr, original: &Packet) -> Packet {
    let mut icmp = vec![0u8; ICMP_HLEN];
    icmp[0] = ICMP_DEST_UNREACH;
    icmp.extend_from_slice(&original.data()[ETH_HLEN..]);
    let ip = ipv4_l3(src, dst, IPPROTO_ICMP, icmp);
    eth(ETH_P_IP, &ip)
}

/// IPv4 fragment. `offset` is in 8-byte units.
pub fn ipv4_fragment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: u8,
    offset: u16,
    more: bool,
    payload: &[u8],
) -> Packet {
    let frag = (offset & 0x1fff) | if more { 0x2000 } else { 0 };
    let mut ip = ipv4_header(src, dst, proto, payload.len(), frag);
    ip.extend_from_slice(payload);
    eth(ETH_P_IP, &ip)
}

/// First fragment of a TCP segment: a full TCP header with MF set.
pub fn tcp4_first_fragment(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16) -> Packet {
    ipv4_fragment(src, dst, IPPROTO_TCP, 0, true, &tcp_header(sport, dport, TCP_FLAG_ACK))
}

/// Rewrite the IPv6 hop limit of a built frame.
pub fn set_hop_limit(pkt: &mut Packet, hop_limit: u8) {
    pkt.store_bytes(ETH_HLEN + 7, &[hop_limit])
        .expect("frame too short");
}

/// Rewrite the IPv4 TTL of a built frame, keeping the header checksum valid.
pub fn set_ttl(pkt: &mut Packet, ttl: u8) {
    let old = pkt.load_bytes::<2>(ETH_HLEN + 8).expect("frame too short");
    let new = [ttl, old[1]];
    pkt.store_bytes(ETH_HLEN + 8, &new).expect("frame too short");
    pkt.l3_csum_replace(ETH_HLEN + 10, &old, &new)
        .expect("frame too short");
}
