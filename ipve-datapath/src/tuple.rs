//! Flow identification.
//!
//! Turns a parsed network header into the connection tracking key of the
//! packet. Ports come from TCP/UDP; ICMP echo messages use their identifier
//! in place of a port so requests and replies pair up, and ICMP errors yield
//! the tuple of the packet they quote so they can be matched as related.

use ipve_common::*;

use crate::context::Direction;
use crate::csum::{self, CsumOffset};
use crate::error::{DropReason, Result};
use crate::family::{IcmpHeader, IpFamily, L3Header, Tuple};
use crate::packet::Packet;
use smoltcp::wire::{TcpPacket, UdpPacket};

/// Connection tracking key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtTuple<A> {
    pub daddr: A,
    pub saddr: A,
    pub dport: u16,
    pub sport: u16,
    pub nexthdr: u8,
    pub flags: u8,
}

impl<A: Copy> CtTuple<A> {
    pub fn new(saddr: A, daddr: A, nexthdr: u8, dir: Direction) -> Self {
        Self {
            daddr,
            saddr,
            dport: 0,
            sport: 0,
            nexthdr,
            flags: dir.tuple_flag(),
        }
    }

    pub fn with_ports(mut self, sport: u16, dport: u16) -> Self {
        self.sport = sport;
        self.dport = dport;
        self
    }

    /// Key the same flow has when seen travelling the other way.
    pub fn reverse(&self) -> Self {
        Self {
            daddr: self.saddr,
            saddr: self.daddr,
            dport: self.sport,
            sport: self.dport,
            nexthdr: self.nexthdr,
            flags: self.flags ^ TUPLE_F_IN,
        }
    }

    pub fn direction(&self) -> Direction {
        if self.flags & TUPLE_F_IN != 0 {
            Direction::Ingress
        } else {
            Direction::Egress
        }
    }

    pub fn is_related(&self) -> bool {
        self.flags & TUPLE_F_RELATED != 0
    }

    pub fn has_ports(&self) -> bool {
        matches!(self.nexthdr, IPPROTO_TCP | IPPROTO_UDP)
    }
}

/// Everything the stages need to know about a packet's flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowKey<A> {
    pub tuple: CtTuple<A>,
    /// Quoted flow of an ICMP error.
    pub related: Option<CtTuple<A>>,
    pub tcp_flags: u8,
    pub csum_off: CsumOffset,
}

/// Build the flow key of the packet described by `hdr`.
///
/// Protocols without ports, and fragments after the first, get zero ports.
pub fn extract<F: IpFamily>(
    pkt: &Packet,
    hdr: &L3Header<F::Addr>,
    dir: Direction,
) -> Result<FlowKey<F::Addr>> {
    let mut key = FlowKey {
        tuple: CtTuple::new(hdr.saddr, hdr.daddr, hdr.nexthdr, dir),
        related: None,
        tcp_flags: 0,
        csum_off: csum::csum_l4_offset_and_flags(hdr.nexthdr),
    };
    if hdr.non_first_fragment {
        return Ok(key);
    }

    let l4 = hdr.l4_off;
    match hdr.nexthdr {
        IPPROTO_TCP => {
            let data = pkt.data().get(l4..).ok_or(DropReason::InvalidPacket)?;
            let tcp = TcpPacket::new_checked(data)?;
            key.tuple = key.tuple.with_ports(tcp.src_port(), tcp.dst_port());
            key.tcp_flags = tcp_flags(&tcp);
        }
        IPPROTO_UDP => {
            let (sport, dport) = ports(pkt, l4)?;
            key.tuple = key.tuple.with_ports(sport, dport);
        }
        p if p == F::ICMP_PROTO => {
            let icmp = F::icmp_header(pkt, l4)?;
            if F::is_icmp_error(icmp.msg_type) {
                key.related = Some(quoted_tuple::<F>(pkt, l4 + ICMP_HLEN, dir)?);
            } else {
                key.tuple = icmp_echo_ports::<F>(&icmp, key.tuple);
            }
        }
        _ => {}
    }

    Ok(key)
}

fn tcp_flags<T: AsRef<[u8]>>(tcp: &TcpPacket<T>) -> u8 {
    [
        (tcp.fin(), TCP_FLAG_FIN),
        (tcp.syn(), TCP_FLAG_SYN),
        (tcp.rst(), TCP_FLAG_RST),
        (tcp.psh(), TCP_FLAG_PSH),
        (tcp.ack(), TCP_FLAG_ACK),
        (tcp.urg(), TCP_FLAG_URG),
    ]
    .into_iter()
    .filter(|(set, _)| *set)
    .fold(0, |flags, (_, bit)| flags | bit)
}

/// Source and destination port of a TCP or UDP header.
///
/// Only the first four bytes are required; a UDP datagram split into
/// fragments or quoted in an ICMP error is shorter than its length field.
fn ports(pkt: &Packet, l4_off: usize) -> Result<(u16, u16)> {
    pkt.ensure(l4_off, 4)?;
    let udp = UdpPacket::new_unchecked(&pkt.data()[l4_off..]);
    Ok((udp.src_port(), udp.dst_port()))
}

fn icmp_echo_ports<F: IpFamily>(icmp: &IcmpHeader, tuple: Tuple<F>) -> Tuple<F> {
    if icmp.msg_type == F::ICMP_ECHO_REQUEST {
        tuple.with_ports(icmp.echo_ident, 0)
    } else if icmp.msg_type == F::ICMP_ECHO_REPLY {
        tuple.with_ports(0, icmp.echo_ident)
    } else {
        tuple
    }
}

/// Tuple of the packet quoted in an ICMP error, keyed the way it was tracked
/// when it travelled in the opposite direction.
fn quoted_tuple<F: IpFamily>(pkt: &Packet, off: usize, dir: Direction) -> Result<Tuple<F>> {
    let inner = F::parse(pkt, off)?;
    let tuple = CtTuple::new(inner.saddr, inner.daddr, inner.nexthdr, dir.reverse());
    if inner.non_first_fragment {
        return Ok(tuple);
    }

    match inner.nexthdr {
        IPPROTO_TCP | IPPROTO_UDP => {
            let (sport, dport) = ports(pkt, inner.l4_off)?;
            Ok(tuple.with_ports(sport, dport))
        }
        p if p == F::ICMP_PROTO => {
            let icmp = F::icmp_header(pkt, inner.l4_off)?;
            Ok(icmp_echo_ports::<F>(&icmp, tuple))
        }
        _ => Ok(tuple),
    }
}
