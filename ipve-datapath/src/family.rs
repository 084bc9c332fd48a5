//! Address family abstraction.
//!
//! The egress and ingress stages are written once, generic over
//! [`IpFamily`]. IPv4 support is compiled in only with the `ipv4` feature.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

#[cfg(feature = "ipv4")]
use std::net::Ipv4Addr;

use ipve_common::*;
use smoltcp::wire::Icmpv6Packet;

#[cfg(feature = "ipv4")]
use smoltcp::wire::Icmpv4Packet;

use crate::conntrack::CtAddress;
use crate::csum::CsumOffset;
use crate::error::Result;
use crate::packet::Packet;
use crate::{ipv6, tuple::CtTuple};

#[cfg(feature = "ipv4")]
use crate::ipv4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Ipv6,
    Ipv4,
}

impl Family {
    pub(crate) const fn index(self) -> usize {
        match self {
            Family::Ipv6 => 0,
            Family::Ipv4 => 1,
        }
    }
}

/// Parsed network header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Header<A> {
    pub saddr: A,
    pub daddr: A,
    /// Upper layer protocol after any extension headers.
    pub nexthdr: u8,
    pub l3_off: usize,
    pub l4_off: usize,
    pub is_fragment: bool,
    /// Fragment other than the first; carries no L4 header.
    pub non_first_fragment: bool,
}

/// Type and echo identifier of an ICMP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,
    pub echo_ident: u16,
}

pub trait IpFamily: Send + Sync + 'static {
    type Addr: CtAddress + Into<IpAddr> + fmt::Display;

    const FAMILY: Family;
    const ICMP_PROTO: u8;
    const ICMP_ECHO_REQUEST: u8;
    const ICMP_ECHO_REPLY: u8;
    /// ICMP types that quote the offending packet.
    const ICMP_ERRORS: &'static [u8];

    fn parse(pkt: &Packet, l3_off: usize) -> Result<L3Header<Self::Addr>>;

    /// Read the ICMP header at `l4_off`.
    fn icmp_header(pkt: &Packet, l4_off: usize) -> Result<IcmpHeader>;

    fn from_ip(ip: IpAddr) -> Option<Self::Addr>;

    fn store_saddr(
        pkt: &mut Packet,
        hdr: &L3Header<Self::Addr>,
        csum_off: &CsumOffset,
        addr: Self::Addr,
    ) -> Result<()>;

    fn store_daddr(
        pkt: &mut Packet,
        hdr: &L3Header<Self::Addr>,
        csum_off: &CsumOffset,
        addr: Self::Addr,
    ) -> Result<()>;

    fn decrement_ttl(pkt: &mut Packet, hdr: &L3Header<Self::Addr>) -> Result<()>;

    /// Stamp the sender's security label into the header, where the family
    /// has room for it.
    fn store_seclabel(pkt: &mut Packet, hdr: &L3Header<Self::Addr>, label: u32) -> Result<()>;

    fn is_icmp_error(icmp_type: u8) -> bool {
        Self::ICMP_ERRORS.contains(&icmp_type)
    }
}

pub type Tuple<F> = CtTuple<<F as IpFamily>::Addr>;

pub struct Ipv6;

impl IpFamily for Ipv6 {
    type Addr = Ipv6Addr;

    const FAMILY: Family = Family::Ipv6;
    const ICMP_PROTO: u8 = IPPROTO_ICMPV6;
    const ICMP_ECHO_REQUEST: u8 = ICMPV6_ECHO_REQUEST;
    const ICMP_ECHO_REPLY: u8 = ICMPV6_ECHO_REPLY;
    const ICMP_ERRORS: &'static [u8] = &[
        ICMPV6_DEST_UNREACH,
        ICMPV6_PKT_TOOBIG,
        ICMPV6_TIME_EXCEED,
        ICMPV6_PARAMPROB,
    ];

    fn parse(pkt: &Packet, l3_off: usize) -> Result<L3Header<Ipv6Addr>> {
        ipv6::parse(pkt, l3_off)
    }

    fn icmp_header(pkt: &Packet, l4_off: usize) -> Result<IcmpHeader> {
        pkt.ensure(l4_off, ICMP_HLEN)?;
        let icmp = Icmpv6Packet::new_unchecked(&pkt.data()[l4_off..]);
        Ok(IcmpHeader {
            msg_type: icmp.msg_type().into(),
            echo_ident: icmp.echo_ident(),
        })
    }

    fn from_ip(ip: IpAddr) -> Option<Ipv6Addr> {
        match ip {
            IpAddr::V6(addr) => Some(addr),
            IpAddr::V4(_) => None,
        }
    }

    fn store_saddr(
        pkt: &mut Packet,
        hdr: &L3Header<Ipv6Addr>,
        csum_off: &CsumOffset,
        addr: Ipv6Addr,
    ) -> Result<()> {
        ipv6::store_saddr(pkt, hdr, csum_off, addr)
    }

    fn store_daddr(
        pkt: &mut Packet,
        hdr: &L3Header<Ipv6Addr>,
        csum_off: &CsumOffset,
        addr: Ipv6Addr,
    ) -> Result<()> {
        ipv6::store_daddr(pkt, hdr, csum_off, addr)
    }

    fn decrement_ttl(pkt: &mut Packet, hdr: &L3Header<Ipv6Addr>) -> Result<()> {
        ipv6::decrement_hop_limit(pkt, hdr.l3_off)
    }

    fn store_seclabel(pkt: &mut Packet, hdr: &L3Header<Ipv6Addr>, label: u32) -> Result<()> {
        ipv6::store_flowlabel(pkt, hdr.l3_off, label)
    }
}

#[cfg(feature = "ipv4")]
pub struct Ipv4;

#[cfg(feature = "ipv4")]
impl IpFamily for Ipv4 {
    type Addr = Ipv4Addr;

    const FAMILY: Family = Family::Ipv4;
    const ICMP_PROTO: u8 = IPPROTO_ICMP;
    const ICMP_ECHO_REQUEST: u8 = ICMP_ECHO;
    const ICMP_ECHO_REPLY: u8 = ICMP_ECHOREPLY;
    const ICMP_ERRORS: &'static [u8] = &[ICMP_DEST_UNREACH, ICMP_TIME_EXCEEDED, ICMP_PARAMETERPROB];

    fn parse(pkt: &Packet, l3_off: usize) -> Result<L3Header<Ipv4Addr>> {
        ipv4::parse(pkt, l3_off)
    }

    fn icmp_header(pkt: &Packet, l4_off: usize) -> Result<IcmpHeader> {
        pkt.ensure(l4_off, ICMP_HLEN)?;
        let icmp = Icmpv4Packet::new_unchecked(&pkt.data()[l4_off..]);
        Ok(IcmpHeader {
            msg_type: icmp.msg_type().into(),
            echo_ident: icmp.echo_ident(),
        })
    }

    fn from_ip(ip: IpAddr) -> Option<Ipv4Addr> {
        match ip {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        }
    }

    fn store_saddr(
        pkt: &mut Packet,
        hdr: &L3Header<Ipv4Addr>,
        csum_off: &CsumOffset,
        addr: Ipv4Addr,
    ) -> Result<()> {
        ipv4::store_saddr(pkt, hdr, csum_off, addr)
    }

    fn store_daddr(
        pkt: &mut Packet,
        hdr: &L3Header<Ipv4Addr>,
        csum_off: &CsumOffset,
        addr: Ipv4Addr,
    ) -> Result<()> {
        ipv4::store_daddr(pkt, hdr, csum_off, addr)
    }

    fn decrement_ttl(pkt: &mut Packet, hdr: &L3Header<Ipv4Addr>) -> Result<()> {
        ipv4::decrement_ttl(pkt, hdr.l3_off)
    }

    // No spare header bits in IPv4.
    fn store_seclabel(_pkt: &mut Packet, _hdr: &L3Header<Ipv4Addr>, _label: u32) -> Result<()> {
        Ok(())
    }
}
