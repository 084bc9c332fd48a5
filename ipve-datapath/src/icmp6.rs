//! ICMPv6 responder for the router address.
//!
//! Endpoints ping their gateway and resolve its link-layer address like any
//! other neighbour. Echo requests to the router address get an echo reply,
//! neighbour solicitations for it get an advertisement carrying the router
//! MAC. All other ICMPv6 continues through the egress stage.

use std::net::Ipv6Addr;

use ipve_common::ICMP_HLEN;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv6Message, Icmpv6Packet,
    Icmpv6Repr, IpProtocol, Ipv6Packet, Ipv6Repr, NdiscNeighborFlags, NdiscRepr,
    RawHardwareAddress,
};
use tracing::debug;

use crate::error::{DropReason, Result};

/// IPv6 all-nodes multicast address
pub const ALL_NODES_MULTICAST: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

const ALL_NODES_MAC: EthernetAddress = EthernetAddress([0x33, 0x33, 0, 0, 0, 1]);

/// Answers ICMPv6 addressed to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterResponder {
    mac: EthernetAddress,
    ipv6: Ipv6Addr,
}

impl RouterResponder {
    pub fn new(mac: [u8; 6], ipv6: Ipv6Addr) -> Self {
        Self {
            mac: EthernetAddress(mac),
            ipv6,
        }
    }

    pub fn address(&self) -> Ipv6Addr {
        self.ipv6
    }

    /// Process a frame sent by an endpoint.
    ///
    /// Returns `Some(frame)` with the reply when the router answers the
    /// message itself, `None` when the frame is not for the router.
    pub fn process(&self, packet: &[u8]) -> Result<Option<Vec<u8>>> {
        let Ok(frame) = EthernetFrame::new_checked(packet) else {
            return Ok(None);
        };
        if frame.ethertype() != EthernetProtocol::Ipv6 {
            return Ok(None);
        }
        let Ok(ipv6) = Ipv6Packet::new_checked(frame.payload()) else {
            return Ok(None);
        };
        if ipv6.next_header() != IpProtocol::Icmpv6 {
            return Ok(None);
        }
        if ipv6.payload().len() < ICMP_HLEN {
            return Err(DropReason::InvalidPacket);
        }

        let src_addr = ipv6.src_addr();
        let dst_addr = ipv6.dst_addr();
        let icmp = Icmpv6Packet::new_checked(ipv6.payload())?;
        match icmp.msg_type() {
            Icmpv6Message::EchoRequest if dst_addr == self.ipv6 => {}
            Icmpv6Message::NeighborSolicit => {}
            _ => return Ok(None),
        }

        let repr = Icmpv6Repr::parse(
            &src_addr,
            &dst_addr,
            &icmp,
            &ChecksumCapabilities::default(),
        )?;

        match repr {
            Icmpv6Repr::EchoRequest {
                ident,
                seq_no,
                data,
            } if dst_addr == self.ipv6 => {
                debug!(src_ip = %src_addr, ident, seq_no, "ICMPv6 Echo Request for router");
                Ok(Some(self.build_echo_reply(
                    frame.src_addr(),
                    src_addr,
                    ident,
                    seq_no,
                    data,
                )))
            }
            Icmpv6Repr::Ndisc(NdiscRepr::NeighborSolicit { target_addr, .. })
                if target_addr == self.ipv6 =>
            {
                debug!(
                    source_ip = %src_addr,
                    source_mac = %frame.src_addr(),
                    "NDP Neighbor Solicitation for router"
                );
                Ok(Some(
                    self.build_neighbor_advertisement(frame.src_addr(), src_addr),
                ))
            }
            _ => Ok(None),
        }
    }

    fn build_echo_reply(
        &self,
        dst_mac: EthernetAddress,
        dst_ip: Ipv6Addr,
        ident: u16,
        seq_no: u16,
        data: &[u8],
    ) -> Vec<u8> {
        let icmp_repr = Icmpv6Repr::EchoReply {
            ident,
            seq_no,
            data,
        };
        self.emit(dst_mac, dst_ip, 64, &icmp_repr)
    }

    /// Advertisement for the router address. A solicitation from the
    /// unspecified address is duplicate address detection and is answered to
    /// all nodes, unsolicited.
    fn build_neighbor_advertisement(&self, dst_mac: EthernetAddress, dst_ip: Ipv6Addr) -> Vec<u8> {
        let (dst_mac, dst_ip, flags) = if dst_ip.is_unspecified() {
            (ALL_NODES_MAC, ALL_NODES_MULTICAST, NdiscNeighborFlags::ROUTER)
        } else {
            (
                dst_mac,
                dst_ip,
                NdiscNeighborFlags::ROUTER | NdiscNeighborFlags::SOLICITED,
            )
        };
        let icmp_repr = Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
            flags,
            target_addr: self.ipv6,
            lladdr: Some(RawHardwareAddress::from_bytes(&self.mac.0)),
        });
        self.emit(dst_mac, dst_ip, 255, &icmp_repr)
    }

    fn emit(
        &self,
        dst_mac: EthernetAddress,
        dst_ip: Ipv6Addr,
        hop_limit: u8,
        icmp_repr: &Icmpv6Repr<'_>,
    ) -> Vec<u8> {
        let ipv6_repr = Ipv6Repr {
            src_addr: self.ipv6,
            dst_addr: dst_ip,
            next_header: IpProtocol::Icmpv6,
            payload_len: icmp_repr.buffer_len(),
            hop_limit,
        };
        let eth_repr = EthernetRepr {
            src_addr: self.mac,
            dst_addr: dst_mac,
            ethertype: EthernetProtocol::Ipv6,
        };

        let total_len = eth_repr.buffer_len() + ipv6_repr.buffer_len() + icmp_repr.buffer_len();
        let mut buffer = vec![0u8; total_len];

        let mut frame = EthernetFrame::new_unchecked(&mut buffer);
        eth_repr.emit(&mut frame);

        let mut ipv6_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
        ipv6_repr.emit(&mut ipv6_packet);

        let mut icmp_packet = Icmpv6Packet::new_unchecked(ipv6_packet.payload_mut());
        icmp_repr.emit(
            &self.ipv6,
            &dst_ip,
            &mut icmp_packet,
            &ChecksumCapabilities::default(),
        );

        buffer
    }
}
