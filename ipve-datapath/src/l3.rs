//! Terminal hops of the egress path.
//!
//! Every hop routes the packet (MAC rewrite plus TTL or hop limit
//! decrement) and then either hands it to a local endpoint's ingress stage,
//! to the host interface, or back to the stack for forwarding.

use ipve_common::HOST_ID;

use crate::context::{Direction, PacketContext};
use crate::error::{DropReason, Result};
use crate::family::{IpFamily, L3Header};
use crate::identity::EndpointInfo;
use crate::lxc::{Datapath, Disposition, Forward};
use crate::monitor::{ObsPoint, TraceNotify};
use crate::packet::Packet;

/// What the egress stage learned about the packet on its way to a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    pub seclabel: u32,
    pub dst_label: u32,
    /// Connection tracking status code.
    pub reason: u8,
    /// Capture length hint.
    pub monitor: u32,
}

/// Route the packet one hop: rewrite L2 and age the network header.
pub fn l3_forward<F: IpFamily>(
    pkt: &mut Packet,
    hdr: &L3Header<F::Addr>,
    smac: Option<[u8; 6]>,
    dmac: [u8; 6],
) -> Result<()> {
    F::decrement_ttl(pkt, hdr)?;
    pkt.store_macs(smac, Some(dmac))
}

/// Deliver to an endpoint on this node through its ingress policy stage.
pub fn local_delivery<F: IpFamily>(
    dp: &Datapath,
    pkt: &mut Packet,
    hdr: &L3Header<F::Addr>,
    ctx: &mut PacketContext,
    ep: &EndpointInfo,
    hop: &Hop,
) -> Result<Disposition> {
    ctx.clear_policy_skip();
    l3_forward::<F>(pkt, hdr, Some(ep.node_mac), ep.mac)?;

    ctx.src_label = hop.seclabel;
    ctx.ifindex = ep.ifindex;
    dp.metrics.forwarded(Direction::Egress, pkt.len() as u64);

    let target = dp
        .endpoint(ep.lxc_id)
        .ok_or(DropReason::MissedStageDispatch)?;
    Ok(target.handle_policy(dp, pkt, ctx))
}

/// Deliver to the host interface.
pub fn to_host<F: IpFamily>(
    dp: &Datapath,
    pkt: &mut Packet,
    hdr: &L3Header<F::Addr>,
    hop: &Hop,
) -> Result<Disposition> {
    let host = dp.host().ok_or(DropReason::HostUnreachable)?;
    l3_forward::<F>(pkt, hdr, Some(dp.router_mac()), host.mac.0)?;

    dp.trace(&TraceNotify {
        obs_point: ObsPoint::ToHost,
        src_label: hop.seclabel,
        dst_label: HOST_ID,
        ifindex: host.ifindex,
        reason: hop.reason,
        cap_len: hop.monitor,
        len: pkt.len() as u32,
    });
    dp.metrics.forwarded(Direction::Egress, pkt.len() as u64);
    Ok(Disposition::Accept(Forward::Host {
        ifindex: host.ifindex,
    }))
}

/// Hand the packet to the stack for forwarding off the node.
pub fn to_stack<F: IpFamily>(
    dp: &Datapath,
    pkt: &mut Packet,
    hdr: &L3Header<F::Addr>,
    hop: &Hop,
) -> Result<Disposition> {
    l3_forward::<F>(pkt, hdr, None, dp.router_mac())?;
    F::store_seclabel(pkt, hdr, hop.seclabel)?;

    dp.trace(&TraceNotify {
        obs_point: ObsPoint::ToStack,
        src_label: hop.seclabel,
        dst_label: hop.dst_label,
        ifindex: 0,
        reason: hop.reason,
        cap_len: hop.monitor,
        len: pkt.len() as u32,
    });
    dp.metrics.forwarded(Direction::Egress, pkt.len() as u64);
    Ok(Disposition::Accept(Forward::Stack))
}
