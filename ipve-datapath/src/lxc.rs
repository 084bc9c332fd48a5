//! Dispatch orchestrator.
//!
//! A [`Datapath`] holds the node-wide tables and a registry of local
//! [`Endpoint`]s. Each endpoint has two entry points: [`Endpoint::handle_egress`]
//! for frames the workload sends and [`Endpoint::handle_policy`] for frames
//! about to be delivered to it. Both pick the family-specific stage from a
//! [`CallTable`] indexed by direction and family, so each stage can be
//! replaced or exercised on its own.
//!
//! Egress stage:
//!
//! ```text
//! parse -> source check -> flow key -> service -> conntrack -> policy -> hop
//! ```
//!
//! IPv6 egress first offers the frame to the [`RouterResponder`], which
//! answers echo requests and neighbour solicitations for the router address.
//!
//! Ingress policy stage:
//!
//! ```text
//! parse -> flow key -> conntrack -> policy (new/established) -> deliver
//!                                -> reverse NAT (reply/related)
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use ipve_common::*;
use smoltcp::wire::EthernetProtocol;
use tracing::{debug, info};

use crate::config::{ConfigError, DatapathConfig, EndpointConfig, HostConfig, NodeConfig, ServiceConfig};
use crate::conntrack::{Clock, CtMaps, CtObservation, CtState, CtStatus, MonotonicClock};
use crate::context::{Direction, PacketContext};
use crate::error::{DropReason, Result};
use crate::family::{Family, IpFamily, Ipv6};
use crate::icmp6::RouterResponder;
use crate::identity::{EndpointInfo, EndpointMap, IpCache, RemoteEndpointInfo};
use crate::l3::{self, Hop};
use crate::lb::{self, LbKey, LbMap, RevNatEntry, Service};
use crate::monitor::{DropNotify, Monitor, MetricsMap, ObsPoint, TraceNotify};
use crate::packet::Packet;
use crate::policy::PolicyMap;
use crate::tuple;

#[cfg(feature = "ipv4")]
use crate::family::Ipv4;

/// Where an accepted packet goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    LocalEndpoint { lxc_id: u16, ifindex: u32 },
    Host { ifindex: u32 },
    Stack,
    /// The router answered; the packet now holds the reply, sent back out
    /// of the interface it came from.
    Reply { ifindex: u32 },
}

/// Final outcome of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Accept(Forward),
    Drop(DropReason),
}

impl Disposition {
    /// Value returned to the surrounding dispatch framework.
    pub const fn tc_action(&self) -> i32 {
        match self {
            Disposition::Accept(_) => TC_ACT_OK,
            Disposition::Drop(_) => TC_ACT_SHOT,
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, Disposition::Accept(_))
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Disposition::Drop(reason) => Some(*reason),
            Disposition::Accept(_) => None,
        }
    }
}

/// A family-specific processing stage.
pub type Stage = fn(&Datapath, &Endpoint, &mut Packet, &mut PacketContext) -> Disposition;

/// Stage table indexed by direction and family.
#[derive(Clone, Copy)]
pub struct CallTable {
    slots: [[Option<Stage>; 2]; 2],
}

impl CallTable {
    /// Table without any stage; every dispatch misses.
    pub const fn empty() -> Self {
        Self {
            slots: [[None; 2]; 2],
        }
    }

    pub fn set(&mut self, dir: Direction, family: Family, stage: Stage) {
        self.slots[dir.index()][family.index()] = Some(stage);
    }

    pub fn clear(&mut self, dir: Direction, family: Family) {
        self.slots[dir.index()][family.index()] = None;
    }

    pub fn get(&self, dir: Direction, family: Family) -> Option<Stage> {
        self.slots[dir.index()][family.index()]
    }
}

impl Default for CallTable {
    fn default() -> Self {
        let mut calls = Self::empty();
        calls.set(Direction::Egress, Family::Ipv6, ipv6_egress_stage);
        calls.set(Direction::Ingress, Family::Ipv6, policy_stage::<Ipv6>);
        #[cfg(feature = "ipv4")]
        {
            calls.set(Direction::Egress, Family::Ipv4, egress_stage::<Ipv4>);
            calls.set(Direction::Ingress, Family::Ipv4, policy_stage::<Ipv4>);
        }
        calls
    }
}

/// A workload attached to this node.
pub struct Endpoint {
    pub lxc_id: u16,
    pub seclabel: u32,
    pub ifindex: u32,
    pub mac: [u8; 6],
    pub ipv6: Ipv6Addr,
    pub ipv4: Option<Ipv4Addr>,
    /// `EP_F_*` flags.
    pub flags: u32,
    pub policy: PolicyMap,
}

impl Endpoint {
    pub fn from_config(cfg: &EndpointConfig) -> Self {
        let mut flags = 0;
        if cfg.skip_policy_ingress {
            flags |= EP_F_SKIP_POLICY_INGRESS;
        }
        Self {
            lxc_id: cfg.lxc_id,
            seclabel: cfg.seclabel,
            ifindex: cfg.ifindex,
            mac: cfg.mac.0,
            ipv6: cfg.ipv6,
            ipv4: cfg.ipv4,
            flags,
            policy: PolicyMap::new(cfg.egress.clone(), cfg.ingress.clone()),
        }
    }

    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        std::iter::once(IpAddr::V6(self.ipv6)).chain(self.ipv4.map(IpAddr::V4))
    }

    /// Configured address of family `F`.
    pub fn address<F: IpFamily>(&self) -> Option<F::Addr> {
        self.addresses().find_map(F::from_ip)
    }

    pub fn skip_policy_ingress(&self) -> bool {
        self.flags & EP_F_SKIP_POLICY_INGRESS != 0
    }

    /// Process a frame sent by this endpoint.
    pub fn handle_egress(&self, dp: &Datapath, pkt: &mut Packet) -> Disposition {
        let mut ctx = PacketContext::default();
        self.process_egress(dp, pkt, &mut ctx)
    }

    fn process_egress(&self, dp: &Datapath, pkt: &mut Packet, ctx: &mut PacketContext) -> Disposition {
        ctx.clear();
        dp.trace(&TraceNotify {
            obs_point: ObsPoint::FromLxc,
            src_label: self.seclabel,
            dst_label: 0,
            ifindex: self.ifindex,
            reason: 0,
            cap_len: TRACE_PAYLOAD_LEN,
            len: pkt.len() as u32,
        });

        match dp.dispatch(Direction::Egress, self, pkt, ctx) {
            Ok(disposition) => disposition,
            Err(reason) => dp.drop_packet(&DropNotify {
                src_label: self.seclabel,
                dst_label: 0,
                source: self.lxc_id,
                ifindex: self.ifindex,
                reason,
                exit_code: TC_ACT_SHOT,
                direction: Direction::Egress,
                len: pkt.len() as u32,
            }),
        }
    }

    /// Process a frame about to be delivered to this endpoint.
    ///
    /// `ctx` carries the sender's label and the target interface as set by
    /// the stage that handed the packet over.
    pub fn handle_policy(&self, dp: &Datapath, pkt: &mut Packet, ctx: &mut PacketContext) -> Disposition {
        let res = if self.policy.has_ingress() {
            dp.dispatch(Direction::Ingress, self, pkt, ctx)
        } else {
            Err(DropReason::NoConfig)
        };
        match res {
            Ok(disposition) => disposition,
            Err(reason) => dp.drop_packet(&DropNotify {
                src_label: ctx.src_label,
                dst_label: self.seclabel,
                source: self.lxc_id,
                ifindex: ctx.ifindex,
                reason,
                exit_code: TC_ACT_SHOT,
                direction: Direction::Ingress,
                len: pkt.len() as u32,
            }),
        }
    }
}

/// IPv6 egress stage: router ICMPv6 first, then [`egress_stage`].
pub fn ipv6_egress_stage(
    dp: &Datapath,
    ep: &Endpoint,
    pkt: &mut Packet,
    ctx: &mut PacketContext,
) -> Disposition {
    let Some(router) = dp.router() else {
        return egress_stage::<Ipv6>(dp, ep, pkt, ctx);
    };
    match router.process(pkt.data()) {
        Ok(None) => egress_stage::<Ipv6>(dp, ep, pkt, ctx),
        Ok(Some(reply)) => {
            *pkt = Packet::new(reply);
            dp.metrics.forwarded(Direction::Egress, pkt.len() as u64);
            Disposition::Accept(Forward::Reply { ifindex: ep.ifindex })
        }
        Err(reason) => dp.drop_packet(&DropNotify {
            src_label: ep.seclabel,
            dst_label: 0,
            source: ep.lxc_id,
            ifindex: ep.ifindex,
            reason,
            exit_code: TC_ACT_SHOT,
            direction: Direction::Egress,
            len: pkt.len() as u32,
        }),
    }
}

/// Egress stage of family `F`.
pub fn egress_stage<F: IpFamily>(
    dp: &Datapath,
    ep: &Endpoint,
    pkt: &mut Packet,
    ctx: &mut PacketContext,
) -> Disposition {
    let mut dst_label = 0;
    match egress::<F>(dp, ep, pkt, ctx, &mut dst_label) {
        Ok(disposition) => disposition,
        Err(reason) => dp.drop_packet(&DropNotify {
            src_label: ep.seclabel,
            dst_label,
            source: ep.lxc_id,
            ifindex: ep.ifindex,
            reason,
            exit_code: TC_ACT_SHOT,
            direction: Direction::Egress,
            len: pkt.len() as u32,
        }),
    }
}

fn egress<F: IpFamily>(
    dp: &Datapath,
    ep: &Endpoint,
    pkt: &mut Packet,
    ctx: &mut PacketContext,
    dst_label: &mut u32,
) -> Result<Disposition> {
    let hdr = F::parse(pkt, ETH_HLEN)?;
    if ep.address::<F>() != Some(hdr.saddr) {
        return Err(DropReason::InvalidSourceAddress);
    }

    let mut flow = tuple::extract::<F>(pkt, &hdr, Direction::Egress)?;
    let orig_daddr = flow.tuple.daddr;
    let mut state = CtState::default();

    // Only TCP and UDP can address a service.
    if let Ok(key) = lb::extract_key(&flow.tuple) {
        state.orig_dport = key.dport;
        lb::lb_local::<F>(&dp.lb, pkt, &hdr, &key, &mut flow, &mut state)?;
    }

    *dst_label = dp.ipcache.resolve_label(orig_daddr);

    let obs = CtObservation {
        bytes: pkt.len() as u64,
        tcp_flags: flow.tcp_flags,
    };
    let ct = dp.ct.lookup(&flow.tuple, flow.related.as_ref(), &obs)?;

    match ct.status {
        CtStatus::New | CtStatus::Established => {
            let verdict = ep.policy.can_egress(
                *dst_label,
                flow.tuple.dport,
                flow.tuple.nexthdr,
                flow.tuple.daddr.into(),
            );
            if let Some(reason) = verdict.deny_reason() {
                if ct.status == CtStatus::Established {
                    dp.ct.delete(&flow.tuple);
                }
                return Err(reason);
            }
            if ct.status == CtStatus::New {
                state.src_sec_id = ep.seclabel;
                dp.ct.create(&flow.tuple, &state, &obs);
            }
        }
        CtStatus::Reply | CtStatus::Related => {
            ctx.mark_policy_skip();
            if ct.rev_nat_index != 0 {
                lb::rev_nat::<F>(&dp.lb, pkt, &hdr, &mut flow, ct.rev_nat_index)?;
            }
        }
    }

    let hop = Hop {
        seclabel: ep.seclabel,
        dst_label: *dst_label,
        reason: ct.status.code(),
        monitor: ct.monitor,
    };
    match dp.endpoints.lookup(flow.tuple.daddr) {
        Some(info) if info.is_host() => l3::to_host::<F>(dp, pkt, &hdr, &hop),
        Some(info) => l3::local_delivery::<F>(dp, pkt, &hdr, ctx, &info, &hop),
        None => l3::to_stack::<F>(dp, pkt, &hdr, &hop),
    }
}

/// Ingress policy stage of family `F`.
pub fn policy_stage<F: IpFamily>(
    dp: &Datapath,
    ep: &Endpoint,
    pkt: &mut Packet,
    ctx: &mut PacketContext,
) -> Disposition {
    match ingress_policy::<F>(dp, ep, pkt, ctx) {
        Ok(disposition) => disposition,
        Err(reason) => dp.drop_packet(&DropNotify {
            src_label: ctx.src_label,
            dst_label: ep.seclabel,
            source: ep.lxc_id,
            ifindex: ctx.ifindex,
            reason,
            exit_code: TC_ACT_SHOT,
            direction: Direction::Ingress,
            len: pkt.len() as u32,
        }),
    }
}

fn ingress_policy<F: IpFamily>(
    dp: &Datapath,
    ep: &Endpoint,
    pkt: &mut Packet,
    ctx: &mut PacketContext,
) -> Result<Disposition> {
    let hdr = F::parse(pkt, ETH_HLEN)?;
    ctx.clear_policy_skip();

    let mut flow = tuple::extract::<F>(pkt, &hdr, Direction::Ingress)?;
    let obs = CtObservation {
        bytes: pkt.len() as u64,
        tcp_flags: flow.tcp_flags,
    };
    let ct = dp.ct.lookup(&flow.tuple, flow.related.as_ref(), &obs)?;

    match ct.status {
        CtStatus::Reply | CtStatus::Related => {
            if ct.rev_nat_index != 0 && !ct.loopback {
                lb::rev_nat::<F>(&dp.lb, pkt, &hdr, &mut flow, ct.rev_nat_index)?;
            }
        }
        CtStatus::New | CtStatus::Established => {
            if !ep.skip_policy_ingress() {
                let verdict = ep.policy.can_access_ingress(
                    ctx.src_label,
                    flow.tuple.dport,
                    flow.tuple.nexthdr,
                    flow.tuple.saddr.into(),
                    hdr.is_fragment,
                );
                if let Some(reason) = verdict.deny_reason() {
                    if ct.status == CtStatus::Established {
                        dp.ct.delete(&flow.tuple);
                    }
                    return Err(reason);
                }
            }
            if ct.status == CtStatus::New {
                let state = CtState {
                    src_sec_id: ctx.src_label,
                    orig_dport: flow.tuple.dport,
                    ..Default::default()
                };
                dp.ct.create(&flow.tuple, &state, &obs);
            }
        }
    }

    dp.trace(&TraceNotify {
        obs_point: ObsPoint::ToLxc,
        src_label: ctx.src_label,
        dst_label: ep.seclabel,
        ifindex: ep.ifindex,
        reason: ct.status.code(),
        cap_len: ct.monitor,
        len: pkt.len() as u32,
    });
    dp.metrics.forwarded(Direction::Ingress, pkt.len() as u64);
    Ok(Disposition::Accept(Forward::LocalEndpoint {
        lxc_id: ep.lxc_id,
        ifindex: ep.ifindex,
    }))
}

/// Node-wide tables plus the endpoint registry.
pub struct Datapath {
    router_mac: [u8; 6],
    router: Option<RouterResponder>,
    host: Option<HostConfig>,
    pub ct: Arc<CtMaps>,
    pub lb: LbMap,
    pub endpoints: EndpointMap,
    pub ipcache: IpCache,
    pub metrics: MetricsMap,
    monitor: Arc<dyn Monitor>,
    calls: CallTable,
    lxcs: ArcSwap<HashMap<u16, Arc<Endpoint>>>,
}

impl Datapath {
    pub fn new(node: &NodeConfig, monitor: Arc<dyn Monitor>) -> Self {
        Self::with_clock(node, monitor, Arc::new(MonotonicClock))
    }

    pub fn with_clock(node: &NodeConfig, monitor: Arc<dyn Monitor>, clock: Arc<dyn Clock>) -> Self {
        let dp = Self {
            router_mac: node.router_mac.0,
            router: node
                .router_ipv6
                .map(|addr| RouterResponder::new(node.router_mac.0, addr)),
            host: node.host,
            ct: Arc::new(CtMaps::with_clock(node.conntrack, clock)),
            lb: LbMap::new(),
            endpoints: EndpointMap::new(),
            ipcache: IpCache::new(),
            metrics: MetricsMap::new(),
            monitor,
            calls: CallTable::default(),
            lxcs: ArcSwap::from_pointee(HashMap::new()),
        };

        for addr in &node.host_addresses {
            dp.endpoints.insert(
                *addr,
                EndpointInfo {
                    ifindex: node.host.map_or(0, |h| h.ifindex),
                    lxc_id: 0,
                    mac: node.host.map_or([0; 6], |h| h.mac.0),
                    node_mac: node.router_mac.0,
                    flags: ENDPOINT_F_HOST,
                },
            );
            dp.ipcache.upsert(
                IpNet::from(*addr),
                RemoteEndpointInfo {
                    sec_label: HOST_ID,
                    tunnel_endpoint: None,
                },
            );
        }
        dp
    }

    /// Build a datapath with every endpoint, service and prefix of `config`.
    pub fn from_config(config: &DatapathConfig, monitor: Arc<dyn Monitor>) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let dp = Self::new(&config.node, monitor);
        for ep in &config.endpoints {
            dp.add_endpoint(ep);
        }
        for svc in &config.services {
            dp.add_service(svc);
        }
        for entry in &config.ipcache {
            dp.ipcache.upsert(entry.prefix, entry.info);
        }
        info!(
            endpoints = config.endpoints.len(),
            services = config.services.len(),
            prefixes = config.ipcache.len(),
            "Datapath configured"
        );
        Ok(dp)
    }

    /// Replace the stage table.
    pub fn with_call_table(mut self, calls: CallTable) -> Self {
        self.calls = calls;
        self
    }

    pub fn router_mac(&self) -> [u8; 6] {
        self.router_mac
    }

    pub fn router(&self) -> Option<&RouterResponder> {
        self.router.as_ref()
    }

    pub fn host(&self) -> Option<HostConfig> {
        self.host
    }

    /// Register an endpoint. An endpoint with the same id is replaced.
    pub fn add_endpoint(&self, cfg: &EndpointConfig) -> Arc<Endpoint> {
        let ep = Arc::new(Endpoint::from_config(cfg));
        self.endpoints.remove_endpoint(ep.lxc_id);
        for addr in ep.addresses() {
            self.endpoints.insert(
                addr,
                EndpointInfo {
                    ifindex: ep.ifindex,
                    lxc_id: ep.lxc_id,
                    mac: ep.mac,
                    node_mac: self.router_mac,
                    flags: 0,
                },
            );
            self.ipcache.upsert(
                IpNet::from(addr),
                RemoteEndpointInfo {
                    sec_label: ep.seclabel,
                    tunnel_endpoint: None,
                },
            );
        }

        let mut lxcs = (**self.lxcs.load()).clone();
        lxcs.insert(ep.lxc_id, ep.clone());
        self.lxcs.store(Arc::new(lxcs));

        debug!(lxc_id = ep.lxc_id, seclabel = ep.seclabel, ipv6 = %ep.ipv6, "Endpoint added");
        ep
    }

    pub fn remove_endpoint(&self, lxc_id: u16) -> Option<Arc<Endpoint>> {
        let mut lxcs = (**self.lxcs.load()).clone();
        let ep = lxcs.remove(&lxc_id)?;
        self.lxcs.store(Arc::new(lxcs));

        self.endpoints.remove_endpoint(lxc_id);
        for addr in ep.addresses() {
            self.ipcache.remove(&IpNet::from(addr));
        }
        debug!(lxc_id, "Endpoint removed");
        Some(ep)
    }

    pub fn endpoint(&self, lxc_id: u16) -> Option<Arc<Endpoint>> {
        self.lxcs.load().get(&lxc_id).cloned()
    }

    pub fn add_service(&self, svc: &ServiceConfig) {
        self.lb.upsert_service(
            LbKey {
                address: svc.frontend,
                dport: svc.port,
            },
            Service {
                rev_nat_index: svc.rev_nat_index,
                backends: svc.backends.clone(),
            },
        );
        self.lb.upsert_rev_nat(
            svc.rev_nat_index,
            RevNatEntry {
                address: svc.frontend,
                port: svc.port,
            },
        );
        debug!(
            frontend = %svc.frontend,
            port = svc.port,
            backends = svc.backends.len(),
            "Service added"
        );
    }

    /// Egress entry for the endpoint with id `lxc_id`.
    pub fn handle_egress(&self, lxc_id: u16, pkt: &mut Packet) -> Disposition {
        match self.endpoint(lxc_id) {
            Some(ep) => ep.handle_egress(self, pkt),
            None => self.drop_packet(&DropNotify {
                src_label: 0,
                dst_label: 0,
                source: lxc_id,
                ifindex: 0,
                reason: DropReason::NoConfig,
                exit_code: TC_ACT_SHOT,
                direction: Direction::Egress,
                len: pkt.len() as u32,
            }),
        }
    }

    /// Ingress entry for a packet from `src_label` to endpoint `lxc_id`.
    pub fn handle_ingress(&self, lxc_id: u16, src_label: u32, pkt: &mut Packet) -> Disposition {
        match self.endpoint(lxc_id) {
            Some(ep) => {
                let mut ctx = PacketContext::ingress(src_label, ep.ifindex);
                ep.handle_policy(self, pkt, &mut ctx)
            }
            None => self.drop_packet(&DropNotify {
                src_label,
                dst_label: 0,
                source: lxc_id,
                ifindex: 0,
                reason: DropReason::NoConfig,
                exit_code: TC_ACT_SHOT,
                direction: Direction::Ingress,
                len: pkt.len() as u32,
            }),
        }
    }

    /// Run the stage registered for the frame's family.
    fn dispatch(
        &self,
        dir: Direction,
        ep: &Endpoint,
        pkt: &mut Packet,
        ctx: &mut PacketContext,
    ) -> Result<Disposition> {
        let family = match pkt.protocol() {
            None => return Err(DropReason::InvalidPacket),
            Some(EthernetProtocol::Ipv6) => Family::Ipv6,
            #[cfg(feature = "ipv4")]
            Some(EthernetProtocol::Ipv4) => Family::Ipv4,
            Some(_) => return Err(DropReason::UnknownL3Protocol),
        };
        let stage = self
            .calls
            .get(dir, family)
            .ok_or(DropReason::MissedStageDispatch)?;
        Ok(stage(self, ep, pkt, ctx))
    }

    pub fn trace(&self, event: &TraceNotify) {
        self.monitor.trace_notify(event);
    }

    /// Report a drop and return the drop disposition.
    pub fn drop_packet(&self, event: &DropNotify) -> Disposition {
        self.monitor.drop_notify(event);
        self.metrics
            .dropped(event.reason, event.direction, event.len as u64);
        Disposition::Drop(event.reason)
    }
}
