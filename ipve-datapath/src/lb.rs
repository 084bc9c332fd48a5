//! Service load balancing.
//!
//! Egress traffic to a service frontend is rewritten to a backend before it
//! reaches connection tracking. The service's reverse NAT index is stored in
//! the new connection so replies can be translated back to the frontend.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conntrack::CtState;
use crate::csum::CsumOffset;
use crate::error::{DropReason, Result};
use crate::family::{IpFamily, L3Header, Tuple};
use crate::packet::Packet;
use crate::tuple::{CtTuple, FlowKey};

/// Service frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LbKey {
    pub address: IpAddr,
    pub dport: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub address: IpAddr,
    /// 0 keeps the frontend port.
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub rev_nat_index: u16,
    pub backends: Vec<Backend>,
}

/// Frontend restored on replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNatEntry {
    pub address: IpAddr,
    pub port: u16,
}

/// Picks the backend a new flow is sent to.
pub trait BackendSelector: Send + Sync {
    /// Index into `service.backends`. The service has at least one backend.
    fn select(&self, service: &Service, flow_hash: u64) -> usize;
}

/// Hashes the flow so every packet of a flow picks the same backend.
#[derive(Debug, Default)]
pub struct HashSelector;

impl BackendSelector for HashSelector {
    fn select(&self, service: &Service, flow_hash: u64) -> usize {
        (flow_hash % service.backends.len() as u64) as usize
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl BackendSelector for RoundRobinSelector {
    fn select(&self, service: &Service, _flow_hash: u64) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % service.backends.len()
    }
}

/// Service and reverse NAT tables.
pub struct LbMap {
    services: ArcSwap<HashMap<LbKey, Arc<Service>>>,
    rev_nat: ArcSwap<HashMap<u16, RevNatEntry>>,
    selector: Box<dyn BackendSelector>,
}

impl LbMap {
    pub fn new() -> Self {
        Self::with_selector(Box::new(HashSelector))
    }

    pub fn with_selector(selector: Box<dyn BackendSelector>) -> Self {
        Self {
            services: ArcSwap::new(Arc::new(HashMap::new())),
            rev_nat: ArcSwap::new(Arc::new(HashMap::new())),
            selector,
        }
    }

    pub fn upsert_service(&self, key: LbKey, service: Service) {
        let mut services = (**self.services.load()).clone();
        services.insert(key, Arc::new(service));
        self.services.store(Arc::new(services));
    }

    pub fn remove_service(&self, key: &LbKey) {
        let mut services = (**self.services.load()).clone();
        services.remove(key);
        self.services.store(Arc::new(services));
    }

    pub fn upsert_rev_nat(&self, index: u16, entry: RevNatEntry) {
        let mut rev_nat = (**self.rev_nat.load()).clone();
        rev_nat.insert(index, entry);
        self.rev_nat.store(Arc::new(rev_nat));
    }

    pub fn remove_rev_nat(&self, index: u16) {
        let mut rev_nat = (**self.rev_nat.load()).clone();
        rev_nat.remove(&index);
        self.rev_nat.store(Arc::new(rev_nat));
    }

    pub fn lookup_service(&self, key: &LbKey) -> Option<Arc<Service>> {
        self.services.load().get(key).cloned()
    }

    pub fn lookup_rev_nat(&self, index: u16) -> Option<RevNatEntry> {
        self.rev_nat.load().get(&index).copied()
    }

    pub fn select_backend(&self, service: &Service, flow_hash: u64) -> Result<Backend> {
        if service.backends.is_empty() {
            return Err(DropReason::NoService);
        }
        let idx = self.selector.select(service, flow_hash);
        service
            .backends
            .get(idx)
            .copied()
            .ok_or(DropReason::NoService)
    }
}

impl Default for LbMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Service key of a flow. Only TCP and UDP flows can address a service.
pub fn extract_key<A: Copy + Into<IpAddr>>(tuple: &CtTuple<A>) -> Result<LbKey> {
    if !tuple.has_ports() {
        return Err(DropReason::UnknownL4);
    }
    Ok(LbKey {
        address: tuple.daddr.into(),
        dport: tuple.dport,
    })
}

/// Stable hash of a flow.
pub fn flow_hash<A: Hash>(tuple: &CtTuple<A>) -> u64 {
    let mut h = DefaultHasher::new();
    tuple.hash(&mut h);
    h.finish()
}

/// Translate a packet addressed to a service frontend.
///
/// Returns the chosen backend, or `None` when `key` is not a service. The
/// tuple is updated to the backend and `state` receives the reverse NAT
/// index and original port for the connection about to be created.
pub fn lb_local<F: IpFamily>(
    lb: &LbMap,
    pkt: &mut Packet,
    hdr: &L3Header<F::Addr>,
    key: &LbKey,
    flow: &mut FlowKey<F::Addr>,
    state: &mut CtState,
) -> Result<Option<Backend>> {
    let Some(service) = lb.lookup_service(key) else {
        return Ok(None);
    };
    let backend = lb.select_backend(&service, flow_hash(&flow.tuple))?;
    let addr = F::from_ip(backend.address).ok_or(DropReason::NoService)?;

    state.rev_nat_index = service.rev_nat_index;
    state.orig_dport = flow.tuple.dport;

    if addr != flow.tuple.daddr {
        F::store_daddr(pkt, hdr, &flow.csum_off, addr)?;
        flow.tuple.daddr = addr;
    }
    if backend.port != 0 && backend.port != flow.tuple.dport && !hdr.non_first_fragment {
        store_port(pkt, hdr.l4_off + 2, hdr.l4_off, &flow.csum_off, flow.tuple.dport, backend.port)?;
        flow.tuple.dport = backend.port;
    }
    state.loopback = flow.tuple.daddr == flow.tuple.saddr;

    debug!(
        frontend = %key.address,
        frontend_port = key.dport,
        backend = %addr,
        backend_port = flow.tuple.dport,
        rev_nat_index = service.rev_nat_index,
        "service translated"
    );
    Ok(Some(backend))
}

/// Restore the frontend recorded under `index` as the packet's source.
///
/// An index without an entry leaves the packet untouched.
pub fn rev_nat<F: IpFamily>(
    lb: &LbMap,
    pkt: &mut Packet,
    hdr: &L3Header<F::Addr>,
    flow: &mut FlowKey<F::Addr>,
    index: u16,
) -> Result<()> {
    let Some(entry) = lb.lookup_rev_nat(index) else {
        return Ok(());
    };
    let Some(addr) = F::from_ip(entry.address) else {
        return Ok(());
    };

    let tuple: &mut Tuple<F> = &mut flow.tuple;
    if entry.port != 0 && tuple.has_ports() && tuple.sport != entry.port && !hdr.non_first_fragment {
        store_port(pkt, hdr.l4_off, hdr.l4_off, &flow.csum_off, tuple.sport, entry.port)?;
        tuple.sport = entry.port;
    }
    if tuple.saddr != addr {
        F::store_saddr(pkt, hdr, &flow.csum_off, addr)?;
        tuple.saddr = addr;
    }
    Ok(())
}

fn store_port(
    pkt: &mut Packet,
    off: usize,
    l4_off: usize,
    csum_off: &CsumOffset,
    old: u16,
    new: u16,
) -> Result<()> {
    pkt.store_bytes(off, &new.to_be_bytes())?;
    pkt.l4_csum_replace(l4_off, csum_off, &old.to_be_bytes(), &new.to_be_bytes(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Direction;
    use ipve_common::{IPPROTO_ICMPV6, IPPROTO_TCP};
    use std::net::Ipv6Addr;

    fn svc(n: usize) -> Service {
        Service {
            rev_nat_index: 7,
            backends: (0..n)
                .map(|i| Backend {
                    address: format!("f00d::b{i}").parse().unwrap(),
                    port: 8080,
                })
                .collect(),
        }
    }

    fn tuple(sport: u16) -> CtTuple<Ipv6Addr> {
        CtTuple::new(
            "f00d::1".parse().unwrap(),
            "f00d::5e".parse().unwrap(),
            IPPROTO_TCP,
            Direction::Egress,
        )
        .with_ports(sport, 80)
    }

    #[test]
    fn test_hash_selection_is_stable() {
        let lb = LbMap::new();
        let s = svc(4);
        let h = flow_hash(&tuple(1000));
        let first = lb.select_backend(&s, h).unwrap();
        for _ in 0..10 {
            assert_eq!(lb.select_backend(&s, h).unwrap(), first);
        }
    }

    #[test]
    fn test_round_robin() {
        let lb = LbMap::with_selector(Box::new(RoundRobinSelector::default()));
        let s = svc(2);
        let a = lb.select_backend(&s, 0).unwrap();
        let b = lb.select_backend(&s, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(lb.select_backend(&s, 0).unwrap(), a);
    }

    #[test]
    fn test_no_backends() {
        let lb = LbMap::new();
        assert_eq!(lb.select_backend(&svc(0), 1), Err(DropReason::NoService));
    }

    #[test]
    fn test_extract_key() {
        let key = extract_key(&tuple(1000)).unwrap();
        assert_eq!(key.dport, 80);
        assert_eq!(key.address, "f00d::5e".parse::<IpAddr>().unwrap());

        let mut icmp = tuple(0);
        icmp.nexthdr = IPPROTO_ICMPV6;
        assert_eq!(extract_key(&icmp), Err(DropReason::UnknownL4));
    }

    #[test]
    fn test_tables() {
        let lb = LbMap::new();
        let key = extract_key(&tuple(1)).unwrap();
        lb.upsert_service(key, svc(1));
        assert_eq!(lb.lookup_service(&key).unwrap().rev_nat_index, 7);
        lb.remove_service(&key);
        assert!(lb.lookup_service(&key).is_none());

        let entry = RevNatEntry {
            address: key.address,
            port: 80,
        };
        lb.upsert_rev_nat(7, entry);
        assert_eq!(lb.lookup_rev_nat(7), Some(entry));
        lb.remove_rev_nat(7);
        assert_eq!(lb.lookup_rev_nat(7), None);
    }
}
