//! Endpoint and identity resolution.
//!
//! [`EndpointMap`] answers "is this address managed on this node" with an
//! exact match. [`IpCache`] maps remote prefixes to security labels using
//! longest prefix match; anything it does not know is the world.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use ipve_common::{ENDPOINT_F_HOST, WORLD_ID};
use prefix_trie::PrefixMap;
use serde::{Deserialize, Serialize};

/// Locally managed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub ifindex: u32,
    pub lxc_id: u16,
    pub mac: [u8; 6],
    /// Router MAC used as source when delivering to this endpoint.
    pub node_mac: [u8; 6],
    pub flags: u8,
}

impl EndpointInfo {
    pub fn is_host(&self) -> bool {
        self.flags & ENDPOINT_F_HOST != 0
    }
}

/// Exact-match table of local endpoint addresses.
pub struct EndpointMap {
    map: ArcSwap<HashMap<IpAddr, EndpointInfo>>,
}

impl EndpointMap {
    pub fn new() -> Self {
        Self {
            map: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    pub fn insert(&self, addr: IpAddr, info: EndpointInfo) {
        let mut map = (**self.map.load()).clone();
        map.insert(addr, info);
        self.map.store(Arc::new(map));
    }

    pub fn remove(&self, addr: &IpAddr) {
        let mut map = (**self.map.load()).clone();
        map.remove(addr);
        self.map.store(Arc::new(map));
    }

    /// Remove every address that belongs to endpoint `lxc_id`.
    pub fn remove_endpoint(&self, lxc_id: u16) {
        let mut map = (**self.map.load()).clone();
        map.retain(|_, info| info.is_host() || info.lxc_id != lxc_id);
        self.map.store(Arc::new(map));
    }

    pub fn lookup(&self, addr: impl Into<IpAddr>) -> Option<EndpointInfo> {
        self.map.load().get(&addr.into()).copied()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }
}

impl Default for EndpointMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of a remote prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpointInfo {
    pub sec_label: u32,
    #[serde(default)]
    pub tunnel_endpoint: Option<Ipv4Addr>,
}

#[derive(Clone)]
struct IpCacheTables {
    v4: PrefixMap<Ipv4Net, RemoteEndpointInfo>,
    v6: PrefixMap<Ipv6Net, RemoteEndpointInfo>,
}

/// Prefix to identity table.
pub struct IpCache {
    tables: ArcSwap<IpCacheTables>,
}

impl IpCache {
    pub fn new() -> Self {
        Self {
            tables: ArcSwap::from_pointee(IpCacheTables {
                v4: PrefixMap::new(),
                v6: PrefixMap::new(),
            }),
        }
    }

    pub fn upsert(&self, prefix: IpNet, info: RemoteEndpointInfo) {
        let mut tables = (**self.tables.load()).clone();
        match prefix.trunc() {
            IpNet::V4(net) => {
                tables.v4.insert(net, info);
            }
            IpNet::V6(net) => {
                tables.v6.insert(net, info);
            }
        }
        self.tables.store(Arc::new(tables));
    }

    pub fn remove(&self, prefix: &IpNet) {
        let mut tables = (**self.tables.load()).clone();
        match prefix.trunc() {
            IpNet::V4(net) => {
                tables.v4.remove(&net);
            }
            IpNet::V6(net) => {
                tables.v6.remove(&net);
            }
        }
        self.tables.store(Arc::new(tables));
    }

    /// Longest prefix match on `addr`.
    pub fn lookup(&self, addr: impl Into<IpAddr>) -> Option<RemoteEndpointInfo> {
        let tables = self.tables.load();
        match addr.into() {
            IpAddr::V4(addr) => {
                let key = Ipv4Net::new(addr, 32).ok()?;
                tables.v4.get_lpm(&key).map(|(_, info)| *info)
            }
            IpAddr::V6(addr) => {
                let key = Ipv6Net::new(addr, 128).ok()?;
                tables.v6.get_lpm(&key).map(|(_, info)| *info)
            }
        }
    }

    /// Security label of `addr`; unknown addresses and label 0 are the world.
    pub fn resolve_label(&self, addr: impl Into<IpAddr>) -> u32 {
        match self.lookup(addr) {
            Some(info) if info.sec_label != 0 => info.sec_label,
            _ => WORLD_ID,
        }
    }
}

impl Default for IpCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(label: u32) -> RemoteEndpointInfo {
        RemoteEndpointInfo {
            sec_label: label,
            tunnel_endpoint: None,
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let cache = IpCache::new();
        cache.upsert("f00d::/16".parse().unwrap(), info(100));
        cache.upsert("f00d:1::/32".parse().unwrap(), info(200));
        cache.upsert("10.0.0.0/8".parse().unwrap(), info(300));

        assert_eq!(cache.resolve_label("f00d::1".parse::<IpAddr>().unwrap()), 100);
        assert_eq!(cache.resolve_label("f00d:1::1".parse::<IpAddr>().unwrap()), 200);
        assert_eq!(cache.resolve_label(Ipv4Addr::new(10, 1, 2, 3)), 300);
    }

    #[test]
    fn test_world_fallback() {
        let cache = IpCache::new();
        cache.upsert("10.0.0.0/8".parse().unwrap(), info(0));
        assert_eq!(cache.resolve_label(Ipv4Addr::new(10, 0, 0, 1)), WORLD_ID);
        assert_eq!(cache.resolve_label(Ipv4Addr::new(192, 0, 2, 1)), WORLD_ID);
    }

    #[test]
    fn test_remove_prefix() {
        let cache = IpCache::new();
        let net: IpNet = "f00d::/16".parse().unwrap();
        cache.upsert(net, info(100));
        cache.remove(&net);
        assert!(cache.lookup("f00d::1".parse::<IpAddr>().unwrap()).is_none());
    }

    #[test]
    fn test_endpoint_map() {
        let map = EndpointMap::new();
        let addr: IpAddr = "f00d::1".parse().unwrap();
        let ep = EndpointInfo {
            ifindex: 10,
            lxc_id: 1,
            mac: [2; 6],
            node_mac: [1; 6],
            flags: 0,
        };
        map.insert(addr, ep);
        assert_eq!(map.lookup(addr), Some(ep));
        assert!(!ep.is_host());

        map.remove_endpoint(1);
        assert!(map.is_empty());
    }
}
