//! Node and endpoint configuration.
//!
//! Loaded from a JSON file by the binary; tests usually build the structs
//! directly. [`DatapathConfig::validate`] rejects configurations the
//! datapath cannot run with before any table is populated.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conntrack::CtConfig;
use crate::identity::RemoteEndpointInfo;
use crate::lb::Backend;
use crate::policy::{EgressPolicy, IngressPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("duplicate endpoint id {0}")]
    DuplicateEndpoint(u16),

    #[error("endpoint id 0 is reserved")]
    ReservedEndpointId,

    #[error("address {0} is assigned more than once")]
    DuplicateAddress(IpAddr),

    #[error("service {0} uses reverse NAT index 0")]
    ZeroRevNatIndex(IpAddr),

    #[error("service {frontend} has backend {backend} of another address family")]
    BackendFamilyMismatch { frontend: IpAddr, backend: IpAddr },

    #[error("conntrack {0} must be non-zero")]
    InvalidConntrack(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Ethernet address, written as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(ConfigError::InvalidMac(s.to_string()));
        }
        let mut mac = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            mac[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ConfigError::InvalidMac(s.to_string()))?;
        }
        Ok(MacAddr(mac))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Host-facing interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub ifindex: u32,
    pub mac: MacAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub router_mac: MacAddr,
    /// Addresses owned by the host itself.
    #[serde(default)]
    pub host_addresses: Vec<IpAddr>,
    /// Without a host interface, traffic to host addresses is dropped.
    #[serde(default)]
    pub host: Option<HostConfig>,
    /// Address the router answers ICMPv6 echo and neighbour solicitations for.
    #[serde(default)]
    pub router_ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub conntrack: CtConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub lxc_id: u16,
    pub seclabel: u32,
    pub ifindex: u32,
    pub mac: MacAddr,
    pub ipv6: Ipv6Addr,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub skip_policy_ingress: bool,
    #[serde(default)]
    pub egress: EgressPolicy,
    /// Without an ingress policy every packet to the endpoint is dropped.
    #[serde(default)]
    pub ingress: Option<IngressPolicy>,
}

impl EndpointConfig {
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        std::iter::once(IpAddr::V6(self.ipv6)).chain(self.ipv4.map(IpAddr::V4))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub frontend: IpAddr,
    pub port: u16,
    pub rev_nat_index: u16,
    #[serde(default)]
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpCacheConfig {
    pub prefix: IpNet,
    #[serde(flatten)]
    pub info: RemoteEndpointInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatapathConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub ipcache: Vec<IpCacheConfig>,
}

impl DatapathConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ct = &self.node.conntrack;
        if ct.tcp_capacity == 0 || ct.any_capacity == 0 {
            return Err(ConfigError::InvalidConntrack("capacity"));
        }
        if ct.tcp_lifetime == 0 || ct.nontcp_lifetime == 0 || ct.close_timeout == 0 {
            return Err(ConfigError::InvalidConntrack("lifetime"));
        }

        let mut ids = HashSet::new();
        let mut addrs = HashSet::new();
        let router = self.node.router_ipv6.map(IpAddr::V6);
        for addr in self.node.host_addresses.iter().chain(router.as_ref()) {
            if !addrs.insert(*addr) {
                return Err(ConfigError::DuplicateAddress(*addr));
            }
        }
        for ep in &self.endpoints {
            if ep.lxc_id == 0 {
                return Err(ConfigError::ReservedEndpointId);
            }
            if !ids.insert(ep.lxc_id) {
                return Err(ConfigError::DuplicateEndpoint(ep.lxc_id));
            }
            for addr in ep.addresses() {
                if !addrs.insert(addr) {
                    return Err(ConfigError::DuplicateAddress(addr));
                }
            }
        }

        for svc in &self.services {
            if svc.rev_nat_index == 0 {
                return Err(ConfigError::ZeroRevNatIndex(svc.frontend));
            }
            for backend in &svc.backends {
                if backend.address.is_ipv4() != svc.frontend.is_ipv4() {
                    return Err(ConfigError::BackendFamilyMismatch {
                        frontend: svc.frontend,
                        backend: backend.address,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "node": { "router_mac": "02:00:00:00:00:01" },
        "endpoints": [
            {
                "lxc_id": 1,
                "seclabel": 1000,
                "ifindex": 10,
                "mac": "02:00:00:00:01:01",
                "ipv6": "f00d::1"
            }
        ]
    }"#;

    #[test]
    fn test_mac_roundtrip() {
        let mac: MacAddr = "02:aa:00:00:ff:01".parse().unwrap();
        assert_eq!(mac.0, [0x02, 0xaa, 0, 0, 0xff, 0x01]);
        assert_eq!(mac.to_string(), "02:aa:00:00:ff:01");
    }

    #[test]
    fn test_mac_invalid() {
        assert!("02:aa:00".parse::<MacAddr>().is_err());
        assert!("zz:aa:00:00:ff:01".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_defaults() {
        let cfg: DatapathConfig = serde_json::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.node.conntrack, CtConfig::default());
        assert!(cfg.node.host.is_none());
        assert!(cfg.node.router_ipv6.is_none());

        let ep = &cfg.endpoints[0];
        assert!(!ep.skip_policy_ingress);
        assert!(ep.ingress.is_none());
        assert!(!ep.egress.enforce);
        assert_eq!(ep.addresses().count(), 1);
    }

    #[test]
    fn test_duplicate_address() {
        let mut cfg: DatapathConfig = serde_json::from_str(MINIMAL).unwrap();
        let mut other = cfg.endpoints[0].clone();
        other.lxc_id = 2;
        cfg.endpoints.push(other);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateAddress(_))
        ));
    }

    #[test]
    fn test_router_address_taken_by_endpoint() {
        let mut cfg: DatapathConfig = serde_json::from_str(MINIMAL).unwrap();
        cfg.node.router_ipv6 = Some("f00d::1".parse().unwrap());
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateAddress(addr)) if addr == "f00d::1".parse::<IpAddr>().unwrap()
        ));
    }

    #[test]
    fn test_duplicate_endpoint() {
        let mut cfg: DatapathConfig = serde_json::from_str(MINIMAL).unwrap();
        let mut other = cfg.endpoints[0].clone();
        other.ipv6 = "f00d::2".parse().unwrap();
        cfg.endpoints.push(other);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateEndpoint(1))
        ));
    }

    #[test]
    fn test_service_family_mismatch() {
        let mut cfg: DatapathConfig = serde_json::from_str(MINIMAL).unwrap();
        cfg.services.push(ServiceConfig {
            frontend: "f00d::100".parse().unwrap(),
            port: 80,
            rev_nat_index: 1,
            backends: vec![Backend {
                address: "10.0.0.1".parse().unwrap(),
                port: 80,
            }],
        });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BackendFamilyMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_capacity() {
        let mut cfg: DatapathConfig = serde_json::from_str(MINIMAL).unwrap();
        cfg.node.conntrack.any_capacity = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidConntrack("capacity"))
        ));
    }
}
