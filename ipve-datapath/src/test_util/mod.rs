//! Helpers shared by unit and integration tests.

pub mod packets;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ipve_common::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

use crate::config::{EndpointConfig, HostConfig, MacAddr, NodeConfig};
use crate::conntrack::{Clock, CtConfig};
use crate::lxc::Datapath;
use crate::monitor::{DropNotify, Monitor, TraceNotify};
use crate::policy::{EgressPolicy, IngressPolicy, PolicyRule};

pub const ROUTER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
pub const HOST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0xfe];
pub const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0x01, 0x01];
pub const SERVER_MAC: [u8; 6] = [0x02, 0, 0, 0, 0x02, 0x02];

pub const HOST_IFINDEX: u32 = 2;
pub const CLIENT_ID: u16 = 1;
pub const CLIENT_IFINDEX: u32 = 10;
pub const CLIENT_LABEL: u32 = 1000;
pub const SERVER_ID: u16 = 2;
pub const SERVER_IFINDEX: u32 = 20;
pub const SERVER_LABEL: u32 = 2000;

pub const CLIENT_V6: Ipv6Addr = Ipv6Addr::new(0xf00d, 0, 0, 0, 0, 0, 0, 1);
pub const SERVER_V6: Ipv6Addr = Ipv6Addr::new(0xf00d, 0, 0, 0, 0, 0, 0, 2);
pub const ROUTER_V6: Ipv6Addr = Ipv6Addr::new(0xf00d, 0, 0, 0, 0, 0, 0, 0xfffe);
pub const HOST_V6: Ipv6Addr = Ipv6Addr::new(0xf00d, 0, 0, 0, 0, 0, 0, 0xff);
pub const REMOTE_V6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
pub const CLIENT_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const SERVER_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const HOST_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
pub const REMOTE_V4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

/// Clock driven by the test.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Monitor that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    drops: Mutex<Vec<DropNotify>>,
    traces: Mutex<Vec<TraceNotify>>,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drops(&self) -> Vec<DropNotify> {
        self.drops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn traces(&self) -> Vec<TraceNotify> {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.drops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Monitor for RecordingMonitor {
    fn drop_notify(&self, event: &DropNotify) {
        self.drops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*event);
    }

    fn trace_notify(&self, event: &TraceNotify) {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*event);
    }
}

/// Node with a host interface and one host address per family.
pub fn node_config() -> NodeConfig {
    NodeConfig {
        router_mac: MacAddr(ROUTER_MAC),
        host_addresses: vec![IpAddr::V6(HOST_V6), IpAddr::V4(HOST_V4)],
        host: Some(HostConfig {
            ifindex: HOST_IFINDEX,
            mac: MacAddr(HOST_MAC),
        }),
        router_ipv6: Some(ROUTER_V6),
        conntrack: CtConfig::default(),
    }
}

/// Client endpoint: egress not enforced, admits nothing new on ingress.
pub fn client_config() -> EndpointConfig {
    EndpointConfig {
        lxc_id: CLIENT_ID,
        seclabel: CLIENT_LABEL,
        ifindex: CLIENT_IFINDEX,
        mac: MacAddr(CLIENT_MAC),
        ipv6: CLIENT_V6,
        ipv4: Some(CLIENT_V4),
        skip_policy_ingress: false,
        egress: EgressPolicy::default(),
        ingress: Some(IngressPolicy::default()),
    }
}

/// Server endpoint: admits TCP/80, UDP and ICMP from the client.
pub fn server_config() -> EndpointConfig {
    let from_client = |proto| PolicyRule {
        label: Some(CLIENT_LABEL),
        dport: None,
        proto: Some(proto),
    };
    EndpointConfig {
        lxc_id: SERVER_ID,
        seclabel: SERVER_LABEL,
        ifindex: SERVER_IFINDEX,
        mac: MacAddr(SERVER_MAC),
        ipv6: SERVER_V6,
        ipv4: Some(SERVER_V4),
        skip_policy_ingress: false,
        egress: EgressPolicy::default(),
        ingress: Some(IngressPolicy {
            rules: vec![
                PolicyRule::l4(CLIENT_LABEL, 80, IPPROTO_TCP),
                from_client(IPPROTO_UDP),
                from_client(IPPROTO_ICMPV6),
                from_client(IPPROTO_ICMP),
            ],
            ..Default::default()
        }),
    }
}

/// A datapath with the client and server endpoints attached.
pub struct TestBed {
    pub dp: Datapath,
    pub monitor: Arc<RecordingMonitor>,
    pub clock: Arc<ManualClock>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_node(node_config())
    }

    pub fn with_node(node: NodeConfig) -> Self {
        let monitor = Arc::new(RecordingMonitor::new());
        let clock = Arc::new(ManualClock::new(1000));
        let dp = Datapath::with_clock(&node, monitor.clone(), clock.clone());
        dp.add_endpoint(&client_config());
        dp.add_endpoint(&server_config());
        Self { dp, monitor, clock }
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}
