//! Per-endpoint forwarding decisions for a virtual endpoint fabric.
//!
//! Given an Ethernet frame leaving or entering a local workload, the
//! datapath identifies the flow, optionally translates a service address to
//! a backend, consults connection tracking, enforces identity based policy
//! and picks a disposition: deliver to a local endpoint, to the host, to
//! the stack, or drop with a typed [`DropReason`]. ICMPv6 for the router
//! address is answered in place.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ipve_datapath::{Datapath, DatapathConfig, LogMonitor, Packet};
//!
//! let config = DatapathConfig::from_file("/etc/ipve/datapath.json")?;
//! let dp = Datapath::from_config(&config, Arc::new(LogMonitor))?;
//! let mut pkt = Packet::new(vec![0u8; 64]);
//! let disposition = dp.handle_egress(1, &mut pkt);
//! println!("{disposition:?}");
//! # Ok::<(), ipve_datapath::ConfigError>(())
//! ```

pub mod config;
pub mod conntrack;
pub mod context;
pub mod csum;
pub mod error;
pub mod family;
pub mod icmp6;
pub mod identity;
#[cfg(feature = "ipv4")]
pub mod ipv4;
pub mod ipv6;
pub mod l3;
pub mod lb;
pub mod lxc;
pub mod monitor;
pub mod packet;
pub mod policy;
pub mod tuple;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use config::{ConfigError, DatapathConfig, EndpointConfig, MacAddr, NodeConfig, ServiceConfig};
pub use conntrack::{ConnTrackCleaner, CtConfig, CtMaps, CtStatus};
pub use context::{Direction, PacketContext};
pub use error::{DropCategory, DropReason};
pub use lxc::{CallTable, Datapath, Disposition, Endpoint, Forward};
pub use monitor::{DropNotify, LogMonitor, Monitor, TraceNotify};
pub use packet::Packet;
pub use policy::{EgressPolicy, FragmentPolicy, IngressPolicy, PolicyRule, PolicyVerdict};
