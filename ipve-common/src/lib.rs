#![no_std]

//! Wire-level constants shared between the endpoint datapath and its tooling.
//!
//! Numeric values are part of the contract with the surrounding dispatch
//! framework and with anything decoding drop/trace events, so they must not be
//! renumbered.

// Header sizes
pub const ETH_HLEN: usize = 14;
pub const ETH_ALEN: usize = 6;
pub const IPV4_MIN_HLEN: usize = 20;
pub const IPV6_HLEN: usize = 40;
pub const ICMP_HLEN: usize = 8;
pub const TCP_MIN_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;

// EtherTypes
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const ETH_P_ARP: u16 = 0x0806;

// IP protocols
pub const IPPROTO_HOPOPTS: u8 = 0;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ROUTING: u8 = 43;
pub const IPPROTO_FRAGMENT: u8 = 44;
pub const IPPROTO_ESP: u8 = 50;
pub const IPPROTO_AH: u8 = 51;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_NONE: u8 = 59;
pub const IPPROTO_DSTOPTS: u8 = 60;

// TCP flags
pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

/// Maximum number of IPv6 extension headers walked before giving up.
pub const IPV6_MAX_HEADERS: usize = 4;

// ICMP types
pub const ICMP_ECHOREPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAMETERPROB: u8 = 12;

pub const ICMPV6_DEST_UNREACH: u8 = 1;
pub const ICMPV6_PKT_TOOBIG: u8 = 2;
pub const ICMPV6_TIME_EXCEED: u8 = 3;
pub const ICMPV6_PARAMPROB: u8 = 4;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

// TC actions returned to the dispatch framework
pub const TC_ACT_OK: i32 = 0;
pub const TC_ACT_SHOT: i32 = 2;

// Drop reasons (negative return codes)
pub const DROP_INVALID_SIP: i32 = -132;
pub const DROP_POLICY: i32 = -133;
pub const DROP_INVALID: i32 = -134;
pub const DROP_UNKNOWN_L3: i32 = -139;
pub const DROP_MISSED_TAIL_CALL: i32 = -140;
pub const DROP_WRITE_ERROR: i32 = -141;
pub const DROP_UNKNOWN_L4: i32 = -142;
pub const DROP_CSUM_L3: i32 = -153;
pub const DROP_CSUM_L4: i32 = -154;
pub const DROP_INVALID_EXTHDR: i32 = -156;
pub const DROP_NO_SERVICE: i32 = -158;
pub const DROP_POLICY_L4: i32 = -159;
pub const DROP_POLICY_CIDR: i32 = -162;
pub const DROP_UNKNOWN_CT: i32 = -163;
pub const DROP_HOST_UNREACHABLE: i32 = -164;
pub const DROP_NO_CONFIG: i32 = -165;
pub const DROP_TTL_EXCEEDED: i32 = -166;

// Connection tracking lookup results
pub const CT_NEW: u8 = 0;
pub const CT_ESTABLISHED: u8 = 1;
pub const CT_REPLY: u8 = 2;
pub const CT_RELATED: u8 = 3;

// Connection tracking tuple flags
pub const TUPLE_F_OUT: u8 = 0;
pub const TUPLE_F_IN: u8 = 1;
pub const TUPLE_F_RELATED: u8 = 2;

// Default connection lifetimes (seconds)
pub const CT_CONNECTION_LIFETIME_TCP: u32 = 21600;
pub const CT_CONNECTION_LIFETIME_NONTCP: u32 = 60;
pub const CT_CLOSE_TIMEOUT: u32 = 10;

// Default table sizes
pub const CT_MAP_SIZE_TCP: u32 = 256 * 1024;
pub const CT_MAP_SIZE_ANY: u32 = 64 * 1024;

// Trace observation points
pub const TRACE_TO_LXC: u8 = 0;
pub const TRACE_TO_PROXY: u8 = 1;
pub const TRACE_TO_HOST: u8 = 2;
pub const TRACE_TO_STACK: u8 = 3;
pub const TRACE_FROM_LXC: u8 = 5;

/// Capture length hint attached to trace events of new connections.
pub const TRACE_PAYLOAD_LEN: u32 = 128;

// Metric directions
pub const METRIC_INGRESS: u8 = 1;
pub const METRIC_EGRESS: u8 = 2;

/// Metrics reason for forwarded (not dropped) packets.
pub const REASON_FORWARDED: u8 = 0;

// Reserved security identities
pub const HOST_ID: u32 = 1;
pub const WORLD_ID: u32 = 2;

// Endpoint descriptor flags
pub const ENDPOINT_F_HOST: u8 = 1;

// Per-endpoint configuration flags
pub const EP_F_SKIP_POLICY_INGRESS: u32 = 1;

/// Key of the metrics map.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetricsKey {
    /// 0 for forwarded packets, otherwise the negated drop code
    pub reason: u8,
    /// METRIC_INGRESS or METRIC_EGRESS
    pub dir: u8,
    _pad: [u8; 2],
}

impl MetricsKey {
    pub const fn new(reason: u8, dir: u8) -> Self {
        Self {
            reason,
            dir,
            _pad: [0; 2],
        }
    }
}

/// Value of the metrics map.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsValue {
    pub count: u64,
    pub bytes: u64,
}
