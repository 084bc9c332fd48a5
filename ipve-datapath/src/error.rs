//! Drop reasons.
//!
//! Every fatal outcome of the datapath is a typed [`DropReason`] carrying a
//! stable numeric code. Nothing here is recovered locally: a packet either
//! completes with a disposition or is dropped with one of these.

use ipve_common::*;
use thiserror::Error;

/// Why a packet was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DropReason {
    #[error("invalid packet")]
    InvalidPacket,

    #[error("invalid source address")]
    InvalidSourceAddress,

    #[error("unknown L4 protocol")]
    UnknownL4,

    #[error("unknown L3 protocol")]
    UnknownL3Protocol,

    #[error("invalid IPv6 extension header")]
    InvalidExtensionHeader,

    #[error("unknown connection tracking state")]
    UnknownConnTrackState,

    #[error("write error")]
    WriteError,

    #[error("L3 checksum error")]
    ChecksumL3,

    #[error("L4 checksum error")]
    ChecksumL4,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("no endpoint configuration")]
    NoConfig,

    #[error("missed stage dispatch")]
    MissedStageDispatch,

    #[error("service has no backends")]
    NoService,

    #[error("TTL exceeded")]
    TtlExceeded,

    #[error("policy denied")]
    Policy,

    #[error("policy denied (L4)")]
    PolicyL4,

    #[error("policy denied (CIDR)")]
    PolicyCidr,
}

/// Coarse classification used by operators to separate security denials
/// from malformed input and infrastructure faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCategory {
    Malformed,
    Spoofing,
    PolicyDenied,
    Resource,
    MissingConfig,
}

impl DropReason {
    /// Numeric drop code reported to the monitor and the metrics map.
    pub const fn code(self) -> i32 {
        match self {
            DropReason::InvalidPacket => DROP_INVALID,
            DropReason::InvalidSourceAddress => DROP_INVALID_SIP,
            DropReason::UnknownL4 => DROP_UNKNOWN_L4,
            DropReason::UnknownL3Protocol => DROP_UNKNOWN_L3,
            DropReason::InvalidExtensionHeader => DROP_INVALID_EXTHDR,
            DropReason::UnknownConnTrackState => DROP_UNKNOWN_CT,
            DropReason::WriteError => DROP_WRITE_ERROR,
            DropReason::ChecksumL3 => DROP_CSUM_L3,
            DropReason::ChecksumL4 => DROP_CSUM_L4,
            DropReason::HostUnreachable => DROP_HOST_UNREACHABLE,
            DropReason::NoConfig => DROP_NO_CONFIG,
            DropReason::MissedStageDispatch => DROP_MISSED_TAIL_CALL,
            DropReason::NoService => DROP_NO_SERVICE,
            DropReason::TtlExceeded => DROP_TTL_EXCEEDED,
            DropReason::Policy => DROP_POLICY,
            DropReason::PolicyL4 => DROP_POLICY_L4,
            DropReason::PolicyCidr => DROP_POLICY_CIDR,
        }
    }

    /// Reverse of [`DropReason::code`].
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            DROP_INVALID => DropReason::InvalidPacket,
            DROP_INVALID_SIP => DropReason::InvalidSourceAddress,
            DROP_UNKNOWN_L4 => DropReason::UnknownL4,
            DROP_UNKNOWN_L3 => DropReason::UnknownL3Protocol,
            DROP_INVALID_EXTHDR => DropReason::InvalidExtensionHeader,
            DROP_UNKNOWN_CT => DropReason::UnknownConnTrackState,
            DROP_WRITE_ERROR => DropReason::WriteError,
            DROP_CSUM_L3 => DropReason::ChecksumL3,
            DROP_CSUM_L4 => DropReason::ChecksumL4,
            DROP_HOST_UNREACHABLE => DropReason::HostUnreachable,
            DROP_NO_CONFIG => DropReason::NoConfig,
            DROP_MISSED_TAIL_CALL => DropReason::MissedStageDispatch,
            DROP_NO_SERVICE => DropReason::NoService,
            DROP_TTL_EXCEEDED => DropReason::TtlExceeded,
            DROP_POLICY => DropReason::Policy,
            DROP_POLICY_L4 => DropReason::PolicyL4,
            DROP_POLICY_CIDR => DropReason::PolicyCidr,
            _ => return None,
        })
    }

    /// Reason byte stored in the metrics map.
    pub const fn metrics_reason(self) -> u8 {
        (-self.code()) as u8
    }

    pub const fn category(self) -> DropCategory {
        match self {
            DropReason::InvalidSourceAddress => DropCategory::Spoofing,
            DropReason::Policy | DropReason::PolicyL4 | DropReason::PolicyCidr => {
                DropCategory::PolicyDenied
            }
            DropReason::WriteError
            | DropReason::ChecksumL3
            | DropReason::ChecksumL4
            | DropReason::MissedStageDispatch
            | DropReason::HostUnreachable
            | DropReason::NoService
            | DropReason::UnknownConnTrackState => DropCategory::Resource,
            DropReason::NoConfig => DropCategory::MissingConfig,
            DropReason::InvalidPacket
            | DropReason::UnknownL4
            | DropReason::UnknownL3Protocol
            | DropReason::InvalidExtensionHeader
            | DropReason::TtlExceeded => DropCategory::Malformed,
        }
    }

    pub const fn is_policy_deny(self) -> bool {
        matches!(self.category(), DropCategory::PolicyDenied)
    }
}

// Header readers only fail on short buffers.
impl From<smoltcp::wire::Error> for DropReason {
    fn from(_: smoltcp::wire::Error) -> Self {
        DropReason::InvalidPacket
    }
}

pub type Result<T> = std::result::Result<T, DropReason>;
