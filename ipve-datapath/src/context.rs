//! Per-packet scratch state handed from stage to stage.

use ipve_common::{METRIC_EGRESS, METRIC_INGRESS, TUPLE_F_IN, TUPLE_F_OUT};

/// Traffic direction relative to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Leaving the endpoint.
    Egress,
    /// Entering the endpoint.
    Ingress,
}

impl Direction {
    pub const fn reverse(self) -> Self {
        match self {
            Direction::Egress => Direction::Ingress,
            Direction::Ingress => Direction::Egress,
        }
    }

    /// Direction bit stored in a flow tuple.
    pub const fn tuple_flag(self) -> u8 {
        match self {
            Direction::Egress => TUPLE_F_OUT,
            Direction::Ingress => TUPLE_F_IN,
        }
    }

    pub const fn metric_dir(self) -> u8 {
        match self {
            Direction::Egress => METRIC_EGRESS,
            Direction::Ingress => METRIC_INGRESS,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Direction::Egress => 0,
            Direction::Ingress => 1,
        }
    }
}

/// Scratch area carried alongside a packet between stages.
///
/// The egress entry point clears it; local delivery fills in `src_label` and
/// `ifindex` before handing the packet to the destination's ingress stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketContext {
    /// Target interface index.
    pub ifindex: u32,
    /// Security label of the sender.
    pub src_label: u32,
    /// Set when a reply or related packet already bypassed policy.
    pub policy_skip: bool,
}

impl PacketContext {
    /// Context as set up by an upstream stage delivering to an endpoint.
    pub fn ingress(src_label: u32, ifindex: u32) -> Self {
        Self {
            ifindex,
            src_label,
            policy_skip: false,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn mark_policy_skip(&mut self) {
        self.policy_skip = true;
    }

    pub fn clear_policy_skip(&mut self) {
        self.policy_skip = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_flags() {
        assert_eq!(Direction::Egress.tuple_flag(), TUPLE_F_OUT);
        assert_eq!(Direction::Egress.reverse().tuple_flag(), TUPLE_F_IN);
        assert_eq!(Direction::Ingress.metric_dir(), METRIC_INGRESS);
    }

    #[test]
    fn test_clear() {
        let mut ctx = PacketContext::ingress(42, 7);
        ctx.mark_policy_skip();
        ctx.clear();
        assert_eq!(ctx, PacketContext::default());
    }
}
