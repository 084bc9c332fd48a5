//! Security policy decisions.
//!
//! Rules are keyed by security label with optional port and protocol. A rule
//! without port and protocol is an L3 rule: it admits everything from (or
//! to) that label. CIDR lists admit addresses independent of their label.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};
use ipnet::IpNet;
use ipve_common::WORLD_ID;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::DropReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    Allow,
    Deny(DropReason),
    /// Reserved for proxy redirection. No rule produces it and callers
    /// treat it like [`PolicyVerdict::Allow`].
    Redirect { proxy_port: u16 },
}

impl PolicyVerdict {
    pub fn deny_reason(self) -> Option<DropReason> {
        match self {
            PolicyVerdict::Deny(reason) => Some(reason),
            PolicyVerdict::Allow | PolicyVerdict::Redirect { .. } => None,
        }
    }
}

/// `None` fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub label: Option<u32>,
    #[serde(default)]
    pub dport: Option<u16>,
    #[serde(default)]
    pub proto: Option<u8>,
}

impl PolicyRule {
    pub fn l3(label: u32) -> Self {
        Self {
            label: Some(label),
            ..Default::default()
        }
    }

    pub fn l4(label: u32, dport: u16, proto: u8) -> Self {
        Self {
            label: Some(label),
            dport: Some(dport),
            proto: Some(proto),
        }
    }

    pub fn is_l3(&self) -> bool {
        self.dport.is_none() && self.proto.is_none()
    }

    fn matches_label(&self, label: u32) -> bool {
        self.label.is_none_or(|l| l == label)
    }

    fn matches(&self, label: u32, dport: u16, proto: u8) -> bool {
        self.matches_label(label)
            && self.dport.is_none_or(|p| p == dport)
            && self.proto.is_none_or(|p| p == proto)
    }
}

/// How fragments are judged at ingress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentPolicy {
    /// Only L3 rules and CIDRs can admit a fragment.
    #[default]
    L3Only,
    /// Fragments are always denied.
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressPolicy {
    /// When false every destination is allowed.
    pub enforce: bool,
    pub rules: Vec<PolicyRule>,
    /// Destinations allowed regardless of label.
    pub cidrs: Vec<IpNet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressPolicy {
    pub rules: Vec<PolicyRule>,
    /// Sources allowed regardless of label.
    pub cidrs: Vec<IpNet>,
    pub fragments: FragmentPolicy,
}

/// Policy of one endpoint.
pub struct PolicyMap {
    egress: ArcSwap<EgressPolicy>,
    ingress: ArcSwapOption<IngressPolicy>,
    lookups: AtomicU64,
}

impl PolicyMap {
    pub fn new(egress: EgressPolicy, ingress: Option<IngressPolicy>) -> Self {
        Self {
            egress: ArcSwap::from_pointee(egress),
            ingress: ArcSwapOption::from(ingress.map(Arc::new)),
            lookups: AtomicU64::new(0),
        }
    }

    pub fn set_egress(&self, policy: EgressPolicy) {
        self.egress.store(Arc::new(policy));
    }

    pub fn set_ingress(&self, policy: Option<IngressPolicy>) {
        self.ingress.store(policy.map(Arc::new));
    }

    pub fn has_ingress(&self) -> bool {
        self.ingress.load().is_some()
    }

    /// Number of policy decisions made so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// May this endpoint send to `dst_label`?
    ///
    /// `daddr` is the destination after service translation.
    pub fn can_egress(&self, dst_label: u32, dport: u16, proto: u8, daddr: IpAddr) -> PolicyVerdict {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let policy = self.egress.load();
        if !policy.enforce {
            return PolicyVerdict::Allow;
        }
        if policy.rules.iter().any(|r| r.matches(dst_label, dport, proto)) {
            return PolicyVerdict::Allow;
        }
        if policy.cidrs.iter().any(|net| net.contains(&daddr)) {
            return PolicyVerdict::Allow;
        }

        trace!(dst_label, dport, proto, %daddr, "egress denied");
        if dst_label == WORLD_ID {
            PolicyVerdict::Deny(DropReason::PolicyCidr)
        } else {
            PolicyVerdict::Deny(DropReason::Policy)
        }
    }

    /// May `src_label` reach this endpoint?
    ///
    /// Without an ingress policy nothing is admitted; callers check
    /// [`PolicyMap::has_ingress`] first.
    pub fn can_access_ingress(
        &self,
        src_label: u32,
        dport: u16,
        proto: u8,
        saddr: IpAddr,
        is_fragment: bool,
    ) -> PolicyVerdict {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let Some(policy) = self.ingress.load_full() else {
            return PolicyVerdict::Deny(DropReason::Policy);
        };

        if is_fragment && policy.fragments == FragmentPolicy::Deny {
            trace!(src_label, "ingress fragment denied");
            return PolicyVerdict::Deny(DropReason::Policy);
        }

        if policy
            .rules
            .iter()
            .any(|r| r.is_l3() && r.matches_label(src_label))
        {
            return PolicyVerdict::Allow;
        }

        if !is_fragment && policy.rules.iter().any(|r| r.matches(src_label, dport, proto)) {
            return PolicyVerdict::Allow;
        }

        if policy.cidrs.iter().any(|net| net.contains(&saddr)) {
            return PolicyVerdict::Allow;
        }

        trace!(src_label, dport, proto, %saddr, is_fragment, "ingress denied");
        let label_known = policy
            .rules
            .iter()
            .any(|r| r.label == Some(src_label));
        if label_known {
            PolicyVerdict::Deny(DropReason::PolicyL4)
        } else {
            PolicyVerdict::Deny(DropReason::Policy)
        }
    }
}

impl Default for PolicyMap {
    fn default() -> Self {
        Self::new(EgressPolicy::default(), Some(IngressPolicy::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipve_common::{IPPROTO_TCP, IPPROTO_UDP};

    const WEB: u32 = 1000;
    const DB: u32 = 2000;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ingress(fragments: FragmentPolicy) -> PolicyMap {
        PolicyMap::new(
            EgressPolicy::default(),
            Some(IngressPolicy {
                rules: vec![PolicyRule::l3(WEB), PolicyRule::l4(DB, 5432, IPPROTO_TCP)],
                cidrs: vec!["10.9.0.0/16".parse().unwrap()],
                fragments,
            }),
        )
    }

    #[test]
    fn test_egress_not_enforced() {
        let p = PolicyMap::default();
        assert_eq!(
            p.can_egress(DB, 1, IPPROTO_TCP, ip("f00d::2")),
            PolicyVerdict::Allow
        );
        assert_eq!(p.lookups(), 1);
    }

    #[test]
    fn test_egress_rules_and_cidrs() {
        let p = PolicyMap::new(
            EgressPolicy {
                enforce: true,
                rules: vec![PolicyRule::l4(DB, 5432, IPPROTO_TCP)],
                cidrs: vec!["2001:db8::/32".parse().unwrap()],
            },
            None,
        );
        assert_eq!(p.can_egress(DB, 5432, IPPROTO_TCP, ip("f00d::2")), PolicyVerdict::Allow);
        assert_eq!(
            p.can_egress(DB, 5432, IPPROTO_UDP, ip("f00d::2")),
            PolicyVerdict::Deny(DropReason::Policy)
        );
        assert_eq!(
            p.can_egress(WORLD_ID, 443, IPPROTO_TCP, ip("2001:db8::1")),
            PolicyVerdict::Allow
        );
        assert_eq!(
            p.can_egress(WORLD_ID, 443, IPPROTO_TCP, ip("2001:db9::1")),
            PolicyVerdict::Deny(DropReason::PolicyCidr)
        );
    }

    #[test]
    fn test_ingress_l3_and_l4() {
        let p = ingress(FragmentPolicy::L3Only);
        let src = ip("f00d::9");
        assert_eq!(p.can_access_ingress(WEB, 1, IPPROTO_UDP, src, false), PolicyVerdict::Allow);
        assert_eq!(p.can_access_ingress(DB, 5432, IPPROTO_TCP, src, false), PolicyVerdict::Allow);
        assert_eq!(
            p.can_access_ingress(DB, 80, IPPROTO_TCP, src, false),
            PolicyVerdict::Deny(DropReason::PolicyL4)
        );
        assert_eq!(
            p.can_access_ingress(3000, 80, IPPROTO_TCP, src, false),
            PolicyVerdict::Deny(DropReason::Policy)
        );
    }

    #[test]
    fn test_ingress_cidr() {
        let p = ingress(FragmentPolicy::L3Only);
        assert_eq!(
            p.can_access_ingress(WORLD_ID, 80, IPPROTO_TCP, ip("10.9.1.1"), false),
            PolicyVerdict::Allow
        );
    }

    #[test]
    fn test_fragments() {
        let src = ip("f00d::9");
        let l3only = ingress(FragmentPolicy::L3Only);
        assert_eq!(l3only.can_access_ingress(WEB, 0, IPPROTO_TCP, src, true), PolicyVerdict::Allow);
        assert_eq!(
            l3only.can_access_ingress(DB, 5432, IPPROTO_TCP, src, true),
            PolicyVerdict::Deny(DropReason::PolicyL4)
        );

        let deny = ingress(FragmentPolicy::Deny);
        assert_eq!(
            deny.can_access_ingress(WEB, 0, IPPROTO_TCP, src, true),
            PolicyVerdict::Deny(DropReason::Policy)
        );
        assert_eq!(
            deny.can_access_ingress(DB, 5432, IPPROTO_TCP, src, true),
            PolicyVerdict::Deny(DropReason::Policy)
        );
    }

    #[test]
    fn test_redirect_is_not_a_deny() {
        assert_eq!(PolicyVerdict::Redirect { proxy_port: 15001 }.deny_reason(), None);
        assert_eq!(
            PolicyVerdict::Deny(DropReason::Policy).deny_reason(),
            Some(DropReason::Policy)
        );
    }
}
